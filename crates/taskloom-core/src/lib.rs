pub mod cancellation;
pub mod config;
pub mod edit_review;
pub mod error;
pub mod event_bus;
pub mod file_edits;
pub mod git;
pub mod model;
pub mod persistence;
pub mod sanitizer;
pub mod stream_state;
pub mod task_loop;
pub mod tools;
pub mod worktree_pool;

pub use cancellation::*;
pub use config::*;
pub use edit_review::*;
pub use error::*;
pub use event_bus::*;
pub use file_edits::*;
pub use git::*;
pub use model::*;
pub use persistence::*;
pub use sanitizer::*;
pub use stream_state::*;
pub use task_loop::*;
pub use tools::*;
pub use worktree_pool::*;
