pub mod edit;
pub mod event;
pub mod message;
pub mod worktree;

pub use edit::*;
pub use event::*;
pub use message::*;
pub use worktree::*;
