pub mod comment;
pub mod control;
pub mod frame;
pub mod store;

pub use comment::*;
pub use control::*;
pub use frame::*;
pub use store::{CommentStore, SqliteStore, StoreError};
