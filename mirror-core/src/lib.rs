pub mod convert;
pub mod github;
pub mod merge;
pub mod notes;
pub mod repository;

pub use convert::ConvertError;
pub use notes::{Comment, CommentThread, Report, Request, Review};
pub use repository::Repository;
