mod error;
mod file_system;
mod s3;
mod storage;

// forwarding declarations
pub use error::{BoxError, Result, StorageError};
pub use file_system::FileSystem;
pub use s3::S3;
pub use storage::{cancel_after, Deadline, Sink, Source, Storage};

pub(crate) use storage::cancellable;
