use thiserror::Error;

/// Reasons a requested file name cannot be mapped onto the served directory.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestPathError {
    #[error("Requested file name is empty")]
    Empty,
    #[error("Requested file name leaves the served directory: {0}")]
    EscapesRoot(String),
    #[error("Requested file name is {len} bytes, at most {max} fit in a GET")]
    TooLong { len: usize, max: usize },
}
