use thiserror::Error;

/// Error types for the yetty card subsystem
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Named entity is absent: shm object, card name, card id, buffer scope
    #[error("not found: {0}")]
    NotFound(String),

    /// A live owner already holds the name (shm region creation race;
    /// named-card collisions warn and overwrite instead)
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed command, missing flag, shrink in grow, bad parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation exceeds the committed reservation or the atlas is exhausted
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// Texture exceeds the maximum atlas dimension
    #[error("too large: {0}")]
    TooLarge(String),

    /// Malformed RPC frame or unexpected msgpack type
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Poisoned shm region or disposed manager
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Operating system call failure (mmap, socket, shm_open, ...)
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}

/// Result type for yetty card subsystem operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Last OS error with a call-site label, e.g. `Error::os("shm_open")`.
    pub(crate) fn os(call: &str) -> Self {
        let err = std::io::Error::last_os_error();
        Error::Os(std::io::Error::new(err.kind(), format!("{call}: {err}")))
    }
}
