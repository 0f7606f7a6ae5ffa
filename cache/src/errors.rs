use thiserror::Error;

/// Errors surfaced to clients of the file service.
///
/// Remote-side failures ([Error::FileChanged], [Error::RemoteIo]) are
/// recorded sticky on the affected inode via
/// [crate::inodes::InodeTable::mark_unreadable] and returned from all
/// subsequent reads and listings until the inode is replaced (by a
/// `forget`) or destroyed. Path-resolution and handle errors are
/// recoverable and have no side effects.
///
/// Invariant violations (negative refcounts, unknown inodes or blocks
/// in internal calls, unexpected completions) are not represented
/// here; they panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Path component not present in its directory.
    #[error("invalid name")]
    InvalidName,

    /// Referenced inode does not exist.
    #[error("invalid inode")]
    InvalidInode,

    /// Operation requires a directory; the target is a file.
    #[error("not a directory")]
    IsNotDir,

    /// Operation requires a file; the target is a directory.
    #[error("is a directory")]
    IsDir,

    /// Unknown file descriptor.
    #[error("invalid handle")]
    InvalidHandle,

    /// The remote object no longer matches the version it was listed
    /// with.
    #[error("remote file changed (expected etag {0})")]
    FileChanged(String),

    /// Transport-layer failure reported by the remote provider.
    #[error("remote i/o error: {0}")]
    RemoteIo(String),

    /// Local i/o failure on a cached block.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
