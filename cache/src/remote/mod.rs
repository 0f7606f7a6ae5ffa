//! The remote provider contract and its backends.
//!
//! The cache engine consumes exactly two operations: a listing of a
//! directory's immediate children and a bounded ranged reader pinned
//! to the etag the object was listed with.

mod local;
mod object_store;

pub use self::local::DirRemote;
pub use self::object_store::ObjectStoreRemote;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use url::Url;

use crate::errors::Error as CacheError;

/// A single immediate child of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// A single path component.
    pub name: String,
    pub is_dir: bool,
    /// Opaque version token, validated on [RemoteProvider::open_range].
    pub etag: String,
    pub size: u64,
}

/// Failures reported by a remote provider.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The object no longer matches the etag it was listed with.
    #[error("remote object changed (expected etag {0})")]
    Changed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<RemoteError> for CacheError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Changed(etag) => CacheError::FileChanged(etag),
            RemoteError::Io(e) => CacheError::RemoteIo(e.to_string()),
        }
    }
}

/// A bounded byte stream positioned at the requested offset. Yields
/// at most the requested number of bytes; fewer when the object ends
/// earlier.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// The contract the cache engine consumes. Paths use `/` separators,
/// are relative, and the empty path names the root.
#[async_trait]
pub trait RemoteProvider: Send + Sync + 'static {
    /// Returns the immediate children of the directory at `path`.
    async fn list(&self, path: &str) -> Result<Vec<RemoteFile>, RemoteError>;

    /// Returns a reader over `[offset, offset + length)` of the file
    /// at `path`. Fails with [RemoteError::Changed] when the object no
    /// longer matches `etag`.
    async fn open_range(
        &self,
        path: &str,
        etag: &str,
        offset: u64,
        length: u64,
    ) -> Result<RemoteReader, RemoteError>;
}

/// Constructs a provider from a textual address: URLs go to the
/// object-store backend, everything else is treated as a local
/// directory path.
pub fn from_addr(addr: &str) -> io::Result<Arc<dyn RemoteProvider>> {
    if addr.contains("://") {
        let url = Url::parse(addr).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let remote = ObjectStoreRemote::from_url(&url)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Arc::new(remote))
    } else {
        Ok(Arc::new(DirRemote::new(addr)))
    }
}
