use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::instrument;

use super::{RemoteError, RemoteFile, RemoteProvider, RemoteReader};

/// Serves a local directory tree as the remote.
///
/// Etags are derived from modification time and length, so an
/// out-of-band mutation of a file invalidates pinned readers the same
/// way a generation bump does on a real object store.
pub struct DirRemote {
    root: PathBuf,
    list_delay: Duration,
    read_delay: Duration,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            list_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
        }
    }

    /// Adds artificial latency to listings and reads, to widen race
    /// windows when exercising concurrent readers.
    pub fn with_delays(mut self, list_delay: Duration, read_delay: Duration) -> Self {
        self.list_delay = list_delay;
        self.read_delay = read_delay;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

fn etag_for(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    format!("{}.{:09}-{}", mtime.as_secs(), mtime.subsec_nanos(), meta.len())
}

#[async_trait]
impl RemoteProvider for DirRemote {
    #[instrument(skip(self))]
    async fn list(&self, path: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        tokio::time::sleep(self.list_delay).await;

        let mut dir = tokio::fs::read_dir(self.resolve(path)).await?;
        let mut result = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            let is_dir = meta.is_dir();
            result.push(RemoteFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
                etag: if is_dir { String::new() } else { etag_for(&meta) },
                size: if is_dir { 0 } else { meta.len() },
            });
        }
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn open_range(
        &self,
        path: &str,
        etag: &str,
        offset: u64,
        length: u64,
    ) -> Result<RemoteReader, RemoteError> {
        tokio::time::sleep(self.read_delay).await;

        let mut file = tokio::fs::File::open(self.resolve(path)).await?;
        let current = etag_for(&file.metadata().await?);
        if current != etag {
            return Err(RemoteError::Changed(etag.to_string()));
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(length)))
    }
}
