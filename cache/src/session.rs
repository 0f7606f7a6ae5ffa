//! Per-client sessions: a handle table over the shared file service.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use crate::errors::Error;
use crate::inodes::{DirEntryInfo, Inode};
use crate::service::{FileService, ServiceStats};

/// A file descriptor as handed to IPC clients.
pub type Fd = u64;

struct FileHandle {
    inode: Inode,
    offset: u64,
}

/// Diagnostics of one session, wrapping the service tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionStats {
    pub open_files: usize,
    pub free_handles: usize,
    pub service: ServiceStats,
}

/// One client's stateful view: open handles and their offsets.
/// Intended to be driven by a single task (one per IPC connection);
/// everything stateful lives in the shared service underneath.
pub struct Session {
    service: Arc<FileService>,
    handles: HashMap<Fd, FileHandle>,
    next_handle: Fd,
    free_handles: Vec<Fd>,
}

impl Session {
    pub fn new(service: Arc<FileService>) -> Self {
        Self {
            service,
            handles: HashMap::new(),
            next_handle: 0,
            free_handles: Vec::new(),
        }
    }

    /// Opens the file at `path`, retaining its inode until
    /// [Session::close]. Directories are rejected.
    #[instrument(skip(self))]
    pub async fn open(&mut self, path: &str) -> Result<Fd, Error> {
        let inode = self.service.inode_for_path(path).await?;
        let stat = match self.service.table().stat(inode) {
            Ok(stat) => stat,
            Err(e) => {
                self.service.table().update_refcount(inode, -1);
                return Err(e);
            }
        };
        if stat.is_dir {
            self.service.table().update_refcount(inode, -1);
            return Err(Error::IsDir);
        }

        let fd = match self.free_handles.pop() {
            Some(fd) => fd,
            None => {
                let fd = self.next_handle;
                self.next_handle += 1;
                fd
            }
        };
        self.handles.insert(fd, FileHandle { inode, offset: 0 });
        Ok(fd)
    }

    /// Reads up to `length` bytes from the handle's offset, advancing
    /// it by the number of bytes returned. An empty result is
    /// end-of-file, not an error.
    #[instrument(skip(self))]
    pub async fn read(&mut self, fd: Fd, length: usize) -> Result<Vec<u8>, Error> {
        let (inode, offset) = match self.handles.get(&fd) {
            Some(handle) => (handle.inode, handle.offset),
            None => return Err(Error::InvalidHandle),
        };

        let mut buf = vec![0u8; length];
        let n = self.service.table().read_file(inode, offset, &mut buf).await?;
        buf.truncate(n);
        if let Some(handle) = self.handles.get_mut(&fd) {
            handle.offset += n as u64;
        }
        Ok(buf)
    }

    /// Releases the handle and its inode reference.
    #[instrument(skip(self))]
    pub fn close(&mut self, fd: Fd) -> Result<(), Error> {
        let handle = self.handles.remove(&fd).ok_or(Error::InvalidHandle)?;
        self.free_handles.push(fd);
        self.service.table().update_refcount(handle.inode, -1);
        Ok(())
    }

    /// Lists the directory at `path`. The path walk's reference is
    /// released on every exit.
    #[instrument(skip(self))]
    pub async fn listdir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>, Error> {
        let inode = self.service.inode_for_path(path).await?;
        let result = self.service.table().list(inode).await;
        self.service.table().update_refcount(inode, -1);
        result
    }

    #[instrument(skip(self))]
    pub async fn forget(&mut self, path: &str) -> Result<(), Error> {
        self.service.forget(path).await
    }

    pub async fn diagnostics(&self) -> SessionStats {
        SessionStats {
            open_files: self.handles.len(),
            free_handles: self.free_handles.len(),
            service: self.service.diagnostics().await,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Session teardown: release every handle still open.
        for (_, handle) in self.handles.drain() {
            self.service.table().update_refcount(handle.inode, -1);
        }
    }
}
