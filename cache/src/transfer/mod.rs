//! The transfer coordinator.
//!
//! A single-consumer mailbox processes all requests in receive order
//! and owns the two in-flight tables exclusively, which makes the
//! single-flight property trivial: the first request for a target
//! spawns a worker, every later one just appends a waiter. Workers
//! report back through the same mailbox; the pending tables are small
//! (bounded by concurrent requests, not by cache size) and need no
//! locks.

mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::Error;
use crate::inodes::{DirEntry, DirHooks, FetchHook, Inode, InodeTable};
use crate::remote::{RemoteError, RemoteFile, RemoteReader};

/// Bytes pulled from the remote per read while splitting a stream
/// into blocks.
pub(crate) const CHUNK_SIZE: usize = 1 << 20;

/// One block of one file: the unit of single-flight deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockTarget {
    pub inode: Inode,
    pub index: u64,
}

/// Single-shot notification endpoint a requester blocks on. Signaled
/// by resolving (or dropping) the sender; the requester re-consults
/// the inode table afterwards and picks up either the populated state
/// or the sticky error.
pub type Waiter = oneshot::Sender<()>;

/// Obtains the bounded remote reader for one block request.
pub type GetReader =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<RemoteReader, RemoteError>> + Send>;

/// Obtains the remote listing for one directory request.
pub type GetListing =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Vec<RemoteFile>, RemoteError>> + Send>;

/// Builds the hook record for a child directory discovered by a
/// listing worker.
pub type MakeDirHooks = Box<dyn Fn(&str) -> DirHooks + Send>;

/// Builds the fetch hook for a child file discovered by a listing
/// worker, from its name and etag.
pub type MakeFetchHook = Box<dyn Fn(&str, &str) -> FetchHook + Send>;

/// Mailbox messages.
pub enum Message {
    /// A reader needs `target` populated.
    BlockRequest {
        target: BlockTarget,
        get_reader: GetReader,
        waiter: Waiter,
    },
    /// A worker finished one scratch file for `target`.
    BlockCompletion { target: BlockTarget, path: PathBuf },
    /// A worker failed fetching `target`.
    BlockError { target: BlockTarget, error: Error },
    /// A listener needs `dir`'s listing populated.
    DirRequest {
        dir: Inode,
        get_listing: GetListing,
        make_dir_hooks: MakeDirHooks,
        make_fetch_hook: MakeFetchHook,
        waiter: Waiter,
    },
    /// A worker finished materializing `dir`'s children.
    DirCompletion { dir: Inode, entries: Vec<DirEntry> },
    /// A worker failed listing `dir`.
    DirError { dir: Inode, error: Error },
    /// Reports the in-flight counters.
    Diagnostics { reply: oneshot::Sender<TransferStats> },
}

/// Counts of in-flight transfers and their waiters, surfaced through
/// the `diag` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferStats {
    pub blocks_requested: usize,
    pub block_waiters: usize,
    pub dirs_requested: usize,
    pub dir_waiters: usize,
}

/// Spawns the coordinator loop. The returned sender is the mailbox;
/// the loop exits once every externally held sender is dropped and
/// the remaining workers have drained.
pub fn spawn(table: Arc<InodeTable>, work_dir: PathBuf) -> mpsc::UnboundedSender<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    // The loop itself only holds a weak sender, so shutdown is
    // decided by the handles given out to hooks and workers.
    tokio::spawn(run(table, work_dir, tx.downgrade(), rx));
    tx
}

async fn run(
    table: Arc<InodeTable>,
    work_dir: PathBuf,
    tx: mpsc::WeakUnboundedSender<Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut pending_blocks: HashMap<BlockTarget, Vec<Waiter>> = HashMap::new();
    let mut pending_dirs: HashMap<Inode, Vec<Waiter>> = HashMap::new();

    while let Some(message) = rx.recv().await {
        match message {
            Message::BlockRequest {
                target,
                get_reader,
                waiter,
            } => {
                if let Some(waiters) = pending_blocks.get_mut(&target) {
                    // Already in flight: just wait for it.
                    waiters.push(waiter);
                    continue;
                }
                // The block may have been populated while this request
                // sat in the mailbox.
                if table.is_block_populated(target.inode, target.index) {
                    let _ = waiter.send(());
                    continue;
                }
                debug!(
                    inode = target.inode,
                    index = target.index,
                    "starting block transfer"
                );
                pending_blocks.insert(target, vec![waiter]);
                if let Some(tx) = tx.upgrade() {
                    tokio::spawn(worker::fetch_block(
                        target,
                        table.block_size(),
                        work_dir.clone(),
                        get_reader,
                        tx,
                    ));
                }
            }

            Message::BlockCompletion { target, path } => {
                let id = table.blocks().adopt(&path);
                if !table.set_block(target.inode, target.index, id) {
                    // The inode was forgotten and released mid-flight;
                    // reap the block we just adopted.
                    warn!(
                        inode = target.inode,
                        index = target.index,
                        "completion for a released inode"
                    );
                    table.blocks().update_refcount(id, -1);
                }
                match pending_blocks.remove(&target) {
                    Some(waiters) => {
                        debug!(
                            inode = target.inode,
                            index = target.index,
                            waiters = waiters.len(),
                            "block transfer complete"
                        );
                        for waiter in waiters {
                            let _ = waiter.send(());
                        }
                    }
                    None => warn!(
                        inode = target.inode,
                        index = target.index,
                        "completion for a block nobody requested"
                    ),
                }
            }

            Message::BlockError { target, error } => {
                match pending_blocks.remove(&target) {
                    Some(waiters) => {
                        // Waiters hold references on the inode, so it
                        // is still live here.
                        table.mark_unreadable(target.inode, error);
                        for waiter in waiters {
                            let _ = waiter.send(());
                        }
                    }
                    None => warn!(
                        inode = target.inode,
                        index = target.index,
                        "error for a block nobody requested"
                    ),
                }
            }

            Message::DirRequest {
                dir,
                get_listing,
                make_dir_hooks,
                make_fetch_hook,
                waiter,
            } => {
                if let Some(waiters) = pending_dirs.get_mut(&dir) {
                    waiters.push(waiter);
                    continue;
                }
                if table.is_dir_listed(dir) {
                    let _ = waiter.send(());
                    continue;
                }
                debug!(inode = dir, "starting directory listing");
                pending_dirs.insert(dir, vec![waiter]);
                if let Some(tx) = tx.upgrade() {
                    tokio::spawn(worker::fetch_listing(
                        dir,
                        table.clone(),
                        get_listing,
                        make_dir_hooks,
                        make_fetch_hook,
                        tx,
                    ));
                }
            }

            Message::DirCompletion { dir, entries } => {
                let waiters = pending_dirs
                    .remove(&dir)
                    .unwrap_or_else(|| panic!("completion for directory {} nobody requested", dir));
                table.set_dir_entries(dir, entries);
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }

            Message::DirError { dir, error } => match pending_dirs.remove(&dir) {
                Some(waiters) => {
                    table.mark_unreadable(dir, error);
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                }
                None => warn!(inode = dir, "listing error for a directory nobody requested"),
            },

            Message::Diagnostics { reply } => {
                let stats = TransferStats {
                    blocks_requested: pending_blocks.len(),
                    block_waiters: pending_blocks.values().map(Vec::len).sum(),
                    dirs_requested: pending_dirs.len(),
                    dir_waiters: pending_dirs.values().map(Vec::len).sum(),
                };
                let _ = reply.send(stats);
            }
        }
    }
    debug!("transfer coordinator shut down");
}
