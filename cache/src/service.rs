//! The file service: glues the inode table, block store and transfer
//! coordinator together behind path-addressed operations.

use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::errors::Error;
use crate::inodes::{DirHooks, FetchHook, Inode, InodeTable, ListHook, NO_INODE};
use crate::remote::RemoteProvider;
use crate::transfer::{self, BlockTarget, Message, TransferStats};

/// Diagnostics tree of the service. `transfer` is absent when the
/// coordinator has already shut down.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceStats {
    pub inodes: usize,
    pub blocks: usize,
    pub transfer: Option<TransferStats>,
}

/// A lazily-populated, read-only view of one remote tree.
///
/// The service owns the root directory inode — replaceable by
/// [FileService::forget] — and the hook factories connecting the
/// inode table to the remote provider through the transfer
/// coordinator.
pub struct FileService {
    table: Arc<InodeTable>,
    coordinator: mpsc::UnboundedSender<Message>,
    root: Mutex<Inode>,
}

/// Everything a hook needs to reach: shared by every closure the
/// factories below produce.
#[derive(Clone)]
struct HookEnv {
    table: Arc<InodeTable>,
    remote: Arc<dyn RemoteProvider>,
    coordinator: mpsc::UnboundedSender<Message>,
}

impl FileService {
    /// Builds the service: creates the block directory under
    /// `work_dir`, starts the transfer coordinator, and installs the
    /// root inode bound to the remote's root listing.
    pub fn new(
        remote: Arc<dyn RemoteProvider>,
        work_dir: &Path,
        block_size: u64,
    ) -> std::io::Result<Arc<Self>> {
        let table = Arc::new(InodeTable::new(work_dir, block_size)?);
        let coordinator = transfer::spawn(table.clone(), work_dir.to_path_buf());

        let env = HookEnv {
            table: table.clone(),
            remote,
            coordinator: coordinator.clone(),
        };
        let root = table.create_directory(
            NO_INODE,
            DirHooks {
                list: Some(make_list_hook(env, String::new())),
                lookup: None,
            },
        );

        Ok(Arc::new(Self {
            table,
            coordinator,
            root: Mutex::new(root),
        }))
    }

    pub fn table(&self) -> &Arc<InodeTable> {
        &self.table
    }

    /// The current root inode. Replaced wholesale by a `forget` of
    /// the root path; readers that resolved earlier keep the old one.
    pub fn root(&self) -> Inode {
        *self.root.lock()
    }

    /// Resolves `path` to an inode, taking one reference the caller
    /// must release. The empty path and `"."` name the root.
    #[instrument(skip(self))]
    pub async fn inode_for_path(&self, path: &str) -> Result<Inode, Error> {
        validate_path(path)?;

        let root = self.root();
        self.table.update_refcount(root, 1);
        if path.is_empty() || path == "." {
            return Ok(root);
        }

        let mut current = root;
        for component in path.split('/') {
            let next = self.table.lookup(current, component).await;
            self.table.update_refcount(current, -1);
            current = next?;
        }
        Ok(current)
    }

    /// Replaces the directory at `path` with a fresh, unpopulated
    /// clone sharing its hooks; the next access under `path`
    /// re-fetches from the remote. In-flight readers of the old
    /// subtree keep it alive until they release their references.
    ///
    /// Replacement is a compare-and-swap against the inode this call
    /// resolved: when concurrent forgets race for one path, exactly
    /// one clone is installed per resolved target and the losers drop
    /// their clones, so no reference is leaked or double-released.
    #[instrument(skip(self))]
    pub async fn forget(&self, path: &str) -> Result<(), Error> {
        let target = self.inode_for_path(path).await?;
        let clone = match self.table.clone_directory(target) {
            Ok(clone) => clone,
            Err(e) => {
                self.table.update_refcount(target, -1);
                return Err(e);
            }
        };

        if path.is_empty() || path == "." {
            let replaced = {
                let mut root = self.root.lock();
                if *root == target {
                    *root = clone;
                    true
                } else {
                    false
                }
            };
            if replaced {
                self.table.update_refcount(target, -1); // the service's reference
            } else {
                // A concurrent forget already swapped this root out.
                self.table.update_refcount(clone, -1);
            }
            self.table.update_refcount(target, -1); // the walk's reference
            return Ok(());
        }

        let (parent_path, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        let parent = match self.inode_for_path(parent_path).await {
            Ok(parent) => parent,
            Err(e) => {
                // Nothing references the clone yet; drop it again.
                self.table.update_refcount(clone, -1);
                self.table.update_refcount(target, -1);
                return Err(e);
            }
        };

        // The entry's reference to the old child is released inside
        // the swap when it succeeds.
        if !self.table.replace_dir_entry(parent, name, target, clone) {
            // A concurrent forget already replaced this entry; its
            // clone stays, ours goes. The post-condition holds either
            // way: the next lookup under `path` re-fetches.
            self.table.update_refcount(clone, -1);
        }
        self.table.update_refcount(parent, -1); // the walk's reference
        self.table.update_refcount(target, -1); // the walk's reference
        Ok(())
    }

    pub async fn diagnostics(&self) -> ServiceStats {
        let transfer = {
            let (reply, stats) = oneshot::channel();
            if self
                .coordinator
                .send(Message::Diagnostics { reply })
                .is_ok()
            {
                stats.await.ok()
            } else {
                None
            }
        };
        ServiceStats {
            inodes: self.table.inode_count(),
            blocks: self.table.blocks().block_count(),
            transfer,
        }
    }
}

/// Paths use `/` separators and never begin with `/` or `./`; `..`
/// components are rejected rather than resolved.
fn validate_path(path: &str) -> Result<(), Error> {
    if path.starts_with('/') || path.starts_with("./") {
        return Err(Error::InvalidName);
    }
    if path.split('/').any(|component| component == "..") {
        return Err(Error::InvalidName);
    }
    Ok(())
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Builds the list hook for the directory at `path`. The hook is
/// invoked by the inode table with the table lock released; it sends
/// one `DirRequest` and blocks on its waiter. The factories handed to
/// the listing worker equip each child with its own lazy hooks,
/// recursing into this function for subdirectories.
fn make_list_hook(env: HookEnv, path: String) -> ListHook {
    Arc::new(move |dir: Inode| {
        let env = env.clone();
        let path = path.clone();
        async move {
            let get_listing: transfer::GetListing = {
                let remote = env.remote.clone();
                let path = path.clone();
                Box::new(move || async move { remote.list(&path).await }.boxed())
            };
            let make_dir_hooks: transfer::MakeDirHooks = {
                let env = env.clone();
                let path = path.clone();
                Box::new(move |name: &str| DirHooks {
                    list: Some(make_list_hook(env.clone(), join_path(&path, name))),
                    lookup: None,
                })
            };
            let make_fetch_hook: transfer::MakeFetchHook = {
                let env = env.clone();
                let path = path.clone();
                Box::new(move |name: &str, etag: &str| {
                    make_fetch_hook(env.clone(), join_path(&path, name), etag.to_string())
                })
            };

            let (waiter, done) = oneshot::channel();
            let request = Message::DirRequest {
                dir,
                get_listing,
                make_dir_hooks,
                make_fetch_hook,
                waiter,
            };
            if env.coordinator.send(request).is_err() {
                // Shutdown: fail the directory instead of hanging its
                // readers.
                env.table
                    .mark_unreadable(dir, Error::RemoteIo("transfer coordinator is gone".into()));
                return;
            }
            let _ = done.await;
        }
        .boxed()
    })
}

/// Builds the fetch hook for the file at `path`, pinned to `etag`.
/// Sends one `BlockRequest` per missing index and waits for all of
/// them; deduplication against other readers happens in the
/// coordinator.
fn make_fetch_hook(env: HookEnv, path: String, etag: String) -> FetchHook {
    Arc::new(move |inode: Inode, indices: Vec<u64>| {
        let env = env.clone();
        let path = path.clone();
        let etag = etag.clone();
        async move {
            let block_size = env.table.block_size();
            let mut waiting = Vec::with_capacity(indices.len());
            for index in indices {
                let get_reader: transfer::GetReader = {
                    let remote = env.remote.clone();
                    let path = path.clone();
                    let etag = etag.clone();
                    Box::new(move || {
                        async move {
                            remote
                                .open_range(&path, &etag, index * block_size, block_size)
                                .await
                        }
                        .boxed()
                    })
                };
                let (waiter, done) = oneshot::channel();
                let request = Message::BlockRequest {
                    target: BlockTarget { inode, index },
                    get_reader,
                    waiter,
                };
                if env.coordinator.send(request).is_err() {
                    env.table.mark_unreadable(
                        inode,
                        Error::RemoteIo("transfer coordinator is gone".into()),
                    );
                    return;
                }
                waiting.push(done);
            }
            for done in waiting {
                let _ = done.await;
            }
        }
        .boxed()
    })
}
