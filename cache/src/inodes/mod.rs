//! The in-memory inode table.
//!
//! Inodes describe one file or directory each and are shared by
//! sessions and parent directories through reference counts. Lazy
//! state (directory listings, file blocks) is populated through
//! capability hooks the table invokes with its lock released; see
//! [InodeTable::lookup], [InodeTable::list] and
//! [InodeTable::read_file] for the release-invoke-reacquire pattern.

mod dir_entries;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use self::dir_entries::DirEntries;
use crate::blocks::{BlockId, BlockStore, UNALLOCATED};
use crate::errors::Error;

/// Identifier of one in-memory inode.
pub type Inode = u64;

/// Sentinel inode id: "no parent" in [InodeTable::create_directory]
/// and "known to not exist" in [InodeTable::set_dir_entry].
pub const NO_INODE: Inode = 0;

/// Capability invoked to populate missing blocks of a lazy file. Must
/// not return until the requested blocks are populated or a sticky
/// error has been recorded on the inode.
pub type FetchHook = Arc<dyn Fn(Inode, Vec<u64>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability invoked to populate a directory's full listing.
pub type ListHook = Arc<dyn Fn(Inode) -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability invoked to populate a single name in a directory.
pub type LookupHook = Arc<dyn Fn(Inode, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability record carried by lazily-populated directories.
#[derive(Clone, Default)]
pub struct DirHooks {
    pub list: Option<ListHook>,
    pub lookup: Option<LookupHook>,
}

/// One entry of a directory listing, as installed by the transfer
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: Inode,
}

/// One entry of a directory snapshot returned from [InodeTable::list],
/// annotated with the child's size and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub inode: Inode,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub is_dir: bool,
}

enum Node {
    File {
        length: u64,
        blocks: Vec<BlockId>,
        fetch: FetchHook,
    },
    Directory {
        entries: DirEntries,
        hooks: DirHooks,
        fully_listed: bool,
    },
}

struct InodeState {
    refcount: i64,
    read_failed: Option<Error>,
    node: Node,
}

#[derive(Default)]
struct TableInner {
    states: HashMap<Inode, InodeState>,
    next: Inode,
    free: Vec<Inode>,
}

/// Outcome of resolving a name inside the table lock.
enum Resolution {
    /// Child found; its refcount has been incremented.
    Found(Inode),
    /// Name is populated and known to not exist.
    KnownAbsent,
    /// Name is not populated; carries the directory's lookup hook.
    Unpopulated(Option<LookupHook>),
}

impl TableInner {
    fn allocate_id(&mut self) -> Inode {
        if let Some(ino) = self.free.pop() {
            ino
        } else {
            self.next += 1;
            self.next
        }
    }

    fn get(&self, ino: Inode) -> Option<&InodeState> {
        self.states.get(&ino)
    }

    /// Adjusts an inode's refcount. At zero the inode is removed and
    /// ownership cascades: a file releases its blocks, a directory
    /// releases every child in its entry map except `"."` and `".."`.
    fn update_refcount(&mut self, blocks: &BlockStore, ino: Inode, delta: i64) -> i64 {
        let state = self
            .states
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("unknown inode {}", ino));
        state.refcount += delta;
        let refcount = state.refcount;
        if refcount < 0 {
            panic!("inode {} refcount went negative", ino);
        }
        if refcount == 0 {
            debug!(inode = ino, "releasing inode");
            let state = self.states.remove(&ino).unwrap();
            self.free.push(ino);
            match state.node {
                Node::File { blocks: ids, .. } => {
                    for id in ids {
                        if id != UNALLOCATED {
                            blocks.update_refcount(id, -1);
                        }
                    }
                }
                Node::Directory { entries, .. } => {
                    for (name, child) in entries.iter() {
                        if name == "." || name == ".." {
                            continue;
                        }
                        self.update_refcount(blocks, child, -1);
                    }
                }
            }
        }
        refcount
    }

    /// Resolves `name` in `dir`, incrementing the child's refcount on
    /// success.
    fn resolve(&mut self, blocks: &BlockStore, dir: Inode, name: &str) -> Result<Resolution, Error> {
        let child = {
            let state = self.get(dir).ok_or(Error::InvalidInode)?;
            let Node::Directory { entries, hooks, .. } = &state.node else {
                return Err(Error::IsNotDir);
            };
            if !entries.is_populated(name) {
                return Ok(Resolution::Unpopulated(hooks.lookup.clone()));
            }
            match entries.get(name) {
                Some(child) => child,
                None => return Ok(Resolution::KnownAbsent),
            }
        };
        self.update_refcount(blocks, child, 1);
        Ok(Resolution::Found(child))
    }
}

/// The inode table. One mutex guards all mutable state; every public
/// operation acquires it on entry. The async operations release it
/// around user-supplied hooks and reacquire afterwards; nothing else
/// may reenter.
pub struct InodeTable {
    inner: Mutex<TableInner>,
    blocks: BlockStore,
    block_size: u64,
}

impl InodeTable {
    pub fn new(work_dir: &Path, block_size: u64) -> std::io::Result<Self> {
        Ok(Self {
            inner: Mutex::new(TableInner::default()),
            blocks: BlockStore::new(work_dir, block_size)?,
            block_size,
        })
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Allocates a file inode of the declared length with every block
    /// unallocated, refcount 1.
    pub fn create_file(&self, length: u64, fetch: FetchHook) -> Inode {
        let block_count = length.div_ceil(self.block_size) as usize;
        let mut inner = self.inner.lock();
        let ino = inner.allocate_id();
        inner.states.insert(
            ino,
            InodeState {
                refcount: 1,
                read_failed: None,
                node: Node::File {
                    length,
                    blocks: vec![UNALLOCATED; block_count],
                    fetch,
                },
            },
        );
        ino
    }

    /// Allocates a directory inode, refcount 1. With
    /// `parent == NO_INODE` the directory becomes its own parent (the
    /// root case).
    pub fn create_directory(&self, parent: Inode, hooks: DirHooks) -> Inode {
        let mut inner = self.inner.lock();
        let ino = inner.allocate_id();
        let parent = if parent == NO_INODE { ino } else { parent };
        inner.states.insert(
            ino,
            InodeState {
                refcount: 1,
                read_failed: None,
                node: Node::Directory {
                    entries: DirEntries::new(ino, parent),
                    hooks,
                    fully_listed: false,
                },
            },
        );
        ino
    }

    /// Produces a fresh, unpopulated directory sharing `ino`'s hooks,
    /// refcount 1. The clone keeps the original's parent; a directory
    /// that was its own parent yields a clone that is its own parent.
    pub fn clone_directory(&self, ino: Inode) -> Result<Inode, Error> {
        let mut inner = self.inner.lock();
        let (hooks, parent) = {
            let state = inner.get(ino).ok_or(Error::InvalidInode)?;
            match &state.node {
                Node::Directory { hooks, entries, .. } => (
                    hooks.clone(),
                    entries.get("..").expect("directory without .."),
                ),
                Node::File { .. } => return Err(Error::IsNotDir),
            }
        };
        let new = inner.allocate_id();
        let parent = if parent == ino { new } else { parent };
        inner.states.insert(
            new,
            InodeState {
                refcount: 1,
                read_failed: None,
                node: Node::Directory {
                    entries: DirEntries::new(new, parent),
                    hooks,
                    fully_listed: false,
                },
            },
        );
        Ok(new)
    }

    /// Installs one entry, marking `name` populated; [NO_INODE]
    /// records the name as known-absent. Replacing a live child does
    /// not touch the old child's refcount — the caller owns that
    /// reference and releases it itself.
    pub fn set_dir_entry(&self, dir: Inode, name: &str, child: Inode) {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .get_mut(&dir)
            .unwrap_or_else(|| panic!("unknown inode {}", dir));
        match &mut state.node {
            Node::Directory { entries, .. } => entries.set(name, child),
            Node::File { .. } => panic!("inode {} is not a directory", dir),
        }
    }

    /// Atomically replaces `parent`'s entry for `name` with
    /// `new_child`, but only while it still maps to `old_child`; the
    /// replaced child's entry reference is released in the same
    /// critical section. Returns false — leaving `new_child` untouched
    /// — when the entry moved, i.e. a concurrent replacement won.
    pub fn replace_dir_entry(
        &self,
        parent: Inode,
        name: &str,
        old_child: Inode,
        new_child: Inode,
    ) -> bool {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .get_mut(&parent)
            .unwrap_or_else(|| panic!("unknown inode {}", parent));
        let replaced = match &mut state.node {
            Node::Directory { entries, .. } => {
                if entries.get(name) == Some(old_child) {
                    entries.set(name, new_child);
                    true
                } else {
                    false
                }
            }
            Node::File { .. } => panic!("inode {} is not a directory", parent),
        };
        if replaced {
            inner.update_refcount(&self.blocks, old_child, -1);
        }
        replaced
    }

    /// Bulk-installs a listing and marks the directory fully listed.
    pub fn set_dir_entries(&self, dir: Inode, entries: Vec<DirEntry>) {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .get_mut(&dir)
            .unwrap_or_else(|| panic!("unknown inode {}", dir));
        match &mut state.node {
            Node::Directory {
                entries: map,
                fully_listed,
                ..
            } => {
                for entry in &entries {
                    map.set(&entry.name, entry.inode);
                }
                *fully_listed = true;
            }
            Node::File { .. } => panic!("inode {} is not a directory", dir),
        }
    }

    /// Places `block` at `index`, growing the block vector with
    /// [UNALLOCATED] if the file has grown remotely. Returns false
    /// when the inode is no longer present (forgotten and released
    /// while the transfer was in flight); the caller then still owns
    /// the block's reference.
    pub fn set_block(&self, ino: Inode, index: u64, block: BlockId) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.states.get_mut(&ino) else {
            return false;
        };
        match &mut state.node {
            Node::File { blocks, .. } => {
                let index = index as usize;
                while blocks.len() <= index {
                    blocks.push(UNALLOCATED);
                }
                let previous = blocks[index];
                blocks[index] = block;
                if previous != UNALLOCATED {
                    warn!(inode = ino, index, "replacing an already populated block");
                    self.blocks.update_refcount(previous, -1);
                }
                true
            }
            Node::Directory { .. } => panic!("inode {} is not a file", ino),
        }
    }

    /// Records the sticky error. A directory additionally loses its
    /// fully-listed flag, so nothing treats the partial state as
    /// complete.
    pub fn mark_unreadable(&self, ino: Inode, error: Error) {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("unknown inode {}", ino));
        if let Node::Directory { fully_listed, .. } = &mut state.node {
            *fully_listed = false;
        }
        state.read_failed = Some(error);
    }

    /// Snapshot of the block ids in `[start, start + count)`, with the
    /// refcount of every allocated id incremented. The caller must
    /// release every returned non-sentinel id exactly once. Returns
    /// the sticky error if one is set.
    pub fn get_block_ids(&self, ino: Inode, start: u64, count: u64) -> Result<Vec<BlockId>, Error> {
        let inner = self.inner.lock();
        let state = inner
            .get(ino)
            .unwrap_or_else(|| panic!("unknown inode {}", ino));
        if let Some(e) = &state.read_failed {
            return Err(e.clone());
        }
        match &state.node {
            Node::File { blocks, .. } => {
                let mut result = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let id = blocks[(start + i) as usize];
                    if id != UNALLOCATED {
                        self.blocks.update_refcount(id, 1);
                    }
                    result.push(id);
                }
                Ok(result)
            }
            Node::Directory { .. } => panic!("inode {} is not a file", ino),
        }
    }

    /// See [TableInner::update_refcount].
    pub fn update_refcount(&self, ino: Inode, delta: i64) -> i64 {
        self.inner.lock().update_refcount(&self.blocks, ino, delta)
    }

    pub fn stat(&self, ino: Inode) -> Result<Stat, Error> {
        let inner = self.inner.lock();
        let state = inner.get(ino).ok_or(Error::InvalidInode)?;
        Ok(match &state.node {
            Node::File { length, .. } => Stat {
                size: *length,
                is_dir: false,
            },
            Node::Directory { .. } => Stat {
                size: 0,
                is_dir: true,
            },
        })
    }

    /// Double-check used by the transfer coordinator before starting
    /// a listing.
    pub fn is_dir_listed(&self, ino: Inode) -> bool {
        let inner = self.inner.lock();
        match inner.get(ino) {
            Some(InodeState {
                node: Node::Directory { fully_listed, .. },
                ..
            }) => *fully_listed,
            Some(_) => panic!("inode {} is not a directory", ino),
            None => panic!("unknown inode {}", ino),
        }
    }

    /// Double-check used by the transfer coordinator before starting
    /// a block fetch.
    pub fn is_block_populated(&self, ino: Inode, index: u64) -> bool {
        let inner = self.inner.lock();
        match inner.get(ino) {
            Some(InodeState {
                node: Node::File { blocks, .. },
                ..
            }) => blocks
                .get(index as usize)
                .is_some_and(|id| *id != UNALLOCATED),
            Some(_) => panic!("inode {} is not a file", ino),
            None => panic!("unknown inode {}", ino),
        }
    }

    /// Number of live inodes.
    pub fn inode_count(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// Looks up `name` in `dir`, incrementing the returned inode's
    /// refcount by one. An unpopulated name is resolved through the
    /// directory's lookup hook, or through a full [InodeTable::list]
    /// when there is none; the table lock is released around either.
    pub async fn lookup(&self, dir: Inode, name: &str) -> Result<Inode, Error> {
        let lookup_hook = {
            let mut inner = self.inner.lock();
            match inner.resolve(&self.blocks, dir, name)? {
                Resolution::Found(child) => return Ok(child),
                Resolution::KnownAbsent => return Err(Error::InvalidName),
                Resolution::Unpopulated(hook) => hook,
            }
        };

        match lookup_hook {
            Some(hook) => {
                hook(dir, name.to_string()).await;
                let mut inner = self.inner.lock();
                if let Some(e) = inner
                    .get(dir)
                    .ok_or(Error::InvalidInode)?
                    .read_failed
                    .as_ref()
                {
                    return Err(e.clone());
                }
                match inner.resolve(&self.blocks, dir, name)? {
                    Resolution::Found(child) => Ok(child),
                    Resolution::KnownAbsent => Err(Error::InvalidName),
                    Resolution::Unpopulated(_) => {
                        panic!("lookup hook did not populate {:?}", name)
                    }
                }
            }
            None => {
                self.list(dir).await?;
                let mut inner = self.inner.lock();
                match inner.resolve(&self.blocks, dir, name)? {
                    Resolution::Found(child) => Ok(child),
                    _ => Err(Error::InvalidName),
                }
            }
        }
    }

    /// Returns a snapshot of the directory, populating it through the
    /// list hook first when needed.
    pub async fn list(&self, dir: Inode) -> Result<Vec<DirEntryInfo>, Error> {
        let list_hook = {
            let inner = self.inner.lock();
            let state = inner.get(dir).ok_or(Error::InvalidInode)?;
            let Node::Directory {
                hooks,
                fully_listed,
                ..
            } = &state.node
            else {
                return Err(Error::IsNotDir);
            };
            if let Some(e) = &state.read_failed {
                return Err(e.clone());
            }
            if *fully_listed {
                None
            } else {
                hooks.list.clone()
            }
        };

        if let Some(hook) = list_hook {
            hook(dir).await;
            let inner = self.inner.lock();
            let state = inner.get(dir).ok_or(Error::InvalidInode)?;
            if let Some(e) = &state.read_failed {
                return Err(e.clone());
            }
            let Node::Directory { fully_listed, .. } = &state.node else {
                return Err(Error::IsNotDir);
            };
            if !fully_listed {
                panic!("list hook did not populate directory {}", dir);
            }
        }

        let inner = self.inner.lock();
        let state = inner.get(dir).ok_or(Error::InvalidInode)?;
        let Node::Directory { entries, .. } = &state.node else {
            return Err(Error::IsNotDir);
        };
        let mut result = Vec::new();
        for (name, child) in entries.iter() {
            let (size, is_dir) = match inner.get(child) {
                Some(child_state) => match &child_state.node {
                    Node::File { length, .. } => (*length, false),
                    Node::Directory { .. } => (0, true),
                },
                // ".." may outlive its target; report it as a directory.
                None => (0, true),
            };
            result.push(DirEntryInfo {
                name: name.to_string(),
                inode: child,
                size,
                is_dir,
            });
        }
        Ok(result)
    }

    /// Reads up to `buf.len()` bytes at `offset` from the file.
    /// Missing blocks are fetched through the file's fetch hook before
    /// reading. Every block id obtained along the way is released
    /// exactly once before returning, on success and error alike. A
    /// short read past the declared length is not an error.
    pub async fn read_file(&self, ino: Inode, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let mut held: Vec<BlockId> = Vec::new();
        let result = self.read_file_inner(ino, offset, buf, &mut held).await;
        for id in held {
            if id != UNALLOCATED {
                self.blocks.update_refcount(id, -1);
            }
        }
        result
    }

    async fn read_file_inner(
        &self,
        ino: Inode,
        offset: u64,
        buf: &mut [u8],
        held: &mut Vec<BlockId>,
    ) -> Result<usize, Error> {
        let block_size = self.block_size;
        let (length, fetch) = {
            let inner = self.inner.lock();
            let state = inner
                .get(ino)
                .unwrap_or_else(|| panic!("unknown inode {}", ino));
            if let Some(e) = &state.read_failed {
                return Err(e.clone());
            }
            match &state.node {
                Node::File { length, fetch, .. } => (*length, fetch.clone()),
                Node::Directory { .. } => return Err(Error::IsDir),
            }
        };

        if buf.is_empty() || offset >= length {
            return Ok(0);
        }

        let start_index = offset / block_size;
        let end_index = (offset + buf.len() as u64)
            .div_ceil(block_size)
            .min(length.div_ceil(block_size));
        let count = end_index - start_index;

        let mut ids = self.get_block_ids(ino, start_index, count)?;
        held.extend_from_slice(&ids);

        let missing: Vec<u64> = ids
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == UNALLOCATED)
            .map(|(i, _)| start_index + i as u64)
            .collect();

        if !missing.is_empty() {
            fetch(ino, missing).await;
            // The hook has returned, so the range is populated now or
            // the inode carries a sticky error.
            ids = self.get_block_ids(ino, start_index, count)?;
            held.extend_from_slice(&ids);
        }

        let mut offset_in_block = offset % block_size;
        let mut filled = 0usize;
        for (i, id) in ids.iter().enumerate() {
            if *id == UNALLOCATED {
                panic!(
                    "block {} of inode {} still unallocated after fetch",
                    start_index + i as u64,
                    ino
                );
            }
            let n = self.blocks.read(*id, offset_in_block, &mut buf[filled..]).await?;
            filled += n;
            offset_in_block = 0;
            if filled == buf.len() {
                break;
            }
        }
        Ok(filled)
    }
}
