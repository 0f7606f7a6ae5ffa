//! The on-disk block store.
//!
//! Blocks are the unit of caching: files of at most `block_size` raw
//! bytes under `WORK_DIR/blocks`, named by their decimal id. The final
//! block of a remote file may be shorter than `block_size`. Block ids
//! are only meaningful within one process lifetime; the directory is
//! scratch.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Identifier of one on-disk cache block.
pub type BlockId = u64;

/// Sentinel block id: "this block has not been fetched yet". Never
/// names a real block.
pub const UNALLOCATED: BlockId = 0;

struct BlockState {
    refcount: i64,
}

#[derive(Default)]
struct BlockMap {
    states: HashMap<BlockId, BlockState>,
    next: BlockId,
    free: Vec<BlockId>,
}

impl BlockMap {
    fn allocate_id(&mut self) -> BlockId {
        if let Some(id) = self.free.pop() {
            id
        } else {
            self.next += 1;
            self.next
        }
    }
}

/// Refcounted store of block files. One mutex guards the id table;
/// reads go straight to the filesystem and take no lock.
pub struct BlockStore {
    inner: Mutex<BlockMap>,
    dir: PathBuf,
    block_size: u64,
}

impl BlockStore {
    /// Creates the store, and `work_dir/blocks` on disk.
    pub fn new(work_dir: &Path, block_size: u64) -> std::io::Result<Self> {
        assert!(block_size > 0, "block size must be positive");
        let dir = work_dir.join("blocks");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Mutex::new(BlockMap::default()),
            dir,
            block_size,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn filename(&self, id: BlockId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Takes ownership of the file at `path`, renaming it into the
    /// store and installing it with refcount 1.
    ///
    /// Panics if the file exceeds the block size or cannot be moved;
    /// both indicate a broken transfer worker, not a user fault.
    pub fn adopt(&self, path: &Path) -> BlockId {
        let len = std::fs::metadata(path)
            .unwrap_or_else(|e| panic!("stat {}: {}", path.display(), e))
            .len();
        assert!(
            len <= self.block_size,
            "adopted file is larger than a block: {} > {}",
            len,
            self.block_size
        );

        let id = {
            let mut inner = self.inner.lock();
            let id = inner.allocate_id();
            inner.states.insert(id, BlockState { refcount: 1 });
            id
        };

        let dest = self.filename(id);
        if let Err(e) = std::fs::rename(path, &dest) {
            panic!("renaming {} into the block store: {}", path.display(), e);
        }
        debug!(block = id, file = %dest.display(), "adopted block");
        id
    }

    /// Adjusts a block's refcount, returning the new count. On the
    /// transition to zero the block is dropped from the table and its
    /// backing file unlinked. Panics on unknown ids and negative
    /// results.
    pub fn update_refcount(&self, id: BlockId, delta: i64) -> i64 {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown block {}", id));
        state.refcount += delta;
        let refcount = state.refcount;
        if refcount < 0 {
            panic!("block {} refcount went negative", id);
        }
        if refcount == 0 {
            inner.states.remove(&id);
            inner.free.push(id);
            let filename = self.filename(id);
            if let Err(e) = std::fs::remove_file(&filename) {
                panic!("could not delete {}: {}", filename.display(), e);
            }
            debug!(block = id, "released block");
        }
        refcount
    }

    /// Reads up to `buf.len()` bytes starting at `offset` within the
    /// block. A short read at the end of the block file is not an
    /// error.
    pub async fn read(&self, id: BlockId, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = tokio::fs::File::open(self.filename(id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.inner.lock().states.len()
    }
}
