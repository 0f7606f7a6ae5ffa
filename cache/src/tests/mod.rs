//! Cross-module scenarios: a file service over a local-directory
//! remote, driven through sessions the way the daemon drives them.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Error;
use crate::remote::{DirRemote, RemoteError, RemoteFile, RemoteProvider, RemoteReader};
use crate::service::FileService;
use crate::session::Session;

/// Writes `pattern` repeated `count` times.
fn write_file(path: &Path, pattern: &str, count: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, pattern.repeat(count)).unwrap();
}

struct Fixture {
    remote_dir: tempfile::TempDir,
    work_dir: tempfile::TempDir,
    service: Arc<FileService>,
}

/// The standard tree: `f1`, `f2`, `d1/f1`, `d1/f2`.
fn fixture(block_size: u64) -> Fixture {
    let remote_dir = tempfile::tempdir().unwrap();
    write_file(&remote_dir.path().join("f1"), "f1", 10);
    write_file(&remote_dir.path().join("f2"), "f2", 20);
    write_file(&remote_dir.path().join("d1/f1"), "d1f1", 30);
    write_file(&remote_dir.path().join("d1/f2"), "d1f2", 40);

    let work_dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(DirRemote::new(remote_dir.path()));
    let service = FileService::new(remote, work_dir.path(), block_size).unwrap();
    Fixture {
        remote_dir,
        work_dir,
        service,
    }
}

async fn names_of(session: &mut Session, path: &str) -> Vec<String> {
    let mut names: Vec<String> = session
        .listdir(path)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn open_read_close() {
    let fx = fixture(10_000);
    let mut session = Session::new(fx.service.clone());

    let fd = session.open("f1").await.unwrap();

    // Read a little, then a little more.
    assert_eq!(session.read(fd, 3).await.unwrap(), b"f1f");
    assert_eq!(session.read(fd, 2).await.unwrap(), b"1f");

    // 5 of 20 bytes consumed; a large read returns the 15-byte
    // suffix, and end-of-file is an empty success.
    assert_eq!(session.read(fd, 1000).await.unwrap().len(), 15);
    assert_eq!(session.read(fd, 1000).await.unwrap(), b"");

    session.close(fd).unwrap();
    assert_eq!(session.read(fd, 1).await, Err(Error::InvalidHandle));
    assert_eq!(session.close(fd), Err(Error::InvalidHandle));
}

#[rstest::rstest]
#[case::tiny_blocks(3)]
#[case::uneven_blocks(7)]
#[case::one_block(10_000)]
#[tokio::test]
async fn reads_are_exact_for_any_block_size(#[case] block_size: u64) {
    let fx = fixture(block_size);
    let mut session = Session::new(fx.service.clone());

    // "d1f2" × 40 = 160 bytes, read in pieces that straddle block
    // boundaries for every case above.
    let expected = "d1f2".repeat(40).into_bytes();
    let fd = session.open("d1/f2").await.unwrap();
    assert_eq!(session.read(fd, 10).await.unwrap(), &expected[..10]);
    assert_eq!(session.read(fd, 1).await.unwrap(), &expected[10..11]);
    assert_eq!(session.read(fd, 500).await.unwrap(), &expected[11..]);
    session.close(fd).unwrap();
}

#[tokio::test]
async fn listings_and_classification() {
    let fx = fixture(10_000);
    let mut session = Session::new(fx.service.clone());

    assert_eq!(
        names_of(&mut session, ".").await,
        [".", "..", "d1", "f1", "f2"]
    );
    assert_eq!(names_of(&mut session, "d1").await, [".", "..", "f1", "f2"]);
    assert_eq!(session.listdir("f1").await, Err(Error::IsNotDir));
    assert_eq!(session.listdir("f3").await, Err(Error::InvalidName));

    // Sizes and kinds are annotated.
    let entries = session.listdir("").await.unwrap();
    let f2 = entries.iter().find(|e| e.name == "f2").unwrap();
    assert_eq!(f2.size, 40);
    assert!(!f2.is_dir);
    assert!(entries.iter().any(|e| e.name == "d1" && e.is_dir));

    // Opening a directory or a missing name fails without leaking.
    assert_eq!(session.open("d1").await, Err(Error::IsDir));
    assert_eq!(session.open("f3").await, Err(Error::InvalidName));
    assert_eq!(session.open("d1/f3").await, Err(Error::InvalidName));

    // Nested reads resolve through the lazy subdirectory.
    let fd = session.open("d1/f1").await.unwrap();
    assert_eq!(session.read(fd, 4).await.unwrap(), b"d1f1");
    session.close(fd).unwrap();

    // Path edge cases.
    assert_eq!(session.listdir("/f1").await, Err(Error::InvalidName));
    assert_eq!(session.listdir("./f1").await, Err(Error::InvalidName));
    assert_eq!(session.listdir("..").await, Err(Error::InvalidName));
}

#[tokio::test]
async fn forget_refetches_the_listing() {
    let fx = fixture(10_000);
    let mut session = Session::new(fx.service.clone());

    assert_eq!(
        names_of(&mut session, ".").await,
        [".", "..", "d1", "f1", "f2"]
    );

    // The listing is cached: a file added remotely stays invisible…
    write_file(&fx.remote_dir.path().join("f3"), "f3", 5);
    assert_eq!(
        names_of(&mut session, ".").await,
        [".", "..", "d1", "f1", "f2"]
    );

    // …until the tree is forgotten.
    session.forget("").await.unwrap();
    assert_eq!(
        names_of(&mut session, ".").await,
        [".", "..", "d1", "f1", "f2", "f3"]
    );
}

#[tokio::test]
async fn forget_of_a_subdirectory() {
    let fx = fixture(10_000);
    let mut session = Session::new(fx.service.clone());

    assert_eq!(names_of(&mut session, "d1").await, [".", "..", "f1", "f2"]);

    write_file(&fx.remote_dir.path().join("d1/f3"), "x", 1);
    assert_eq!(names_of(&mut session, "d1").await, [".", "..", "f1", "f2"]);

    session.forget("d1").await.unwrap();
    assert_eq!(
        names_of(&mut session, "d1").await,
        [".", "..", "f1", "f2", "f3"]
    );

    // The parent listing still resolves, and files are not
    // forgettable.
    assert_eq!(
        names_of(&mut session, ".").await,
        [".", "..", "d1", "f1", "f2"]
    );
    assert_eq!(session.forget("f1").await, Err(Error::IsNotDir));
    assert_eq!(session.forget("f9").await, Err(Error::InvalidName));
}

#[tokio::test]
async fn remote_mutation_is_sticky_until_forgotten() {
    let fx = fixture(4);
    let mut session = Session::new(fx.service.clone());

    let fd = session.open("f1").await.unwrap();
    assert_eq!(session.read(fd, 4).await.unwrap(), b"f1f1");

    // Mutate the remote object; the next block fetch is pinned to the
    // stale etag and fails, stickily.
    write_file(&fx.remote_dir.path().join("f1"), "XY", 30);
    match session.read(fd, 4).await {
        Err(Error::FileChanged(_)) => {}
        other => panic!("expected FileChanged, got {:?}", other),
    }
    match session.read(fd, 4).await {
        Err(Error::FileChanged(_)) => {}
        other => panic!("expected sticky FileChanged, got {:?}", other),
    }

    // A forget replaces the inode; a fresh open sees the new content.
    session.forget("").await.unwrap();
    session.close(fd).unwrap();
    let fd = session.open("f1").await.unwrap();
    let contents = session.read(fd, 1000).await.unwrap();
    assert_eq!(contents, "XY".repeat(30).into_bytes());
    session.close(fd).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_forgets_conserve_references() {
    let fx = fixture(10_000);
    let mut session = Session::new(fx.service.clone());
    names_of(&mut session, "d1").await;

    // Racing forgets of one path: each round exactly one clone wins
    // the swap and the losers are dropped, never panicking a refcount.
    let mut calls = Vec::new();
    for _ in 0..10 {
        let service = fx.service.clone();
        calls.push(tokio::spawn(async move { service.forget("d1").await }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(names_of(&mut session, "d1").await, [".", "..", "f1", "f2"]);

    drop(session);
    fx.service.forget("").await.unwrap();
    assert_eq!(fx.service.table().inode_count(), 1);
    assert_eq!(fx.service.table().blocks().block_count(), 0);
}

#[tokio::test]
async fn refcounts_are_conserved() {
    let fx = fixture(16);
    {
        let mut session = Session::new(fx.service.clone());

        names_of(&mut session, ".").await;
        names_of(&mut session, "d1").await;

        let fd1 = session.open("f1").await.unwrap();
        let fd2 = session.open("d1/f2").await.unwrap();
        assert_eq!(session.read(fd1, 7).await.unwrap(), b"f1f1f1f");
        assert_eq!(session.read(fd2, 8).await.unwrap(), b"d1f2d1f2");
        session.close(fd1).unwrap();

        // fd2 is torn down with the session.
    }

    fx.service.forget("").await.unwrap();

    // Everything but the fresh root clone is gone, and the scratch
    // directory holds no blocks.
    let table = fx.service.table();
    assert_eq!(table.inode_count(), 1);
    assert_eq!(table.blocks().block_count(), 0);
    let blocks_on_disk = std::fs::read_dir(fx.work_dir.path().join("blocks"))
        .unwrap()
        .count();
    assert_eq!(blocks_on_disk, 0);
}

/// Remote wrapper that counts ranged-read openings: together with the
/// coordinator's single-flight discipline, N concurrent readers of
/// one file must not open more readers than the file has blocks.
struct CountingRemote {
    inner: DirRemote,
    opens: AtomicUsize,
}

#[async_trait]
impl RemoteProvider for CountingRemote {
    async fn list(&self, path: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        self.inner.list(path).await
    }

    async fn open_range(
        &self,
        path: &str,
        etag: &str,
        offset: u64,
        length: u64,
    ) -> Result<RemoteReader, RemoteError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_range(path, etag, offset, length).await
    }
}

/// Small deterministic PRNG so the fuzz below needs no seeds from the
/// environment.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_reassemble_the_source() {
    const SOURCE_LEN: usize = 10_000;
    const BLOCK_SIZE: u64 = 23;
    const READERS: usize = 20;
    const MAX_READ: u64 = 100;

    let mut rng = XorShift::new(0x5eed);
    let source: Arc<Vec<u8>> = Arc::new((0..SOURCE_LEN).map(|_| rng.next() as u8).collect());

    let remote_dir = tempfile::tempdir().unwrap();
    std::fs::write(remote_dir.path().join("source"), source.as_slice()).unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let remote = Arc::new(CountingRemote {
        inner: DirRemote::new(remote_dir.path()),
        opens: AtomicUsize::new(0),
    });
    let service = FileService::new(remote.clone(), work_dir.path(), BLOCK_SIZE).unwrap();

    let mut readers = Vec::new();
    for reader_index in 0..READERS {
        let service = service.clone();
        let source = source.clone();
        let mut rng = XorShift::new(0xfeed + reader_index as u64);

        readers.push(tokio::spawn(async move {
            // A random partition of the source, read in random order.
            let mut reads = Vec::new();
            let mut offset = 0usize;
            while offset < SOURCE_LEN {
                let length = (rng.below(MAX_READ - 1) + 1) as usize;
                let length = length.min(SOURCE_LEN - offset);
                reads.push((offset, length));
                offset += length;
            }
            for i in (1..reads.len()).rev() {
                let j = rng.below(i as u64 + 1) as usize;
                reads.swap(i, j);
            }

            let inode = service.inode_for_path("source").await.unwrap();
            let mut reassembled = vec![0u8; SOURCE_LEN];
            for (offset, length) in reads {
                let buf = &mut reassembled[offset..offset + length];
                let n = service
                    .table()
                    .read_file(inode, offset as u64, buf)
                    .await
                    .unwrap();
                assert_eq!(n, length);
            }
            service.table().update_refcount(inode, -1);

            assert_eq!(reassembled, *source);
        }));
    }
    for reader in readers {
        reader.await.unwrap();
    }

    // Single-flight: at most one ranged read per block of the file.
    let block_count = (SOURCE_LEN as u64).div_ceil(BLOCK_SIZE) as usize;
    assert!(
        remote.opens.load(Ordering::SeqCst) <= block_count,
        "{} opens for {} blocks",
        remote.opens.load(Ordering::SeqCst),
        block_count
    );
}
