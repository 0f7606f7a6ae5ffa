//! Transfer workers: the tasks spawned by the coordinator that
//! perform the actual remote i/o.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use super::{BlockTarget, GetListing, GetReader, MakeDirHooks, MakeFetchHook, Message};
use crate::inodes::{DirEntry, Inode, InodeTable};

/// Fetches one requested block: obtains the bounded remote reader and
/// streams it into scratch files, posting completions (or a single
/// error) back to the mailbox.
pub(super) async fn fetch_block(
    target: BlockTarget,
    block_size: u64,
    work_dir: PathBuf,
    get_reader: GetReader,
    tx: mpsc::UnboundedSender<Message>,
) {
    let reader = match get_reader().await {
        Ok(reader) => reader,
        Err(e) => {
            warn!(inode = target.inode, index = target.index, error = %e, "opening remote reader failed");
            let _ = tx.send(Message::BlockError {
                target,
                error: e.into(),
            });
            return;
        }
    };
    if let Err(e) = stream_blocks(
        target.inode,
        target.index,
        block_size,
        &work_dir,
        reader,
        super::CHUNK_SIZE,
        &tx,
    )
    .await
    {
        warn!(inode = target.inode, index = target.index, error = %e, "block transfer failed");
        let _ = tx.send(Message::BlockError {
            target,
            error: crate::Error::RemoteIo(e.to_string()),
        });
    }
}

/// Splits `reader` into scratch files of at most `block_size` bytes,
/// posting one [Message::BlockCompletion] per finished block starting
/// at `first_index`; a single bounded read can thus populate several
/// contiguous blocks. The partial final block is emitted at end of
/// stream. On error the in-progress scratch file is removed.
pub(crate) async fn stream_blocks(
    inode: Inode,
    first_index: u64,
    block_size: u64,
    work_dir: &Path,
    mut reader: crate::remote::RemoteReader,
    chunk_size: usize,
    tx: &mpsc::UnboundedSender<Message>,
) -> std::io::Result<()> {
    assert!(block_size > 0, "block size must be positive");

    let mut index = first_index;
    let mut current: Option<(File, PathBuf)> = None;
    let mut remaining_in_block = 0u64;
    let mut buf = vec![0u8; chunk_size];

    let result: std::io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                // End of stream: emit the partial final block, if any.
                if let Some((mut file, path)) = current.take() {
                    file.flush().await?;
                    drop(file);
                    let _ = tx.send(Message::BlockCompletion {
                        target: BlockTarget { inode, index },
                        path,
                    });
                }
                return Ok(());
            }

            let mut slice = &buf[..n];
            while !slice.is_empty() {
                if current.is_none() {
                    current = Some(new_scratch_file(work_dir)?);
                    remaining_in_block = block_size;
                }
                let (file, _) = current.as_mut().unwrap();
                let take = slice.len().min(remaining_in_block as usize);
                file.write_all(&slice[..take]).await?;
                slice = &slice[take..];
                remaining_in_block -= take as u64;

                if remaining_in_block == 0 {
                    let (mut file, path) = current.take().unwrap();
                    file.flush().await?;
                    drop(file);
                    let _ = tx.send(Message::BlockCompletion {
                        target: BlockTarget { inode, index },
                        path,
                    });
                    index += 1;
                }
            }
        }
    }
    .await;

    if result.is_err() {
        if let Some((_, path)) = current.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
    result
}

fn new_scratch_file(work_dir: &Path) -> std::io::Result<(File, PathBuf)> {
    let (file, path) = NamedTempFile::new_in(work_dir)?
        .keep()
        .map_err(|e| e.error)?;
    Ok((File::from_std(file), path))
}

/// Fetches one directory listing and materializes its children as
/// lazy inodes, posting a [Message::DirCompletion] (or a
/// [Message::DirError]) back to the mailbox.
pub(super) async fn fetch_listing(
    dir: Inode,
    table: Arc<InodeTable>,
    get_listing: GetListing,
    make_dir_hooks: MakeDirHooks,
    make_fetch_hook: MakeFetchHook,
    tx: mpsc::UnboundedSender<Message>,
) {
    let files = match get_listing().await {
        Ok(files) => files,
        Err(e) => {
            warn!(inode = dir, error = %e, "directory listing failed");
            let _ = tx.send(Message::DirError {
                dir,
                error: e.into(),
            });
            return;
        }
    };

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let inode = if file.is_dir {
            table.create_directory(dir, make_dir_hooks(&file.name))
        } else {
            table.create_file(file.size, make_fetch_hook(&file.name, &file.etag))
        };
        entries.push(DirEntry {
            name: file.name,
            inode,
        });
    }
    let _ = tx.send(Message::DirCompletion { dir, entries });
}
