//! Bounded-buffer writer decoupling the wire-speed protocol engine
//! from disk-speed container I/O.
//!
//! The protocol task borrows fixed-size buffers from a recycle channel,
//! fills them and submits `(offset, buffer)` pairs; a dedicated thread
//! drains the submission queue in FIFO order and commits to the
//! container. When the pool is drained `get_buffer` blocks, which is
//! the backpressure path towards the network reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::vhd::{VhdError, VhdFile};

pub type OwnedBlock = Vec<u8>;

const DEFAULT_POOL_BLOCKS: usize = 8;

enum WriterCmd {
    Block { offset: u64, block: OwnedBlock },
    Sync(Sender<Result<(), String>>),
    Shutdown,
    ExitNow,
}

pub struct ImageWriter {
    cmd_tx: Sender<WriterCmd>,
    buf_tx: Sender<OwnedBlock>,
    buf_rx: Receiver<OwnedBlock>,
    had_error: Arc<AtomicBool>,
    handle: Option<JoinHandle<(VhdFile, Result<(), VhdError>)>>,
    block_size: usize,
}

impl ImageWriter {
    pub fn new(container: VhdFile, block_size: usize) -> Self {
        Self::with_pool(container, block_size, DEFAULT_POOL_BLOCKS)
    }

    pub fn with_pool(container: VhdFile, block_size: usize, pool_blocks: usize) -> Self {
        let pool_blocks = pool_blocks.max(2);
        let (buf_tx, buf_rx) = bounded(pool_blocks);
        for _ in 0..pool_blocks {
            buf_tx.send(vec![0u8; block_size]).expect("pool channel sized to pool");
        }

        let (cmd_tx, cmd_rx) = bounded(pool_blocks);
        let had_error = Arc::new(AtomicBool::new(false));

        let worker_buf_tx = buf_tx.clone();
        let worker_error = Arc::clone(&had_error);
        let handle = std::thread::Builder::new()
            .name("image-writer".into())
            .spawn(move || writer_loop(container, cmd_rx, worker_buf_tx, worker_error))
            .expect("spawning image writer thread");

        Self {
            cmd_tx,
            buf_tx,
            buf_rx,
            had_error,
            handle: Some(handle),
            block_size,
        }
    }

    /// Borrow a buffer from the pool; blocks while all buffers are in
    /// flight. A dead writer hands out fresh buffers so the caller can
    /// reach its own error handling instead of deadlocking.
    pub fn get_buffer(&self) -> OwnedBlock {
        match self.buf_rx.recv() {
            Ok(mut buf) => {
                buf.resize(self.block_size, 0);
                buf
            }
            Err(_) => vec![0u8; self.block_size],
        }
    }

    /// Hand an unused buffer back without writing it.
    pub fn return_buffer(&self, block: OwnedBlock) {
        let _ = self.buf_tx.try_send(block);
    }

    pub fn submit(&self, offset: u64, block: OwnedBlock) {
        if self.cmd_tx.send(WriterCmd::Block { offset, block }).is_err() {
            self.had_error.store(true, Ordering::SeqCst);
        }
    }

    /// Wait until every submitted block has been committed and the
    /// container trailer is on disk.
    pub fn sync(&self) -> Result<(), VhdError> {
        let (ack_tx, ack_rx) = bounded(1);
        if self.cmd_tx.send(WriterCmd::Sync(ack_tx)).is_err() {
            return Err(io_gone());
        }
        match ack_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(VhdError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
            Err(_) => Err(io_gone()),
        }
    }

    pub fn had_error(&self) -> bool {
        self.had_error.load(Ordering::SeqCst)
    }

    /// Drain the queue, sync the container and hand it back.
    pub fn shutdown(mut self) -> Result<VhdFile, VhdError> {
        let _ = self.cmd_tx.send(WriterCmd::Shutdown);
        let (container, result) = self
            .handle
            .take()
            .expect("writer joined twice")
            .join()
            .map_err(|_| io_gone())?;
        result?;
        if self.had_error() {
            return Err(io_gone());
        }
        Ok(container)
    }

    /// Abort path: pending buffers are discarded, nothing is synced.
    pub fn exit_now(mut self) {
        let _ = self.cmd_tx.send(WriterCmd::ExitNow);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.cmd_tx.send(WriterCmd::ExitNow);
            let _ = handle.join();
        }
    }
}

fn io_gone() -> VhdError {
    VhdError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "image writer is gone",
    ))
}

fn writer_loop(
    mut container: VhdFile,
    cmd_rx: Receiver<WriterCmd>,
    buf_tx: Sender<OwnedBlock>,
    had_error: Arc<AtomicBool>,
) -> (VhdFile, Result<(), VhdError>) {
    let mut result = Ok(());

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WriterCmd::Block { offset, block } => {
                if !had_error.load(Ordering::SeqCst) {
                    if let Err(err) = container.write(offset, &block) {
                        log::error!("image writer: write at {} failed - {}", offset, err);
                        had_error.store(true, Ordering::SeqCst);
                        result = Err(err);
                    }
                }
                // recycle even after an error so the producer never blocks
                let _ = buf_tx.send(block);
            }
            WriterCmd::Sync(ack) => {
                let sync_result = if had_error.load(Ordering::SeqCst) {
                    Err("previous write failed".to_string())
                } else {
                    container.sync().map_err(|err| {
                        had_error.store(true, Ordering::SeqCst);
                        err.to_string()
                    })
                };
                let _ = ack.send(sync_result);
            }
            WriterCmd::Shutdown => {
                if !had_error.load(Ordering::SeqCst) {
                    if let Err(err) = container.sync() {
                        had_error.store(true, Ordering::SeqCst);
                        result = Err(err);
                    }
                }
                break;
            }
            WriterCmd::ExitNow => break,
        }
    }

    (container, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{OpenMode, ALLOC_BLOCK_SIZE};

    const BLOCK: usize = 64 * 1024;

    #[test]
    fn writes_commit_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.vhd");
        let container =
            VhdFile::create(&path, 2 * ALLOC_BLOCK_SIZE, ALLOC_BLOCK_SIZE as u32, false).unwrap();

        let writer = ImageWriter::with_pool(container, BLOCK, 4);
        for i in 0..8u8 {
            let mut buf = writer.get_buffer();
            buf.iter_mut().for_each(|byte| *byte = i + 1);
            writer.submit(i as u64 * BLOCK as u64, buf);
        }
        writer.sync().unwrap();
        assert!(!writer.had_error());
        let mut container = writer.shutdown().unwrap();

        let mut buf = vec![0u8; BLOCK];
        for i in 0..8u8 {
            container.read(i as u64 * BLOCK as u64, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == i + 1));
        }
    }

    #[test]
    fn error_is_latched_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.vhd");
        let container =
            VhdFile::create(&path, ALLOC_BLOCK_SIZE, ALLOC_BLOCK_SIZE as u32, false).unwrap();

        let writer = ImageWriter::with_pool(container, BLOCK, 2);
        let buf = writer.get_buffer();
        // out of range write fails in the worker
        writer.submit(4 * ALLOC_BLOCK_SIZE, buf);
        assert!(writer.sync().is_err());
        assert!(writer.had_error());
        assert!(writer.shutdown().is_err());
    }

    #[test]
    fn exit_now_discards_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abort.vhd");
        let container =
            VhdFile::create(&path, ALLOC_BLOCK_SIZE, ALLOC_BLOCK_SIZE as u32, false).unwrap();

        let writer = ImageWriter::with_pool(container, BLOCK, 2);
        let buf = writer.get_buffer();
        writer.submit(0, buf);
        writer.exit_now();

        // never synced, so the container reads back as incomplete
        match VhdFile::open(&path, OpenMode::Read) {
            Err(VhdError::Incomplete(_)) => {}
            other => panic!("expected Incomplete, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn buffers_recycle_through_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.vhd");
        let container =
            VhdFile::create(&path, ALLOC_BLOCK_SIZE, ALLOC_BLOCK_SIZE as u32, false).unwrap();

        let writer = ImageWriter::with_pool(container, BLOCK, 2);
        // more submissions than pool entries; completes only if the
        // worker hands buffers back
        for i in 0..16u64 {
            let buf = writer.get_buffer();
            writer.submit((i % 4) * BLOCK as u64, buf);
        }
        writer.sync().unwrap();
        writer.shutdown().unwrap();
    }
}
