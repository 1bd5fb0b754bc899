//! Per-image hash sidecar: one SHA-256 digest per allocation block,
//! appended in block order during ingest.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lazy_static::lazy_static;
use openssl::sha::{sha256, Sha256};
use thiserror::Error;

use super::vhd::VhdFile;
use super::SHA_SIZE;

lazy_static! {
    static ref ZERO_DIGESTS: Mutex<HashMap<u64, [u8; 32]>> = Mutex::new(HashMap::new());
}

/// Digest of an all-zero allocation block, cached per block size.
pub fn zero_block_digest(block_size: u64) -> [u8; 32] {
    let mut cache = ZERO_DIGESTS.lock().unwrap();
    *cache
        .entry(block_size)
        .or_insert_with(|| sha256(&vec![0u8; block_size as usize]))
}

#[derive(Debug, Error)]
pub enum HashFileError {
    #[error("hash sidecar {0:?} is truncated")]
    ShortRead(PathBuf),
    #[error("digest mismatch at allocation block {block}")]
    Mismatch { block: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct HashFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl HashFile {
    pub fn create(path: &Path) -> Result<Self, HashFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: 0,
        })
    }

    pub fn open(path: &Path) -> Result<Self, HashFileError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn open_readonly(path: &Path) -> Result<Self, HashFileError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    /// Number of digests a complete sidecar holds.
    pub fn expected_count(drive_size: u64, block_size: u64) -> u64 {
        (drive_size + block_size - 1) / block_size
    }

    pub fn digest_count(&self) -> u64 {
        self.len / SHA_SIZE as u64
    }

    pub fn byte_len(&self) -> u64 {
        self.len
    }

    pub fn append_digest(&mut self, digest: &[u8; 32]) -> Result<(), HashFileError> {
        self.file.write_all_at(digest, self.len)?;
        self.len += SHA_SIZE as u64;
        Ok(())
    }

    /// Positioned write; a transfer that restarts at an earlier block
    /// overwrites the digests it recomputes instead of appending
    /// duplicates.
    pub fn write_digest_at(&mut self, index: u64, digest: &[u8; 32]) -> Result<(), HashFileError> {
        let offset = index * SHA_SIZE as u64;
        self.file.write_all_at(digest, offset)?;
        self.len = self.len.max(offset + SHA_SIZE as u64);
        Ok(())
    }

    pub fn digest_at(&self, index: u64) -> Result<[u8; 32], HashFileError> {
        let offset = index * SHA_SIZE as u64;
        if offset + SHA_SIZE as u64 > self.len {
            return Err(HashFileError::ShortRead(self.path.clone()));
        }
        let mut digest = [0u8; 32];
        self.file.read_exact_at(&mut digest, offset)?;
        Ok(digest)
    }

    /// The raw sidecar bytes, as sent to the client of the next
    /// incremental transfer.
    pub fn read_all(&self) -> Result<Vec<u8>, HashFileError> {
        let mut data = vec![0u8; self.len as usize];
        self.file.read_exact_at(&mut data, 0)?;
        Ok(data)
    }

    pub fn sync(&mut self) -> Result<(), HashFileError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Recompute and append the digests a truncated sidecar is missing,
    /// reading block content back from the container.
    pub fn repair_from(
        &mut self,
        container: &mut VhdFile,
        data_offset: u64,
        drive_size: u64,
        block_size: u64,
    ) -> Result<u64, HashFileError> {
        let expected = Self::expected_count(drive_size, block_size);
        let mut appended = 0;
        let mut buf = vec![0u8; block_size as usize];
        while self.digest_count() < expected {
            let index = self.digest_count();
            read_padded(container, data_offset, drive_size, block_size, index, &mut buf)?;
            self.append_digest(&sha256(&buf))?;
            appended += 1;
        }
        if appended > 0 {
            self.sync()?;
        }
        Ok(appended)
    }

    /// Verify every digest against the container content.
    pub fn verify_container(
        &self,
        container: &mut VhdFile,
        data_offset: u64,
        drive_size: u64,
        block_size: u64,
    ) -> Result<(), HashFileError> {
        let expected = Self::expected_count(drive_size, block_size);
        if self.digest_count() < expected {
            return Err(HashFileError::ShortRead(self.path.clone()));
        }
        let mut buf = vec![0u8; block_size as usize];
        for index in 0..expected {
            read_padded(container, data_offset, drive_size, block_size, index, &mut buf)?;
            if sha256(&buf) != self.digest_at(index)? {
                return Err(HashFileError::Mismatch { block: index });
            }
        }
        Ok(())
    }
}

/// Read allocation block `index` of the volume data, zero-padding the
/// final partial block; the hash always covers whole blocks.
fn read_padded(
    container: &mut VhdFile,
    data_offset: u64,
    drive_size: u64,
    block_size: u64,
    index: u64,
    buf: &mut [u8],
) -> Result<(), HashFileError> {
    let start = index * block_size;
    let avail = (drive_size - start).min(block_size) as usize;
    buf[avail..].iter_mut().for_each(|byte| *byte = 0);
    container
        .read(data_offset + start, &mut buf[..avail])
        .map_err(|err| HashFileError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))?;
    Ok(())
}

/// Rolling SHA-256 over the client blocks of one allocation block.
pub struct RollingDigest {
    ctx: Sha256,
}

impl RollingDigest {
    pub fn new() -> Self {
        Self { ctx: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
    }

    /// Finish the current block digest and reset for the next one.
    pub fn finish_reset(&mut self) -> [u8; 32] {
        let ctx = std::mem::replace(&mut self.ctx, Sha256::new());
        ctx.finish()
    }
}

impl Default for RollingDigest {
    fn default() -> Self {
        Self::new()
    }
}
