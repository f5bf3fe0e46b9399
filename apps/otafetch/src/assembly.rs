//! On-disk image assembly with a received-block bitmap.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use otafetch_protocol::{BlockRange, block_count};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block {index} is out of range ({num_blocks} blocks)")]
    OutOfRange { index: u32, num_blocks: u32 },

    #[error("block {index} is {actual} bytes, expected {expected}")]
    WrongLength {
        index: u32,
        expected: u32,
        actual: usize,
    },

    #[error("image has {0} missing blocks")]
    Incomplete(u32),

    #[error("too many blocks for one image")]
    TooLarge,
}

/// Writes blocks into their place in the output file, in any order.
pub struct Assembly {
    file: File,
    path: PathBuf,
    total_size: u64,
    block_size: u32,
    num_blocks: u32,
    received: Vec<u64>,
    remaining: u32,
}

impl Assembly {
    /// Creates (or truncates) `path` and sizes it to `total_size`.
    pub fn create(path: &Path, total_size: u64, block_size: u32) -> Result<Self, AssemblyError> {
        let num_blocks =
            u32::try_from(block_count(total_size, block_size)).map_err(|_| AssemblyError::TooLarge)?;
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_size,
            block_size,
            num_blocks,
            received: vec![0; (num_blocks as usize).div_ceil(64)],
            remaining: num_blocks,
        })
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Blocks not yet written.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn has(&self, index: u32) -> bool {
        let i = index as usize;
        self.received
            .get(i / 64)
            .is_some_and(|word| word & (1 << (i % 64)) != 0)
    }

    /// First missing block at or after `from`, wrapping around to the start.
    pub fn next_missing(&self, from: u32) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        (from..self.num_blocks)
            .chain(0..from.min(self.num_blocks))
            .find(|&i| !self.has(i))
    }

    /// Writes block `index`. Returns `false` if it was already present.
    pub fn write_block(&mut self, index: u32, data: &[u8]) -> Result<bool, AssemblyError> {
        let range = BlockRange::for_block(index, self.block_size, self.total_size).ok_or(
            AssemblyError::OutOfRange {
                index,
                num_blocks: self.num_blocks,
            },
        )?;
        if data.len() != range.length as usize {
            return Err(AssemblyError::WrongLength {
                index,
                expected: range.length,
                actual: data.len(),
            });
        }
        if self.has(index) {
            return Ok(false);
        }

        self.file.seek(SeekFrom::Start(range.start))?;
        self.file.write_all(data)?;

        let i = index as usize;
        self.received[i / 64] |= 1 << (i % 64);
        self.remaining -= 1;
        Ok(true)
    }

    /// Flushes the image and returns its hex SHA-256.
    pub fn finish(mut self) -> Result<String, AssemblyError> {
        if self.remaining > 0 {
            return Err(AssemblyError::Incomplete(self.remaining));
        }
        self.file.flush()?;
        self.file.sync_all()?;
        tracing::debug!(path = %self.path.display(), "image flushed");
        Ok(file_sha256(&self.path)?)
    }
}

/// Computes the hex SHA-256 of a file.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
