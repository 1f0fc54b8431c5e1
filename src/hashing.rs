//! Resumable SHA-256 accumulation.
//!
//! `sha2::Sha256` keeps its chaining state private, so a download that is
//! interrupted cannot hand its running hash to the next process. This module
//! drives the raw SHA-256 compression function from `sha2` itself and keeps
//! the chaining words, the byte count and the pending partial block in the
//! open, which makes the accumulator exportable.
//!
//! Exported state layout (`EXPORTED_STATE_LEN` bytes, all integers big-endian):
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | state format version (`STATE_VERSION`)  |
//! | 1      | 32   | eight `u32` chaining words              |
//! | 33     | 8    | `u64` number of bytes consumed          |
//! | 41     | 1    | pending block length (0..=63)           |
//! | 42     | 64   | pending block, zero padded              |

use anyhow::{bail, Context, Result};
use sha2::digest::generic_array::{typenum::U64, GenericArray};
use sha2::{compress256, Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const BLOCK_LEN: usize = 64;

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Version tag written as the first byte of an exported state.
pub const STATE_VERSION: u8 = 1;

/// Length of the buffer produced by [`ChecksumState::export_state`].
pub const EXPORTED_STATE_LEN: usize = 1 + 32 + 8 + 1 + BLOCK_LEN;

/// Block size used when hashing a file already on disk.
pub const FILE_HASH_BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumState {
    state: [u32; 8],
    consumed: u64,
    pending: [u8; BLOCK_LEN],
    pending_len: usize,
}

impl Default for ChecksumState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumState {
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            consumed: 0,
            pending: [0; BLOCK_LEN],
            pending_len: 0,
        }
    }

    /// Number of bytes folded in so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.consumed += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK_LEN - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len < BLOCK_LEN {
                return;
            }
            let block = self.pending;
            self.compress(&block);
            self.pending_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            self.compress(block);
        }

        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    /// Lowercase hex digest of everything consumed so far. The accumulator
    /// itself is left untouched, so more data may still be added.
    pub fn digest(&self) -> String {
        let mut state = self.state;
        let bit_len = self.consumed.wrapping_mul(8);

        let mut tail = [0u8; BLOCK_LEN * 2];
        tail[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
        tail[self.pending_len] = 0x80;
        let tail_len = if self.pending_len < BLOCK_LEN - 8 {
            BLOCK_LEN
        } else {
            BLOCK_LEN * 2
        };
        tail[tail_len - 8..tail_len].copy_from_slice(&bit_len.to_be_bytes());

        for block in tail[..tail_len].chunks_exact(BLOCK_LEN) {
            compress256(
                &mut state,
                std::slice::from_ref(GenericArray::<u8, U64>::from_slice(block)),
            );
        }

        let mut out = [0u8; 32];
        for (word, bytes) in state.iter().zip(out.chunks_exact_mut(4)) {
            bytes.copy_from_slice(&word.to_be_bytes());
        }
        hex::encode(out)
    }

    pub fn export_state(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EXPORTED_STATE_LEN);
        out.push(STATE_VERSION);
        for word in self.state {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&self.consumed.to_be_bytes());
        out.push(self.pending_len as u8);
        out.extend_from_slice(&self.pending[..self.pending_len]);
        out.resize(EXPORTED_STATE_LEN, 0);
        out
    }

    pub fn import_state(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EXPORTED_STATE_LEN {
            bail!(
                "hash state has {} bytes, expected {}",
                bytes.len(),
                EXPORTED_STATE_LEN
            );
        }
        if bytes[0] != STATE_VERSION {
            bail!("unsupported hash state version {}", bytes[0]);
        }

        let mut state = [0u32; 8];
        for (word, raw) in state.iter_mut().zip(bytes[1..33].chunks_exact(4)) {
            *word = u32::from_be_bytes(raw.try_into().context("chaining word")?);
        }
        let consumed = u64::from_be_bytes(bytes[33..41].try_into().context("byte count")?);
        let pending_len = bytes[41] as usize;
        if pending_len >= BLOCK_LEN {
            bail!("pending block length {} out of range", pending_len);
        }
        if consumed % BLOCK_LEN as u64 != pending_len as u64 {
            bail!(
                "pending block length {} disagrees with byte count {}",
                pending_len,
                consumed
            );
        }

        let mut pending = [0u8; BLOCK_LEN];
        pending[..pending_len].copy_from_slice(&bytes[42..42 + pending_len]);

        Ok(Self {
            state,
            consumed,
            pending,
            pending_len,
        })
    }

    fn compress(&mut self, block: &[u8]) {
        compress256(
            &mut self.state,
            std::slice::from_ref(GenericArray::<u8, U64>::from_slice(block)),
        );
    }
}

/// Streams a finished file through SHA-256 in fixed-size blocks.
pub async fn hash_of_file(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath)
        .await
        .with_context(|| format!("Failed to open {} for hashing", filepath.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; FILE_HASH_BLOCK_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
