//! Resume checkpoints for in-progress downloads.
//!
//! A partial file `<name>` in the temp directory is paired with a checkpoint
//! `<name>.downloading` recording how many bytes of it are trustworthy and the
//! hash accumulator state after those bytes. The directory also holds a
//! `.version` marker naming the checkpoint format; checkpoints from any other
//! format are removed at startup rather than misread.
//!
//! Checkpoint layout (little-endian):
//!
//! | offset | size | field                                       |
//! |--------|------|---------------------------------------------|
//! | 0      | 4    | magic `b"MFCK"`                             |
//! | 4      | 2    | `u16` format version (`CHECKPOINT_VERSION`) |
//! | 6      | 8    | `u64` resume offset                         |
//! | 14     | 106  | exported [`ChecksumState`]                  |
//! | 120    | 4    | `u32` CRC-32 of bytes 0..120                |

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::hashing::{ChecksumState, EXPORTED_STATE_LEN};

pub const CHECKPOINT_EXTENSION: &str = "downloading";
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"MFCK";
pub const CHECKPOINT_VERSION: u16 = 3;
pub const VERSION_MARKER: &str = ".version";

const HEADER_LEN: usize = 4 + 2 + 8;
const BODY_LEN: usize = HEADER_LEN + EXPORTED_STATE_LEN;
const CHECKPOINT_LEN: usize = BODY_LEN + 4;

/// Outcome of reading a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointState {
    Valid { offset: u64, checksum: ChecksumState },
    Absent,
}

pub struct ResumeCheckpoint {
    partial: PathBuf,
    path: PathBuf,
}

impl ResumeCheckpoint {
    /// Checkpoint paired with the given partial file.
    pub fn for_partial(partial: &Path) -> Self {
        let mut name = partial.as_os_str().to_os_string();
        name.push(".");
        name.push(CHECKPOINT_EXTENSION);
        Self {
            partial: partial.to_path_buf(),
            path: PathBuf::from(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint. Missing, corrupt, foreign-format or inconsistent
    /// checkpoints all come back as [`CheckpointState::Absent`].
    pub async fn load(&self) -> CheckpointState {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint");
                return CheckpointState::Absent;
            }
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read checkpoint: {}", e);
                return CheckpointState::Absent;
            }
        };

        let (offset, checksum) = match decode(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring unreadable checkpoint: {:#}", e);
                return CheckpointState::Absent;
            }
        };

        let partial_len = match fs::metadata(&self.partial).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                warn!(partial = %self.partial.display(), "checkpoint without partial file");
                return CheckpointState::Absent;
            }
        };
        if offset > partial_len {
            warn!(offset, partial_len, "checkpoint offset beyond partial file, restarting");
            return CheckpointState::Absent;
        }

        CheckpointState::Valid { offset, checksum }
    }

    /// Replaces the checkpoint via a temp file and rename, so a crash leaves
    /// either the previous or the new checkpoint in place.
    pub async fn store(&self, offset: u64, checksum: &ChecksumState) -> bool {
        match self.try_store(offset, checksum).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), "failed to store checkpoint: {:#}", e);
                false
            }
        }
    }

    async fn try_store(&self, offset: u64, checksum: &ChecksumState) -> Result<()> {
        let bytes = encode(offset, checksum);
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, &bytes)
            .await
            .context("Failed to write checkpoint")?;
        fs::rename(&tmp, &self.path)
            .await
            .context("Failed to replace checkpoint")?;
        Ok(())
    }

    pub async fn discard(&self) {
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "checkpoint removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove checkpoint: {}", e),
        }
    }
}

fn version_marker_contents() -> String {
    format!("checkpoint format {}", CHECKPOINT_VERSION)
}

fn encode(offset: u64, checksum: &ChecksumState) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHECKPOINT_LEN);
    out.extend_from_slice(&CHECKPOINT_MAGIC);
    out.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&checksum.export_state());
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn decode(bytes: &[u8]) -> Result<(u64, ChecksumState)> {
    if bytes.len() < HEADER_LEN || bytes[..4] != CHECKPOINT_MAGIC {
        bail!("not a checkpoint file");
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != CHECKPOINT_VERSION {
        bail!("checkpoint format {} is not {}", version, CHECKPOINT_VERSION);
    }
    if bytes.len() != CHECKPOINT_LEN {
        bail!("checkpoint has {} bytes, expected {}", bytes.len(), CHECKPOINT_LEN);
    }

    let (body, crc) = bytes.split_at(BODY_LEN);
    let crc = u32::from_le_bytes(crc.try_into().context("checksum field")?);
    if crc32fast::hash(body) != crc {
        bail!("checkpoint CRC mismatch");
    }

    let offset = u64::from_le_bytes(body[6..14].try_into().context("offset field")?);
    let checksum = ChecksumState::import_state(&body[HEADER_LEN..])?;
    if checksum.bytes_consumed() != offset {
        bail!(
            "hash state covers {} bytes but offset is {}",
            checksum.bytes_consumed(),
            offset
        );
    }
    Ok((offset, checksum))
}

/// Removes every `*.downloading` file in `dir` unless the version marker
/// names the current format, then writes the current marker. Returns the
/// number of checkpoints removed.
pub fn cleanup_stale_checkpoints(dir: &Path) -> Result<usize> {
    let marker = dir.join(VERSION_MARKER);
    let expected = version_marker_contents();

    if let Ok(current) = std::fs::read_to_string(&marker) {
        if current.trim() == expected {
            debug!(dir = %dir.display(), "checkpoint format is current");
            return Ok(0);
        }
    }

    let dir_str = dir
        .to_str()
        .context("checkpoint directory is not valid UTF-8")?;
    let pattern =
        Path::new(&glob::Pattern::escape(dir_str)).join(format!("*.{}", CHECKPOINT_EXTENSION));

    let mut removed = 0;
    for path in glob::glob(&pattern.to_string_lossy())?.flatten() {
        info!(path = %path.display(), "deleting checkpoint from an older format");
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to delete {}", path.display()))?;
        removed += 1;
    }

    std::fs::create_dir_all(dir)?;
    std::fs::write(&marker, expected).context("Failed to write version marker")?;
    Ok(removed)
}
