use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::event::ChangeEvent;

/// When appended frames reach the disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every append.
    EveryWrite,
    /// Hand the write to the OS and let it flush.
    #[default]
    OsDefault,
}

/// What a checkpoint does with frames that were fully processed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalRetention {
    /// Compact them out of the file.
    #[default]
    DeleteOnCheckpoint,
    /// Leave the file untouched, for auditing.
    KeepAll,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub sync_mode: SyncMode,
    pub retention: WalRetention,
}

/// `u32` payload length followed by the `u32` CRC32 of the payload, both
/// little-endian.
const FRAME_HEADER: usize = 8;

/// Serialize `event` into one length-prefixed, checksummed frame.
fn encode_frame(event: &ChangeEvent) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_vec(event).map_err(|e| FeedError::Serialization(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| FeedError::Serialization(format!("event {} too large", event.id)))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

enum Frame<'a> {
    Intact(&'a [u8]),
    Corrupt,
}

/// Split the next frame off `buf`. `None` means the remaining bytes do not
/// hold a complete frame.
fn next_frame(buf: &[u8]) -> Option<(Frame<'_>, &[u8])> {
    let header = buf.get(..FRAME_HEADER)?;
    let len = u32::from_le_bytes(header[..4].try_into().ok()?) as usize;
    let crc = u32::from_le_bytes(header[4..].try_into().ok()?);
    if len == 0 {
        return None;
    }
    let end = FRAME_HEADER.checked_add(len)?;
    let payload = buf.get(FRAME_HEADER..end)?;
    let frame = if crc32fast::hash(payload) == crc {
        Frame::Intact(payload)
    } else {
        Frame::Corrupt
    };
    Some((frame, &buf[end..]))
}

/// Decode every usable event in `bytes`.
///
/// Frames with a bad checksum or an undecodable payload are skipped. An
/// incomplete frame at the end is a torn write and ends the scan.
fn decode_frames(bytes: &[u8]) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let Some((frame, tail)) = next_frame(rest) else {
            warn!(
                at = bytes.len() - rest.len(),
                remaining = rest.len(),
                "incomplete WAL frame; ignoring the tail"
            );
            break;
        };
        let at = bytes.len() - rest.len();
        rest = tail;

        let payload = match frame {
            Frame::Intact(payload) => payload,
            Frame::Corrupt => {
                warn!(at, "WAL frame checksum mismatch; skipping");
                continue;
            }
        };
        match serde_json::from_slice::<ChangeEvent>(payload) {
            Ok(event) if event.verify_integrity() => events.push(event),
            Ok(event) => warn!(at, id = %event.id, "WAL event fails its integrity hash; skipping"),
            Err(e) => warn!(at, error = %e, "undecodable WAL frame; skipping"),
        }
    }
    events
}

struct LogFile {
    file: File,
    len: u64,
}

/// Append-only file of change events, one checksummed frame per event.
///
/// Compaction rewrites the surviving frames into a sibling file and renames
/// it over the log, so a crash mid-compaction leaves either the old or the
/// new file in place.
pub struct WriteAheadLog {
    path: PathBuf,
    log: Mutex<LogFile>,
    config: WalConfig,
}

impl WriteAheadLog {
    pub fn open(path: &Path, config: WalConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = Self::open_for_append(path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "WAL opened");
        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(LogFile { file, len }),
            config,
        })
    }

    fn open_for_append(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogFile>> {
        self.log.lock().map_err(|_| FeedError::LockPoisoned("WAL file"))
    }

    /// Append `event` as one frame. Returns the log length after the write.
    pub fn append(&self, event: &ChangeEvent) -> Result<u64> {
        let frame = encode_frame(event)?;
        let mut log = self.lock()?;
        log.file.write_all(&frame)?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            log.file.sync_data()?;
        }
        log.len += frame.len() as u64;
        debug!(seq = event.seq, bytes = frame.len(), len = log.len, "WAL append");
        Ok(log.len)
    }

    /// Every readable event, in append order.
    pub fn recover(&self) -> Result<Vec<ChangeEvent>> {
        let _log = self.lock()?;
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(decode_frames(&bytes))
    }

    /// Drop every event with `seq <= through_seq` from the log.
    ///
    /// Returns how many events were dropped. A no-op under
    /// [`WalRetention::KeepAll`].
    pub fn compact(&self, through_seq: u64) -> Result<usize> {
        if self.config.retention == WalRetention::KeepAll {
            return Ok(0);
        }

        let mut log = self.lock()?;
        if log.len == 0 {
            return Ok(0);
        }
        let mut kept = Vec::new();
        let mut dropped = 0;
        for event in decode_frames(&fs::read(&self.path)?) {
            if event.seq > through_seq {
                kept.extend_from_slice(&encode_frame(&event)?);
            } else {
                dropped += 1;
            }
        }

        let staging = self.path.with_extension("compact");
        {
            let mut file = File::create(&staging)?;
            file.write_all(&kept)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &self.path)?;

        log.file = Self::open_for_append(&self.path)?;
        log.len = kept.len() as u64;
        info!(through_seq, dropped, len = log.len, "WAL compacted");
        Ok(dropped)
    }

    /// Current size of the log in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.lock()?.len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
