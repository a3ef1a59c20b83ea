//! Append-only row log.
//!
//! Every write the store accepts becomes one frame:
//!
//! ```text
//! magic(4) version(1) kind(1) id(8) recorded_at(8) len(4) payload(len) crc32(4)
//! ```
//!
//! The checksum covers the header and the payload. A frame is written with a
//! single `write_all`; a failed write is truncated away before the error is
//! returned, and a torn tail left by a crash is cut off on open.

use crate::error::{Result, TrackerError};
use crate::types::{
    Beatmap, BeatmapId, Mode, Regression, RowId, ScoreFields, ScoreFingerprint, ScoreOutcome,
    StatFields, Timestamp, UserId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the row log.
const LOG_MAGIC: &[u8; 4] = b"OTR\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// magic + version + kind + id + recorded_at + payload length
const FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 8 + 4;

const CHECKSUM_SIZE: usize = 4;

/// Upper bound on a single payload. Anything larger is treated as corruption.
const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Kind tag stored in the frame header, checked against the decoded row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RowKind {
    Snapshot = 1,
    Score = 2,
    Online = 3,
    User = 4,
    UserDeleted = 5,
    Beatmap = 6,
}

impl RowKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(RowKind::Snapshot),
            2 => Ok(RowKind::Score),
            3 => Ok(RowKind::Online),
            4 => Ok(RowKind::User),
            5 => Ok(RowKind::UserDeleted),
            6 => Ok(RowKind::Beatmap),
            other => Err(TrackerError::Corruption(format!("unknown row kind {other}"))),
        }
    }
}

/// A row as it is persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Row {
    Snapshot {
        user_id: UserId,
        mode: Mode,
        captured_at: Timestamp,
        fields: StatFields,
        regressions: Vec<Regression>,
    },
    Score {
        user_id: UserId,
        beatmap_id: BeatmapId,
        mode: Mode,
        fields: ScoreFields,
        outcome: ScoreOutcome,
        fingerprint: ScoreFingerprint,
    },
    Online {
        users: u32,
        operators: u32,
        voiced: u32,
    },
    User {
        user_id: UserId,
        username: String,
    },
    UserDeleted {
        user_id: UserId,
    },
    Beatmap(Beatmap),
}

impl Row {
    pub fn kind(&self) -> RowKind {
        match self {
            Row::Snapshot { .. } => RowKind::Snapshot,
            Row::Score { .. } => RowKind::Score,
            Row::Online { .. } => RowKind::Online,
            Row::User { .. } => RowKind::User,
            Row::UserDeleted { .. } => RowKind::UserDeleted,
            Row::Beatmap(_) => RowKind::Beatmap,
        }
    }
}

/// A row with the identity the log assigned to it.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggedRow {
    pub id: RowId,
    pub recorded_at: Timestamp,
    pub row: Row,
}

struct LogState {
    file: File,
    next_id: u64,
    size: u64,
    writes_since_sync: u64,
}

/// Append-only row log.
pub struct RowLog {
    path: PathBuf,
    state: Mutex<LogState>,
    /// fsync every N appends.
    sync_interval: u64,
}

impl RowLog {
    const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a row log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a row log, recovering from a torn tail.
    /// A sync interval of 0 or 1 syncs every append.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (valid_end, max_id) = Self::scan(&file, file_size)?;

        if valid_end < file_size {
            warn!(
                path = %path.display(),
                dropped_bytes = file_size - valid_end,
                "truncating damaged row log tail"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), size = valid_end, next_id = max_id + 1, "opened row log");

        Ok(Self {
            path,
            state: Mutex::new(LogState {
                file,
                next_id: max_id + 1,
                size: valid_end,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a row. Returns the logged row and the offset of its frame.
    ///
    /// On failure the log is left exactly as it was before the call and the
    /// id is not consumed.
    pub fn append(&self, row: Row, recorded_at: Timestamp) -> Result<(LoggedRow, u64)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let id = RowId(state.next_id);
        let frame = encode_frame(id, recorded_at, &row)?;
        let offset = state.size;

        if let Err(e) = Self::write_frame(state, offset, &frame, self.sync_interval) {
            // Best effort: drop whatever part of the frame reached the file.
            if let Err(truncate_err) = state.file.set_len(offset) {
                warn!(offset, error = %truncate_err, "failed to roll back partial frame");
            }
            return Err(e);
        }

        state.size = offset + frame.len() as u64;
        state.next_id += 1;

        Ok((
            LoggedRow {
                id,
                recorded_at,
                row,
            },
            offset,
        ))
    }

    fn write_frame(state: &mut LogState, offset: u64, frame: &[u8], sync_interval: u64) -> Result<()> {
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(frame)?;

        state.writes_since_sync += 1;
        if state.writes_since_sync >= sync_interval {
            state.file.sync_data()?;
            state.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Force all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.sync_all()?;
        state.writes_since_sync = 0;
        Ok(())
    }

    /// Read the row whose frame starts at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<LoggedRow> {
        self.read_frame_at(offset).map(|(row, _)| row)
    }

    fn read_frame_at(&self, offset: u64) -> Result<(LoggedRow, u64)> {
        let mut state = self.state.lock();
        if offset >= state.size {
            return Err(TrackerError::Corruption(format!(
                "offset {offset} is past the end of the log ({})",
                state.size
            )));
        }
        state.file.seek(SeekFrom::Start(offset))?;
        read_frame(&mut state.file)
    }

    /// Iterate rows starting at a frame boundary.
    pub fn iter_from(&self, offset: u64) -> RowIterator<'_> {
        RowIterator {
            log: self,
            offset,
            end: self.size(),
        }
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk every frame. Returns where the last valid frame ends and the
    /// largest id seen.
    fn scan(file: &File, file_size: u64) -> Result<(u64, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut max_id = 0u64;

        while offset < file_size {
            match read_frame(&mut reader) {
                Ok((row, len)) => {
                    max_id = max_id.max(row.id.0);
                    offset += len;
                }
                Err(e) => {
                    warn!(offset, error = %e, "unreadable frame in row log");
                    break;
                }
            }
        }

        Ok((offset.min(file_size), max_id))
    }
}

fn encode_frame(id: RowId, recorded_at: Timestamp, row: &Row) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(row)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TrackerError::Serialization(format!(
            "row payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    frame.extend_from_slice(LOG_MAGIC);
    frame.push(LOG_VERSION);
    frame.push(row.kind() as u8);
    frame.extend_from_slice(&id.0.to_le_bytes());
    frame.extend_from_slice(&recorded_at.0.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);

    let checksum = crc32fast::hash(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    Ok(frame)
}

/// Read one frame at the reader's position. Returns the row and the frame length.
fn read_frame<R: Read>(reader: &mut R) -> Result<(LoggedRow, u64)> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    if &header[0..4] != LOG_MAGIC {
        return Err(TrackerError::InvalidFormat("invalid frame magic".into()));
    }
    if header[4] != LOG_VERSION {
        return Err(TrackerError::InvalidFormat(format!(
            "unsupported log version: {}",
            header[4]
        )));
    }

    let kind = RowKind::from_byte(header[5])?;
    let id = RowId(u64::from_le_bytes(read_array(&header[6..14])));
    let recorded_at = Timestamp(i64::from_le_bytes(read_array(&header[14..22])));
    let payload_len = u32::from_le_bytes(read_array(&header[22..26])) as usize;

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(TrackerError::Corruption(format!(
            "frame payload length {payload_len} exceeds limit"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; CHECKSUM_SIZE];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    let computed = hasher.finalize();

    if stored != computed {
        return Err(TrackerError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let row: Row = rmp_serde::from_slice(&payload)?;
    if row.kind() != kind {
        return Err(TrackerError::Corruption(format!(
            "row {id} tagged {kind:?} but decodes as {:?}",
            row.kind()
        )));
    }

    let len = (FRAME_HEADER_SIZE + payload_len + CHECKSUM_SIZE) as u64;
    Ok((LoggedRow { id, recorded_at, row }, len))
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Iterator over the rows of a log.
pub struct RowIterator<'a> {
    log: &'a RowLog,
    offset: u64,
    end: u64,
}

impl<'a> Iterator for RowIterator<'a> {
    type Item = Result<(u64, LoggedRow)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let current = self.offset;
        match self.log.read_frame_at(current) {
            Ok((row, len)) => {
                self.offset = current + len;
                Some(Ok((current, row)))
            }
            Err(e) => {
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}
