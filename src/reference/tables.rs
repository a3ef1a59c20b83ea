//! Tracked users and beatmap metadata.

use crate::error::{Result, TrackerError};
use crate::types::{Beatmap, BeatmapId, Mode, Timestamp, TrackedUser, UserId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for the user checkpoint.
const CHECKPOINT_MAGIC: &[u8; 4] = b"USR\0";

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u8 = 1;

#[derive(Debug, Default)]
struct UserTable {
    by_id: HashMap<UserId, TrackedUser>,
    /// Lowercased username -> id.
    by_name: HashMap<String, UserId>,
}

impl UserTable {
    fn unlink_name(&mut self, user: &TrackedUser) {
        let key = user.username.to_lowercase();
        if self.by_name.get(&key) == Some(&user.id) {
            self.by_name.remove(&key);
        }
    }
}

/// `last_seen` moves on every ingestion, including ones that write no row,
/// so it is checkpointed separately and overlaid after replay.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    last_seen: HashMap<UserId, Timestamp>,
}

/// Reference tables: tracked users and beatmaps.
#[derive(Debug, Default)]
pub struct ReferenceTables {
    users: RwLock<UserTable>,
    beatmaps: RwLock<HashMap<(BeatmapId, Mode), Beatmap>>,
}

impl ReferenceTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user or update its name. Returns the user as it was before.
    pub fn apply_user(&self, id: UserId, username: &str, at: Timestamp) -> Option<TrackedUser> {
        let mut table = self.users.write();

        let previous = table.by_id.get(&id).cloned();
        let user = match &previous {
            Some(existing) => {
                table.unlink_name(existing);
                TrackedUser {
                    id,
                    username: username.to_string(),
                    first_seen: existing.first_seen,
                    last_seen: existing.last_seen.max(at),
                }
            }
            None => TrackedUser {
                id,
                username: username.to_string(),
                first_seen: at,
                last_seen: at,
            },
        };

        table.by_name.insert(user.username.to_lowercase(), id);
        table.by_id.insert(id, user);
        previous
    }

    pub fn remove_user(&self, id: UserId) -> Option<TrackedUser> {
        let mut table = self.users.write();
        let removed = table.by_id.remove(&id)?;
        table.unlink_name(&removed);
        Some(removed)
    }

    /// Move `last_seen` forward. Returns false if the user isn't tracked.
    pub fn touch(&self, id: UserId, at: Timestamp) -> bool {
        match self.users.write().by_id.get_mut(&id) {
            Some(user) => {
                user.last_seen = user.last_seen.max(at);
                true
            }
            None => false,
        }
    }

    pub fn user(&self, id: UserId) -> Option<TrackedUser> {
        self.users.read().by_id.get(&id).cloned()
    }

    /// Case-insensitive lookup by current username.
    pub fn user_by_name(&self, name: &str) -> Option<TrackedUser> {
        let table = self.users.read();
        let id = table.by_name.get(&name.trim().to_lowercase())?;
        table.by_id.get(id).cloned()
    }

    pub fn contains_user(&self, id: UserId) -> bool {
        self.users.read().by_id.contains_key(&id)
    }

    /// Insert or replace a beatmap. Returns false if the stored copy was identical.
    pub fn apply_beatmap(&self, beatmap: Beatmap) -> bool {
        let mut beatmaps = self.beatmaps.write();
        let key = (beatmap.beatmap_id, beatmap.mode);
        if beatmaps.get(&key) == Some(&beatmap) {
            return false;
        }
        beatmaps.insert(key, beatmap);
        true
    }

    pub fn beatmap(&self, id: BeatmapId, mode: Mode) -> Option<Beatmap> {
        self.beatmaps.read().get(&(id, mode)).cloned()
    }

    pub fn beatmap_differs(&self, beatmap: &Beatmap) -> bool {
        self.beatmaps
            .read()
            .get(&(beatmap.beatmap_id, beatmap.mode))
            != Some(beatmap)
    }

    pub fn user_count(&self) -> u64 {
        self.users.read().by_id.len() as u64
    }

    pub fn beatmap_count(&self) -> u64 {
        self.beatmaps.read().len() as u64
    }

    /// Write the `last_seen` checkpoint. Written to a temporary file and
    /// renamed into place.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let checkpoint = Checkpoint {
            last_seen: self
                .users
                .read()
                .by_id
                .values()
                .map(|user| (user.id, user.last_seen))
                .collect(),
        };
        let encoded = rmp_serde::to_vec(&checkpoint)?;

        let mut buf = Vec::with_capacity(4 + 1 + 8 + encoded.len() + 4);
        buf.extend_from_slice(CHECKPOINT_MAGIC);
        buf.push(CHECKPOINT_VERSION);
        buf.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        buf.extend_from_slice(&encoded);
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Overlay a saved checkpoint. Only ever moves `last_seen` forward, and
    /// ignores users that are no longer tracked. Returns how many users moved.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }

        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;

        if raw.len() < 4 + 1 + 8 + 4 {
            return Err(TrackerError::InvalidFormat("user checkpoint too short".into()));
        }
        if &raw[0..4] != CHECKPOINT_MAGIC {
            return Err(TrackerError::InvalidFormat("invalid user checkpoint magic".into()));
        }
        if raw[4] != CHECKPOINT_VERSION {
            return Err(TrackerError::InvalidFormat(format!(
                "unsupported user checkpoint version: {}",
                raw[4]
            )));
        }

        let (body, tail) = raw.split_at(raw.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(tail);
        let stored = u32::from_le_bytes(stored);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(TrackerError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&body[5..13]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if body.len() != 13 + len {
            return Err(TrackerError::Corruption(
                "user checkpoint length does not match its contents".into(),
            ));
        }

        let checkpoint: Checkpoint = rmp_serde::from_slice(&body[13..])?;
        let mut moved = 0;
        for (id, last_seen) in checkpoint.last_seen {
            let mut table = self.users.write();
            if let Some(user) = table.by_id.get_mut(&id) {
                if last_seen > user.last_seen {
                    user.last_seen = last_seen;
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }
}
