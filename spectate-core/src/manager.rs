//! Catalog of stored replays under `<base_dir>/<platformID>/<gameID>/`.
//!
//! The directory tree is the only source of truth; nothing is cached.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::metadata::{GameKey, GameMetadata};
use crate::region::Region;
use crate::replay::Replay;
use crate::storage::{
    ensure_user_writable_dir, ExpandedFormatter, ReplayDataLoader, StorageError,
};

/// A complete replay together with the storage its payloads are read from.
#[derive(Debug, Clone)]
pub struct StoredReplay {
    pub replay: Replay,
    pub storage: ExpandedFormatter,
}

/// A catalog entry that cannot be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteReplay {
    pub key: GameKey,
    pub dir: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ReplayManager {
    base_dir: PathBuf,
}

fn is_game_dir_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn require_spectatable(region: &'static Region) -> Result<&'static Region, StorageError> {
    if region.is_spectatable() {
        Ok(region)
    } else {
        Err(StorageError::InvalidRegion(region.code))
    }
}

/// Loads and fully checks the replay stored in `dir`.
fn inspect(dir: &Path) -> Result<StoredReplay, StorageError> {
    let storage = ExpandedFormatter::open_existing(dir)?;
    if !storage.has_end_of_game_stats() {
        return Err(StorageError::Incomplete(dir.to_path_buf()));
    }
    let replay = Replay::load(&storage)?;
    Ok(StoredReplay { replay, storage })
}

impl ReplayManager {
    /// Uses `base_dir` as catalog root, creating it if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        ensure_user_writable_dir(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn game_dir(&self, region: &'static Region, game_id: u64) -> Result<PathBuf, StorageError> {
        let region = require_spectatable(region)?;
        Ok(self
            .base_dir
            .join(region.platform_id)
            .join(game_id.to_string()))
    }

    /// Returns a fully downloaded replay. Payloads stay on disk.
    pub fn get(&self, region: &'static Region, game_id: u64) -> Result<StoredReplay, StorageError> {
        let dir = self.game_dir(region, game_id)?;
        if !dir.exists() {
            return Err(StorageError::NotFound(dir));
        }
        let stored = inspect(&dir)?;
        let key = &stored.replay.meta_data.game_key;
        if key.platform_id != region.platform_id || key.game_id != game_id {
            return Err(StorageError::GameKeyMismatch {
                dir,
                found: key.clone(),
            });
        }
        Ok(stored)
    }

    /// Prepares an empty location for a new download.
    pub fn create(
        &self,
        region: &'static Region,
        game_id: u64,
    ) -> Result<ExpandedFormatter, StorageError> {
        let dir = self.game_dir(region, game_id)?;
        let storage = ExpandedFormatter::open(&dir)?;
        let has_content = fs::read_dir(&dir)
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?
            .filter_map(Result::ok)
            .any(|e| e.file_name() != "version");
        if has_content {
            return Err(StorageError::AlreadyExists(dir));
        }
        Ok(storage)
    }

    /// Opens a location for a resumed download, returning whatever header it holds.
    pub fn resume(
        &self,
        region: &'static Region,
        game_id: u64,
    ) -> Result<(Replay, ExpandedFormatter), StorageError> {
        let dir = self.game_dir(region, game_id)?;
        let storage = ExpandedFormatter::open(&dir)?;
        let replay = if storage.has_header() {
            Replay::load_header(&storage)?
        } else {
            Replay::new()
        };
        Ok((replay, storage))
    }

    /// Saves a complete replay, header and payloads, at the location derived from its
    /// own game key.
    pub fn store(&self, replay: &Replay) -> Result<ExpandedFormatter, StorageError> {
        let key = &replay.meta_data.game_key;
        let region = Region::by_platform_id(&key.platform_id)
            .ok_or_else(|| StorageError::UnknownPlatform(key.platform_id.clone()))?;
        let storage = ExpandedFormatter::open(self.game_dir(region, key.game_id)?)?;
        replay.save_with_data(&storage)?;
        tracing::info!(platform = %key.platform_id, game = key.game_id, "stored replay");
        Ok(storage)
    }

    /// Recursively removes a replay. Removing a missing replay succeeds.
    pub fn delete(&self, region: &'static Region, game_id: u64) -> Result<(), StorageError> {
        let dir = self.game_dir(region, game_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(platform = region.platform_id, game = game_id, "deleted replay");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path: dir, source }),
        }
    }

    /// Numeric game directories of one region, with their game IDs.
    fn scan_region(&self, region: &'static Region) -> Result<Vec<(u64, PathBuf)>, StorageError> {
        let region_dir = self.base_dir.join(region.platform_id);
        let entries = match fs::read_dir(&region_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                if region_dir.exists() && !region_dir.is_dir() {
                    return Err(StorageError::NotADirectory(region_dir));
                }
                return Err(StorageError::Io {
                    path: region_dir,
                    source,
                });
            }
        };
        let mut games = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: region_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_game_dir_name(&name) || !entry.path().is_dir() {
                continue;
            }
            if let Ok(id) = name.parse() {
                games.push((id, entry.path()));
            }
        }
        Ok(games)
    }

    /// Complete replays of one region, most recent (highest game ID) first.
    pub fn replays_in(&self, region: &'static Region) -> Result<Vec<GameMetadata>, StorageError> {
        let region = require_spectatable(region)?;
        let mut res = Vec::new();
        for (id, dir) in self.scan_region(region)? {
            match inspect(&dir) {
                Ok(stored) => res.push(stored.replay.meta_data),
                Err(e) => tracing::debug!(dir = %dir.display(), game = id, "skipping: {e}"),
            }
        }
        res.sort_by(|a, b| b.game_key.cmp(&a.game_key));
        Ok(res)
    }

    /// Every complete replay, sorted by (platform ID, game ID) descending.
    pub fn replays(&self) -> Result<Vec<GameMetadata>, StorageError> {
        let mut res = Vec::new();
        for region in Region::spectatable() {
            res.extend(self.replays_in(region)?);
        }
        res.sort_by(|a, b| {
            (&b.game_key.platform_id, b.game_key.game_id)
                .cmp(&(&a.game_key.platform_id, a.game_key.game_id))
        });
        Ok(res)
    }

    /// Most recent complete replay of a region.
    pub fn latest(&self, region: &'static Region) -> Result<Option<u64>, StorageError> {
        Ok(self
            .replays_in(region)?
            .first()
            .map(|gm| gm.game_key.game_id))
    }

    /// Numeric entries that would not be listed by [`replays`](Self::replays).
    pub fn incomplete(&self) -> Result<Vec<IncompleteReplay>, StorageError> {
        let mut res = Vec::new();
        for region in Region::spectatable() {
            for (game_id, dir) in self.scan_region(region)? {
                if let Err(e) = inspect(&dir) {
                    res.push(IncompleteReplay {
                        key: GameKey {
                            game_id,
                            platform_id: region.platform_id.to_string(),
                        },
                        dir,
                        reason: e.to_string(),
                    });
                }
            }
        }
        res.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(res)
    }

    /// Deletes every incomplete entry, returning what was removed.
    pub fn remove_incomplete(&self) -> Result<Vec<IncompleteReplay>, StorageError> {
        let found = self.incomplete()?;
        for entry in &found {
            tracing::info!(dir = %entry.dir.display(), reason = %entry.reason, "removing incomplete replay");
            fs::remove_dir_all(&entry.dir).map_err(|source| StorageError::Io {
                path: entry.dir.clone(),
                source,
            })?;
        }
        Ok(found)
    }

    /// Deletes complete replays beyond the `limit` most recent ones of each region, and
    /// those created more than `max_age` before `now`. Returns the deleted keys.
    pub fn garbage_collect(
        &self,
        limit: Option<usize>,
        max_age: Option<chrono::Duration>,
        now: NaiveDateTime,
    ) -> Result<Vec<GameKey>, StorageError> {
        let mut deleted = Vec::new();
        for region in Region::spectatable() {
            for (rank, gm) in self.replays_in(region)?.into_iter().enumerate() {
                let over_limit = limit.is_some_and(|l| rank >= l);
                let too_old = match max_age {
                    Some(age) if !gm.create_time.is_zero() => {
                        now.signed_duration_since(gm.create_time.datetime()) > age
                    }
                    _ => false,
                };
                if over_limit || too_old {
                    self.delete(region, gm.game_key.game_id)?;
                    deleted.push(gm.game_key);
                }
            }
        }
        Ok(deleted)
    }
}
