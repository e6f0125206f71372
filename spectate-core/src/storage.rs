//! Replay persistence: the loader/writer seams and the one-directory-per-game
//! "expanded" on-disk layout.
//!
//! ```text
//! <dir>/version              format version ("1")
//! <dir>/metadata.json        replay header
//! <dir>/chunk.0001.bin       chunk payloads
//! <dir>/keyframe.0001.bin    keyframe payloads
//! <dir>/endOfGameStats.bin   end of game statistics
//! ```
//!
//! A zero-length payload file counts as absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::ids::{ChunkId, KeyFrameId};
use crate::metadata::GameKey;
use crate::replay::IntegrityError;

pub const FORMAT_VERSION: &str = "1";

const VERSION_FILE: &str = "version";
const HEADER_FILE: &str = "metadata.json";
const END_OF_GAME_FILE: &str = "endOfGameStats.bin";
const CHUNK_PREFIX: &str = "chunk";
const KEY_FRAME_PREFIX: &str = "keyframe";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("{} is not user writable", .0.display())]
    NotWritable(PathBuf),
    #[error("mismatched replay format version {found:?}, expected {expected:?}")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("invalid file {file:?} in {}", .dir.display())]
    InvalidFile { dir: PathBuf, file: String },
    #[error("invalid replay header: {0}")]
    Header(#[from] serde_json::Error),
    #[error("incomplete replay: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("replay data already exists in {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("no replay stored in {}", .0.display())]
    NotFound(PathBuf),
    #[error("{} holds game {}/{}", .dir.display(), .found.platform_id, .found.game_id)]
    GameKeyMismatch { dir: PathBuf, found: GameKey },
    #[error("replay in {} is incomplete", .0.display())]
    Incomplete(PathBuf),
    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),
    #[error("region {0} has no spectator endpoint")]
    InvalidRegion(&'static str),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read side of replay persistence. `has_*` report whether a non-empty payload exists.
pub trait ReplayDataLoader {
    fn has_header(&self) -> bool;
    fn has_chunk(&self, id: ChunkId) -> bool;
    fn has_key_frame(&self, id: KeyFrameId) -> bool;
    fn has_end_of_game_stats(&self) -> bool;
    fn read_header(&self) -> Result<Vec<u8>, StorageError>;
    fn read_chunk(&self, id: ChunkId) -> Result<Vec<u8>, StorageError>;
    fn read_key_frame(&self, id: KeyFrameId) -> Result<Vec<u8>, StorageError>;
    fn read_end_of_game_stats(&self) -> Result<Vec<u8>, StorageError>;
}

/// Write side of replay persistence. Writes replace existing content.
pub trait ReplayDataWriter {
    fn write_header(&self, data: &[u8]) -> Result<(), StorageError>;
    fn write_chunk(&self, id: ChunkId, data: &[u8]) -> Result<(), StorageError>;
    fn write_key_frame(&self, id: KeyFrameId, data: &[u8]) -> Result<(), StorageError>;
    fn write_end_of_game_stats(&self, data: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Chunk,
    KeyFrame,
}

/// Parses `chunk.NNNN.bin` / `keyframe.NNNN.bin` exactly as the formatter names them:
/// zero-padded to four digits, no extra leading zeros beyond that.
fn parse_segment_file(name: &str) -> Option<(SegmentKind, u32)> {
    let (prefix, digits) = name.strip_suffix(".bin")?.split_once('.')?;
    let kind = match prefix {
        CHUNK_PREFIX => SegmentKind::Chunk,
        KEY_FRAME_PREFIX => SegmentKind::KeyFrame,
        _ => return None,
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u32 = digits.parse().ok()?;
    (n > 0 && format!("{n:04}") == digits).then_some((kind, n))
}

fn version_marker() -> String {
    format!("{FORMAT_VERSION}\n")
}

fn is_known_file(name: &str) -> bool {
    matches!(name, VERSION_FILE | HEADER_FILE | END_OF_GAME_FILE) || parse_segment_file(name).is_some()
}

/// Creates `path` if missing and requires it to be a directory the current user can
/// read, write and traverse.
pub fn ensure_user_writable_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(io_error(path))?;
    let meta = fs::metadata(path).map_err(io_error(path))?;
    if !meta.is_dir() {
        return Err(StorageError::NotADirectory(path.to_path_buf()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o700 != 0o700 {
            return Err(StorageError::NotWritable(path.to_path_buf()));
        }
    }
    #[cfg(not(unix))]
    if meta.permissions().readonly() {
        return Err(StorageError::NotWritable(path.to_path_buf()));
    }
    Ok(())
}

fn dir_entries(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Stores one replay as a directory of files.
#[derive(Debug, Clone)]
pub struct ExpandedFormatter {
    dir: PathBuf,
}

impl ExpandedFormatter {
    /// Opens `dir` for reading and writing, creating and initializing it if it does not
    /// exist or is empty. Fails on a version mismatch or on any unexpected file.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        ensure_user_writable_dir(&dir)?;
        let formatter = Self { dir };
        formatter.validate(true)?;
        Ok(formatter)
    }

    /// Opens an already initialized directory without creating anything.
    pub fn open_existing(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        let meta = fs::metadata(&dir).map_err(io_error(&dir))?;
        if !meta.is_dir() {
            return Err(StorageError::NotADirectory(dir));
        }
        let formatter = Self { dir };
        formatter.validate(false)?;
        Ok(formatter)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn validate(&self, initialize: bool) -> Result<(), StorageError> {
        let names = dir_entries(&self.dir)?;
        if names.is_empty() {
            if !initialize {
                return Err(StorageError::NotFound(self.dir.clone()));
            }
            let path = self.dir.join(VERSION_FILE);
            fs::write(&path, version_marker()).map_err(io_error(&path))?;
            tracing::debug!(dir = %self.dir.display(), "initialized replay directory");
            return Ok(());
        }

        let path = self.dir.join(VERSION_FILE);
        let found = fs::read_to_string(&path).map_err(io_error(&path))?;
        if found != version_marker() {
            return Err(StorageError::VersionMismatch {
                found,
                expected: FORMAT_VERSION,
            });
        }
        if let Some(file) = names.into_iter().find(|n| !is_known_file(n)) {
            return Err(StorageError::InvalidFile {
                dir: self.dir.clone(),
                file,
            });
        }
        Ok(())
    }

    fn chunk_path(&self, id: ChunkId) -> PathBuf {
        self.dir.join(format!("{CHUNK_PREFIX}.{:04}.bin", id.get()))
    }

    fn key_frame_path(&self, id: KeyFrameId) -> PathBuf {
        self.dir.join(format!("{KEY_FRAME_PREFIX}.{:04}.bin", id.get()))
    }

    fn has_data(path: &Path) -> bool {
        fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
    }

    fn read(path: &Path) -> Result<Vec<u8>, StorageError> {
        fs::read(path).map_err(io_error(path))
    }

    fn write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        fs::write(path, data).map_err(io_error(path))
    }
}

impl ReplayDataLoader for ExpandedFormatter {
    fn has_header(&self) -> bool {
        Self::has_data(&self.dir.join(HEADER_FILE))
    }

    fn has_chunk(&self, id: ChunkId) -> bool {
        Self::has_data(&self.chunk_path(id))
    }

    fn has_key_frame(&self, id: KeyFrameId) -> bool {
        Self::has_data(&self.key_frame_path(id))
    }

    fn has_end_of_game_stats(&self) -> bool {
        Self::has_data(&self.dir.join(END_OF_GAME_FILE))
    }

    fn read_header(&self) -> Result<Vec<u8>, StorageError> {
        if !self.has_header() {
            return Err(StorageError::NotFound(self.dir.clone()));
        }
        Self::read(&self.dir.join(HEADER_FILE))
    }

    fn read_chunk(&self, id: ChunkId) -> Result<Vec<u8>, StorageError> {
        Self::read(&self.chunk_path(id))
    }

    fn read_key_frame(&self, id: KeyFrameId) -> Result<Vec<u8>, StorageError> {
        Self::read(&self.key_frame_path(id))
    }

    fn read_end_of_game_stats(&self) -> Result<Vec<u8>, StorageError> {
        Self::read(&self.dir.join(END_OF_GAME_FILE))
    }
}

impl ReplayDataWriter for ExpandedFormatter {
    fn write_header(&self, data: &[u8]) -> Result<(), StorageError> {
        Self::write(&self.dir.join(HEADER_FILE), data)
    }

    fn write_chunk(&self, id: ChunkId, data: &[u8]) -> Result<(), StorageError> {
        Self::write(&self.chunk_path(id), data)
    }

    fn write_key_frame(&self, id: KeyFrameId, data: &[u8]) -> Result<(), StorageError> {
        Self::write(&self.key_frame_path(id), data)
    }

    fn write_end_of_game_stats(&self, data: &[u8]) -> Result<(), StorageError> {
        Self::write(&self.dir.join(END_OF_GAME_FILE), data)
    }
}
