//! Shared fixtures for unit tests.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::ids::{ChunkId, KeyFrameId};
use crate::metadata::{ChunkInfo, GameMetadata, KeyFrameInfo};
use crate::replay::Replay;
use crate::storage::{ReplayDataLoader, ReplayDataWriter, StorageError};
use crate::time::{DurationMs, LolTime};

pub fn cid(raw: i64) -> ChunkId {
    ChunkId::new(raw).unwrap()
}

pub fn kfid(raw: i64) -> KeyFrameId {
    KeyFrameId::new(raw).unwrap()
}

pub fn start_time() -> LolTime {
    LolTime::parse("Jul 2, 2015 10:47:51 AM").unwrap()
}

pub fn chunk_info(id: i64) -> ChunkInfo {
    ChunkInfo {
        id: cid(id),
        duration: DurationMs(30_000),
        received_time: start_time().add(DurationMs(30_000 * id)),
    }
}

pub fn key_frame_info(id: i64, next_chunk: i64) -> KeyFrameInfo {
    KeyFrameInfo {
        id: kfid(id),
        received_time: start_time().add(DurationMs(30_000 * next_chunk)),
        next_chunk_id: ChunkId::new(next_chunk),
    }
}

/// Metadata for game EUW1/555 with `chunks` chunks of `chunk_ms`, one keyframe every
/// two chunks (keyframe k designates chunk 2k-1), game starting at chunk 1.
pub fn sample_metadata(chunks: i64, chunk_ms: i64) -> GameMetadata {
    let mut gm = GameMetadata::default();
    gm.game_key.platform_id = "EUW1".into();
    gm.game_key.game_id = 555;
    gm.chunk_time_interval = DurationMs(chunk_ms);
    gm.start_time = start_time();
    gm.create_time = start_time();
    gm.start_game_chunk_id = ChunkId::new(1);
    gm.end_startup_chunk_id = None;
    gm.end_game_chunk_id = ChunkId::new(chunks);
    gm.last_chunk_id = ChunkId::new(chunks);
    let key_frames = (chunks + 1) / 2;
    gm.last_key_frame_id = KeyFrameId::new(key_frames);
    gm.end_game_key_frame_id = KeyFrameId::new(key_frames);
    gm.pending_available_chunk_info = (1..=chunks)
        .map(|id| ChunkInfo {
            duration: DurationMs(chunk_ms),
            ..chunk_info(id)
        })
        .collect();
    gm.pending_available_key_frame_info = (1..=key_frames)
        .map(|k| key_frame_info(k, 2 * k - 1))
        .collect();
    gm
}

/// A complete replay with every payload resident. Chunk n carries `[n; 16]`, keyframe k
/// carries `[100 + k; 32]`.
pub fn sample_replay_with(chunks: i64, chunk_ms: i64) -> Replay {
    let mut replay = Replay::new();
    replay.version = "1.82.89".into();
    replay.encryption_key = "k3y".into();
    replay.merge_from_meta_data(&sample_metadata(chunks, chunk_ms));
    replay.consolidate();
    for id in 1..=chunks {
        replay.set_chunk_data(cid(id), vec![id as u8; 16]);
    }
    for k in 1..=(chunks + 1) / 2 {
        replay.set_key_frame_data(kfid(k), vec![100 + k as u8; 32]);
    }
    replay.set_end_of_game_stats(b"eog".to_vec());
    replay
}

pub fn sample_replay(chunks: i64) -> Replay {
    sample_replay_with(chunks, 30_000)
}

/// In-memory loader/writer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    header: RefCell<Vec<u8>>,
    chunks: RefCell<HashMap<ChunkId, Vec<u8>>>,
    key_frames: RefCell<HashMap<KeyFrameId, Vec<u8>>>,
    end_of_game: RefCell<Vec<u8>>,
}

fn missing() -> StorageError {
    StorageError::NotFound("memory".into())
}

impl ReplayDataLoader for MemoryStore {
    fn has_header(&self) -> bool {
        !self.header.borrow().is_empty()
    }

    fn has_chunk(&self, id: ChunkId) -> bool {
        self.chunks.borrow().get(&id).is_some_and(|d| !d.is_empty())
    }

    fn has_key_frame(&self, id: KeyFrameId) -> bool {
        self.key_frames.borrow().get(&id).is_some_and(|d| !d.is_empty())
    }

    fn has_end_of_game_stats(&self) -> bool {
        !self.end_of_game.borrow().is_empty()
    }

    fn read_header(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.header.borrow().clone())
    }

    fn read_chunk(&self, id: ChunkId) -> Result<Vec<u8>, StorageError> {
        self.chunks.borrow().get(&id).cloned().ok_or_else(missing)
    }

    fn read_key_frame(&self, id: KeyFrameId) -> Result<Vec<u8>, StorageError> {
        self.key_frames.borrow().get(&id).cloned().ok_or_else(missing)
    }

    fn read_end_of_game_stats(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.end_of_game.borrow().clone())
    }
}

impl ReplayDataWriter for MemoryStore {
    fn write_header(&self, data: &[u8]) -> Result<(), StorageError> {
        *self.header.borrow_mut() = data.to_vec();
        Ok(())
    }

    fn write_chunk(&self, id: ChunkId, data: &[u8]) -> Result<(), StorageError> {
        self.chunks.borrow_mut().insert(id, data.to_vec());
        Ok(())
    }

    fn write_key_frame(&self, id: KeyFrameId, data: &[u8]) -> Result<(), StorageError> {
        self.key_frames.borrow_mut().insert(id, data.to_vec());
        Ok(())
    }

    fn write_end_of_game_stats(&self, data: &[u8]) -> Result<(), StorageError> {
        *self.end_of_game.borrow_mut() = data.to_vec();
        Ok(())
    }
}
