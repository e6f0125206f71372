//! In-memory replay: ordered chunks and keyframes, their associations, and the merge /
//! consolidation logic that rebuilds them from incremental server answers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{optional, ChunkId, KeyFrameId};
use crate::metadata::{ChunkInfo, GameMetadata, KeyFrameInfo, LastChunkInfo};
use crate::storage::{ReplayDataLoader, ReplayDataWriter, StorageError};
use crate::time::LolTime;

/// A segment of incremental game state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(flatten)]
    info: ChunkInfo,
    #[serde(with = "optional", default)]
    key_frame: Option<KeyFrameId>,
    /// Association derived by [`Replay::consolidate`] rather than stated by the server.
    #[serde(default, skip_serializing_if = "is_false")]
    inferred: bool,
    #[serde(skip)]
    data: Vec<u8>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        self.info.id
    }

    pub fn info(&self) -> &ChunkInfo {
        &self.info
    }

    /// Keyframe this chunk plays on top of, if known yet.
    pub fn key_frame(&self) -> Option<KeyFrameId> {
        self.key_frame
    }

    /// Opaque payload; empty until loaded.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A full-state snapshot, plus the chunks that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFrame {
    #[serde(flatten)]
    info: KeyFrameInfo,
    #[serde(default)]
    chunks: Vec<ChunkId>,
    #[serde(skip)]
    data: Vec<u8>,
}

impl KeyFrame {
    pub fn id(&self) -> KeyFrameId {
        self.info.id
    }

    pub fn info(&self) -> &KeyFrameInfo {
        &self.info
    }

    pub fn next_chunk_id(&self) -> Option<ChunkId> {
        self.info.next_chunk_id
    }

    /// Chunks associated with this keyframe, ascending and unique.
    pub fn chunks(&self) -> &[ChunkId] {
        &self.chunks
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// First violated completeness invariant of a replay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("chunk {chunk} has no associated keyframe but follows associated chunks")]
    MissingAssociation { chunk: ChunkId },
    #[error("chunk {chunk} references unknown keyframe {key_frame}")]
    UnknownKeyFrame {
        chunk: ChunkId,
        key_frame: KeyFrameId,
    },
    #[error("data for chunk {0} is not loaded and no loader is defined")]
    ChunkNotLoaded(ChunkId),
    #[error("missing data for chunk {0}")]
    MissingChunkData(ChunkId),
    #[error("data for keyframe {0} is not loaded and no loader is defined")]
    KeyFrameNotLoaded(KeyFrameId),
    #[error("missing data for keyframe {0}")]
    MissingKeyFrameData(KeyFrameId),
    #[error("end of game stats are not loaded and no loader is defined")]
    EndOfGameStatsNotLoaded,
    #[error("missing end of game stats")]
    MissingEndOfGameStats,
}

/// Everything needed to spectate one game again.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    chunks: Vec<Chunk>,
    key_frames: Vec<KeyFrame>,
    chunk_index: HashMap<ChunkId, usize>,
    key_frame_index: HashMap<KeyFrameId, usize>,
    end_of_game_stats: Vec<u8>,
    /// Game header; pending lists are always empty here.
    pub meta_data: GameMetadata,
    /// Observer protocol version reported by the server the replay was taken from.
    pub version: String,
    /// Key the chunk/keyframe payloads are encrypted with.
    pub encryption_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeaderRef<'a> {
    version: &'a str,
    encryption_key: &'a str,
    meta_data: &'a GameMetadata,
    chunks: &'a [Chunk],
    key_frames: &'a [KeyFrame],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    #[serde(default)]
    version: String,
    #[serde(default)]
    encryption_key: String,
    meta_data: GameMetadata,
    #[serde(default)]
    chunks: Vec<Chunk>,
    #[serde(default)]
    key_frames: Vec<KeyFrame>,
}

fn insert_sorted_unique(ids: &mut Vec<ChunkId>, id: ChunkId) {
    if let Err(pos) = ids.binary_search(&id) {
        ids.insert(pos, id);
    }
}

impl Replay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn key_frames(&self) -> &[KeyFrame] {
        &self.key_frames
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunk_index.get(&id).map(|&i| &self.chunks[i])
    }

    pub fn key_frame(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.key_frame_index.get(&id).map(|&i| &self.key_frames[i])
    }

    pub fn end_of_game_stats(&self) -> &[u8] {
        &self.end_of_game_stats
    }

    /// Adds a chunk unless its ID is already known. A keyframe that designates the chunk
    /// (through its next chunk ID) becomes its association.
    pub fn add_chunk(&mut self, info: ChunkInfo) -> bool {
        let id = info.id;
        let pos = match self.chunks.binary_search_by_key(&id, Chunk::id) {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        self.chunks.insert(
            pos,
            Chunk {
                info,
                key_frame: None,
                inferred: false,
                data: Vec::new(),
            },
        );
        for (i, c) in self.chunks.iter().enumerate().skip(pos) {
            self.chunk_index.insert(c.id(), i);
        }
        if let Some(kf) = self.designating_key_frame(id) {
            self.associate(id, kf, false);
        }
        true
    }

    /// Adds a keyframe unless its ID is already known, and associates the chunk it
    /// designates when that chunk is present.
    pub fn add_key_frame(&mut self, info: KeyFrameInfo) -> bool {
        let id = info.id;
        let next = info.next_chunk_id;
        let pos = match self.key_frames.binary_search_by_key(&id, KeyFrame::id) {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        self.key_frames.insert(
            pos,
            KeyFrame {
                info,
                chunks: Vec::new(),
                data: Vec::new(),
            },
        );
        for (i, kf) in self.key_frames.iter().enumerate().skip(pos) {
            self.key_frame_index.insert(kf.id(), i);
        }
        if let Some(next) = next.filter(|n| self.chunk_index.contains_key(n)) {
            self.associate(next, id, false);
        }
        true
    }

    fn designating_key_frame(&self, chunk: ChunkId) -> Option<KeyFrameId> {
        self.key_frames
            .iter()
            .rev()
            .find(|kf| kf.info.next_chunk_id == Some(chunk))
            .map(KeyFrame::id)
    }

    /// Sets (or clears) the association of `chunk` and keeps the keyframes' chunk lists in
    /// sync.
    fn set_association(&mut self, chunk: ChunkId, key_frame: Option<KeyFrameId>, inferred: bool) {
        let Some(&ci) = self.chunk_index.get(&chunk) else {
            return;
        };
        let previous = std::mem::replace(&mut self.chunks[ci].key_frame, key_frame);
        self.chunks[ci].inferred = inferred && key_frame.is_some();
        if let Some(prev) = previous.filter(|p| Some(*p) != key_frame) {
            if let Some(&ki) = self.key_frame_index.get(&prev) {
                self.key_frames[ki].chunks.retain(|c| *c != chunk);
            }
        }
        if let Some(&ki) = key_frame.and_then(|kf| self.key_frame_index.get(&kf)) {
            insert_sorted_unique(&mut self.key_frames[ki].chunks, chunk);
        }
    }

    fn associate(&mut self, chunk: ChunkId, key_frame: KeyFrameId, inferred: bool) {
        self.set_association(chunk, Some(key_frame), inferred);
    }

    /// Union with a `getGameMetaData` answer. Idempotent and independent of the order in
    /// which segments are announced.
    pub fn merge_from_meta_data(&mut self, gm: &GameMetadata) {
        self.meta_data.merge_scalars(gm);
        self.meta_data.clear_pending();

        for info in &gm.pending_available_chunk_info {
            if let Some(&i) = self.chunk_index.get(&info.id) {
                let known = &mut self.chunks[i].info;
                if known.received_time.is_zero() {
                    known.received_time = info.received_time;
                }
                if known.duration.is_zero() {
                    known.duration = info.duration;
                }
                continue;
            }
            self.add_chunk(info.clone());
        }

        for info in &gm.pending_available_key_frame_info {
            if let Some(&i) = self.key_frame_index.get(&info.id) {
                let known = &mut self.key_frames[i].info;
                if known.received_time.is_zero() {
                    known.received_time = info.received_time;
                }
                if known.next_chunk_id.is_none() {
                    known.next_chunk_id = info.next_chunk_id;
                    if let Some(next) = info.next_chunk_id {
                        self.associate(next, info.id, false);
                    }
                }
                continue;
            }
            self.add_key_frame(info.clone());
        }
    }

    /// Merge of a `getLastChunkInfo` answer. A chunk ID of 0 means the server has nothing
    /// yet and the answer is ignored.
    pub fn merge_from_last_chunk_info(&mut self, ci: &LastChunkInfo) {
        let Some(id) = ci.id else {
            return;
        };
        self.meta_data.merge_boundaries(ci);

        if !self.chunk_index.contains_key(&id) {
            // no timestamp for this chunk on the wire: chain from the previous one
            let received_time = id
                .prev()
                .and_then(|prev| self.chunk(prev))
                .filter(|prev| !prev.info.received_time.is_zero())
                .map(|prev| prev.info.received_time.add(prev.info.duration))
                .unwrap_or_default();
            self.add_chunk(ChunkInfo {
                id,
                duration: ci.duration,
                received_time,
            });
        }

        let Some(kf) = ci.associated_key_frame_id else {
            return;
        };
        if !self.key_frame_index.contains_key(&kf) {
            let received_time = ci
                .next_chunk_id
                .and_then(|next| self.chunk(next))
                .map(|c| c.info.received_time)
                .unwrap_or_else(LolTime::zero);
            self.add_key_frame(KeyFrameInfo {
                id: kf,
                received_time,
                next_chunk_id: ci.next_chunk_id,
            });
        }
        if self.chunk(id).is_some_and(|c| c.key_frame.is_none() || c.inferred) {
            self.associate(id, kf, false);
        }
    }

    /// Infers chunk/keyframe associations from ordering: a chunk without a server-stated
    /// association gets the last keyframe whose next chunk does not come after it. Chunks
    /// before the first keyframe's next chunk stay unassociated. Inferred associations are
    /// recomputed on every pass, so the result does not depend on arrival order.
    pub fn consolidate(&mut self) {
        let repairs: Vec<_> = self
            .chunks
            .iter()
            .filter(|c| c.key_frame.is_none() || c.inferred)
            .filter_map(|c| {
                let candidate = self.preceding_key_frame(c.id());
                (candidate != c.key_frame).then_some((c.id(), candidate))
            })
            .collect();
        for (chunk, kf) in repairs {
            self.set_association(chunk, kf, true);
        }
    }

    fn preceding_key_frame(&self, chunk: ChunkId) -> Option<KeyFrameId> {
        let mut candidate = None;
        for kf in &self.key_frames {
            let Some(next) = kf.info.next_chunk_id else {
                continue;
            };
            if next > chunk {
                break;
            }
            candidate = Some(kf.id());
        }
        candidate
    }

    /// Verifies the replay is complete, with all payloads either resident or available
    /// through `loader`. `None` requires everything to be in memory. Never repairs.
    pub fn check(&self, loader: Option<&dyn ReplayDataLoader>) -> Result<(), IntegrityError> {
        let mut associated_seen = false;
        for chunk in &self.chunks {
            let id = chunk.id();
            match chunk.key_frame {
                Some(_) => associated_seen = true,
                None if associated_seen => return Err(IntegrityError::MissingAssociation { chunk: id }),
                None => {}
            }

            if chunk.data.is_empty() {
                match loader {
                    None => return Err(IntegrityError::ChunkNotLoaded(id)),
                    Some(l) if !l.has_chunk(id) => return Err(IntegrityError::MissingChunkData(id)),
                    Some(_) => {}
                }
            }

            let Some(kf_id) = chunk.key_frame else {
                continue;
            };
            let kf = self
                .key_frame(kf_id)
                .ok_or(IntegrityError::UnknownKeyFrame {
                    chunk: id,
                    key_frame: kf_id,
                })?;
            if kf.data.is_empty() {
                match loader {
                    None => return Err(IntegrityError::KeyFrameNotLoaded(kf_id)),
                    Some(l) if !l.has_key_frame(kf_id) => {
                        return Err(IntegrityError::MissingKeyFrameData(kf_id))
                    }
                    Some(_) => {}
                }
            }
        }

        if !self.end_of_game_stats.is_empty() {
            return Ok(());
        }
        match loader {
            None => Err(IntegrityError::EndOfGameStatsNotLoaded),
            Some(l) if !l.has_end_of_game_stats() => Err(IntegrityError::MissingEndOfGameStats),
            Some(_) => Ok(()),
        }
    }

    /// Stores a chunk payload. Loaded data is immutable: returns false if the chunk is
    /// unknown or already has data.
    pub fn set_chunk_data(&mut self, id: ChunkId, data: Vec<u8>) -> bool {
        match self.chunk_index.get(&id) {
            Some(&i) if self.chunks[i].data.is_empty() => {
                self.chunks[i].data = data;
                true
            }
            _ => false,
        }
    }

    pub fn set_key_frame_data(&mut self, id: KeyFrameId, data: Vec<u8>) -> bool {
        match self.key_frame_index.get(&id) {
            Some(&i) if self.key_frames[i].data.is_empty() => {
                self.key_frames[i].data = data;
                true
            }
            _ => false,
        }
    }

    pub fn set_end_of_game_stats(&mut self, data: Vec<u8>) {
        self.end_of_game_stats = data;
    }

    /// Loads every payload through `loader`, after checking it can provide them.
    pub fn load_data(&mut self, loader: &dyn ReplayDataLoader) -> Result<(), StorageError> {
        self.check(Some(loader))?;
        for i in 0..self.chunks.len() {
            if self.chunks[i].data.is_empty() {
                self.chunks[i].data = loader.read_chunk(self.chunks[i].id())?;
            }
            let Some(kf_id) = self.chunks[i].key_frame else {
                continue;
            };
            let Some(&ki) = self.key_frame_index.get(&kf_id) else {
                continue;
            };
            if self.key_frames[ki].data.is_empty() {
                self.key_frames[ki].data = loader.read_key_frame(kf_id)?;
            }
        }
        if self.end_of_game_stats.is_empty() {
            self.end_of_game_stats = loader.read_end_of_game_stats()?;
        }
        Ok(())
    }

    /// Writes every resident payload; all of them must be loaded.
    pub fn save_data(&self, writer: &dyn ReplayDataWriter) -> Result<(), StorageError> {
        self.check(None)?;
        for chunk in &self.chunks {
            writer.write_chunk(chunk.id(), &chunk.data)?;
        }
        for kf in self.key_frames.iter().filter(|kf| !kf.data.is_empty()) {
            writer.write_key_frame(kf.id(), &kf.data)?;
        }
        writer.write_end_of_game_stats(&self.end_of_game_stats)
    }

    /// Serializes the header (everything but payloads) as pretty JSON.
    pub fn header_json(&self) -> Result<Vec<u8>, StorageError> {
        let header = HeaderRef {
            version: &self.version,
            encryption_key: &self.encryption_key,
            meta_data: &self.meta_data,
            chunks: &self.chunks,
            key_frames: &self.key_frames,
        };
        Ok(serde_json::to_vec_pretty(&header)?)
    }

    /// Rebuilds a replay (without payloads) from [`header_json`](Self::header_json) output.
    pub fn from_header_json(bytes: &[u8]) -> Result<Self, StorageError> {
        let header: Header = serde_json::from_slice(bytes)?;
        let mut replay = Replay {
            version: header.version,
            encryption_key: header.encryption_key,
            meta_data: header.meta_data,
            ..Default::default()
        };
        replay.meta_data.clear_pending();
        replay.chunks = header.chunks;
        replay.key_frames = header.key_frames;
        replay.chunks.sort_by_key(Chunk::id);
        replay.chunks.dedup_by_key(|c| c.id());
        replay.key_frames.sort_by_key(KeyFrame::id);
        replay.key_frames.dedup_by_key(|kf| kf.id());
        replay.chunk_index = replay
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id(), i))
            .collect();
        replay.key_frame_index = replay
            .key_frames
            .iter()
            .enumerate()
            .map(|(i, kf)| (kf.id(), i))
            .collect();
        Ok(replay)
    }

    /// Writes the header without any completeness check, for in-progress downloads.
    pub fn write_header(&self, writer: &dyn ReplayDataWriter) -> Result<(), StorageError> {
        writer.write_header(&self.header_json()?)
    }

    /// Writes the header of a complete, fully resident replay.
    pub fn save(&self, writer: &dyn ReplayDataWriter) -> Result<(), StorageError> {
        self.check(None)?;
        self.write_header(writer)
    }

    pub fn save_with_data(&self, writer: &dyn ReplayDataWriter) -> Result<(), StorageError> {
        self.save(writer)?;
        self.save_data(writer)
    }

    /// Reads a header without checking completeness (used to resume a download).
    pub fn load_header(loader: &dyn ReplayDataLoader) -> Result<Self, StorageError> {
        Self::from_header_json(&loader.read_header()?)
    }

    /// Reads a header and checks that every payload is available through `loader`.
    pub fn load(loader: &dyn ReplayDataLoader) -> Result<Self, StorageError> {
        let replay = Self::load_header(loader)?;
        replay.check(Some(loader))?;
        Ok(replay)
    }

    pub fn load_with_data(loader: &dyn ReplayDataLoader) -> Result<Self, StorageError> {
        let mut replay = Self::load(loader)?;
        replay.load_data(loader)?;
        Ok(replay)
    }
}
