//! Wire types of the observer protocol: game metadata and last-chunk-info polling answers.

use serde::{Deserialize, Serialize};

use crate::ids::{optional, ChunkId, KeyFrameId};
use crate::time::{DurationMs, LolTime};

/// One chunk as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub id: ChunkId,
    #[serde(default)]
    pub duration: DurationMs,
    #[serde(default)]
    pub received_time: LolTime,
}

/// One keyframe as announced by the server. `next_chunk_id` is the chunk that
/// immediately follows the keyframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFrameInfo {
    pub id: KeyFrameId,
    #[serde(default)]
    pub received_time: LolTime,
    #[serde(with = "optional", default)]
    pub next_chunk_id: Option<ChunkId>,
}

/// Platform-qualified game identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameKey {
    #[serde(default)]
    pub game_id: u64,
    #[serde(default)]
    pub platform_id: String,
}

/// Header describing one game, as served by `getGameMetaData`.
///
/// The two `pending_*` lists only carry "newly available" segments on the wire; a
/// [`Replay`](crate::Replay) keeps its metadata with both lists empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameMetadata {
    pub game_key: GameKey,
    pub game_server_address: String,
    pub port: u16,
    pub encryption_key: String,
    pub chunk_time_interval: DurationMs,
    pub start_time: LolTime,
    #[serde(with = "optional")]
    pub last_chunk_id: Option<ChunkId>,
    #[serde(with = "optional")]
    pub last_key_frame_id: Option<KeyFrameId>,
    /// End of the pick & ban phase.
    #[serde(with = "optional")]
    pub end_startup_chunk_id: Option<ChunkId>,
    pub delay_time: DurationMs,
    pub pending_available_chunk_info: Vec<ChunkInfo>,
    pub pending_available_key_frame_info: Vec<KeyFrameInfo>,
    #[serde(rename = "keyFrameTimeInterval", alias = "KeyFrameInterval")]
    pub key_frame_time_interval: DurationMs,
    pub decoded_encryption_key: String,
    /// Chunk at game clock 0:00.
    #[serde(with = "optional")]
    pub start_game_chunk_id: Option<ChunkId>,
    pub client_added_lag: DurationMs,
    pub client_back_fetching_enabled: bool,
    pub client_back_fetching_freq: i64,
    pub interest_score: i64,
    pub featured_game: bool,
    pub create_time: LolTime,
    #[serde(with = "optional")]
    pub end_game_chunk_id: Option<ChunkId>,
    #[serde(with = "optional")]
    pub end_game_key_frame_id: Option<KeyFrameId>,
}

/// Answer of `getLastChunkInfo`: what is available right now and when the next chunk
/// will be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LastChunkInfo {
    #[serde(rename = "chunkId", with = "optional")]
    pub id: Option<ChunkId>,
    pub available_since: DurationMs,
    pub next_available_chunk: DurationMs,
    #[serde(rename = "keyFrameId", with = "optional")]
    pub associated_key_frame_id: Option<KeyFrameId>,
    #[serde(with = "optional")]
    pub next_chunk_id: Option<ChunkId>,
    #[serde(with = "optional")]
    pub end_startup_chunk_id: Option<ChunkId>,
    #[serde(with = "optional")]
    pub start_game_chunk_id: Option<ChunkId>,
    #[serde(with = "optional")]
    pub end_game_chunk_id: Option<ChunkId>,
    pub duration: DurationMs,
}

fn fill<T: Copy + Default + PartialEq>(stored: &mut T, incoming: T) {
    if *stored == T::default() && incoming != T::default() {
        *stored = incoming;
    }
}

fn fill_str(stored: &mut String, incoming: &str) {
    if stored.is_empty() && !incoming.is_empty() {
        *stored = incoming.to_string();
    }
}

fn fill_opt<T: Copy>(stored: &mut Option<T>, incoming: Option<T>) {
    if stored.is_none() {
        *stored = incoming;
    }
}

impl GameMetadata {
    /// Field-by-field merge of the scalar fields: an incoming non-zero value is taken only
    /// when the stored one is still zero/empty. `last_chunk_id` and `last_key_frame_id`
    /// are progress counters and keep the highest value seen. Pending lists are not
    /// touched.
    pub fn merge_scalars(&mut self, incoming: &GameMetadata) {
        fill(&mut self.game_key.game_id, incoming.game_key.game_id);
        fill_str(&mut self.game_key.platform_id, &incoming.game_key.platform_id);
        fill_str(&mut self.game_server_address, &incoming.game_server_address);
        fill(&mut self.port, incoming.port);
        fill_str(&mut self.encryption_key, &incoming.encryption_key);
        fill(&mut self.chunk_time_interval, incoming.chunk_time_interval);
        fill(&mut self.start_time, incoming.start_time);
        self.last_chunk_id = self.last_chunk_id.max(incoming.last_chunk_id);
        self.last_key_frame_id = self.last_key_frame_id.max(incoming.last_key_frame_id);
        fill_opt(&mut self.end_startup_chunk_id, incoming.end_startup_chunk_id);
        fill(&mut self.delay_time, incoming.delay_time);
        fill(&mut self.key_frame_time_interval, incoming.key_frame_time_interval);
        fill_str(&mut self.decoded_encryption_key, &incoming.decoded_encryption_key);
        fill_opt(&mut self.start_game_chunk_id, incoming.start_game_chunk_id);
        fill(&mut self.client_added_lag, incoming.client_added_lag);
        fill(
            &mut self.client_back_fetching_enabled,
            incoming.client_back_fetching_enabled,
        );
        fill(
            &mut self.client_back_fetching_freq,
            incoming.client_back_fetching_freq,
        );
        fill(&mut self.interest_score, incoming.interest_score);
        fill(&mut self.featured_game, incoming.featured_game);
        fill(&mut self.create_time, incoming.create_time);
        fill_opt(&mut self.end_game_chunk_id, incoming.end_game_chunk_id);
        fill_opt(&mut self.end_game_key_frame_id, incoming.end_game_key_frame_id);
    }

    /// Boundary markers reported by a last-chunk-info answer, same fill-if-missing rule.
    pub fn merge_boundaries(&mut self, info: &LastChunkInfo) {
        fill_opt(&mut self.end_startup_chunk_id, info.end_startup_chunk_id);
        fill_opt(&mut self.start_game_chunk_id, info.start_game_chunk_id);
        fill_opt(&mut self.end_game_chunk_id, info.end_game_chunk_id);
    }

    pub fn clear_pending(&mut self) {
        self.pending_available_chunk_info.clear();
        self.pending_available_key_frame_info.clear();
    }
}
