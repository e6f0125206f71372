//! Host-driven state of one live download.
//!
//! The host polls the observer API, hands both answers to [`DownloadSession::on_poll`],
//! fetches the segments of the returned [`PollPlan`], reports each outcome, then sleeps
//! for [`PollPlan::wait`]. No I/O happens here.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::ids::{ChunkId, KeyFrameId};
use crate::metadata::{ChunkInfo, GameMetadata, KeyFrameInfo, LastChunkInfo};
use crate::replay::Replay;
use crate::time::{DurationMs, LolTime};

/// Polling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Lower bound of the wait between two polls.
    pub min_poll_interval: DurationMs,
    /// Wait used while the server reports no chunk yet (loading screen).
    pub loading_screen_wait: DurationMs,
    /// Polls a 404'd segment may still fail before the download is aborted.
    pub max_segment_retries: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            min_poll_interval: DurationMs(1_000),
            loading_screen_wait: DurationMs(60_000),
            max_segment_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Chunk(ChunkId),
    KeyFrame(KeyFrameId),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Chunk(id) => write!(f, "chunk {id}"),
            Segment::KeyFrame(id) => write!(f, "keyframe {id}"),
        }
    }
}

/// A segment kept answering 404 after the game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{segment} still unavailable after {attempts} attempts")]
pub struct SegmentLost {
    pub segment: Segment,
    pub attempts: u32,
}

/// What to do for one poll iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPlan {
    /// Chunks to fetch, previously missing ones first.
    pub chunks: Vec<ChunkId>,
    pub key_frames: Vec<KeyFrameId>,
    /// Delay from the poll to the next one.
    pub wait: Duration,
}

#[derive(Debug, Clone)]
pub struct DownloadSession {
    replay: Replay,
    settings: SessionSettings,
    next_chunk: ChunkId,
    next_key_frame: KeyFrameId,
    chunk_retries: BTreeMap<ChunkId, u32>,
    key_frame_retries: BTreeMap<KeyFrameId, u32>,
}

impl DownloadSession {
    pub fn new(version: String, encryption_key: String, settings: SessionSettings) -> Self {
        let mut replay = Replay::new();
        replay.version = version;
        replay.encryption_key = encryption_key;
        Self::resume(replay, settings)
    }

    /// Continues from a previously persisted header. Segments are planned again from the
    /// first one; the host skips those already stored.
    pub fn resume(replay: Replay, settings: SessionSettings) -> Self {
        Self {
            replay,
            settings,
            next_chunk: ChunkId::FIRST,
            next_key_frame: KeyFrameId::FIRST,
            chunk_retries: BTreeMap::new(),
            key_frame_retries: BTreeMap::new(),
        }
    }

    pub fn replay(&self) -> &Replay {
        &self.replay
    }

    pub fn replay_mut(&mut self) -> &mut Replay {
        &mut self.replay
    }

    pub fn into_replay(self) -> Replay {
        self.replay
    }

    /// Time to wait after a poll that returned `ci`.
    pub fn wait_after(&self, ci: &LastChunkInfo) -> Duration {
        let mut next = if ci.id.is_none() {
            self.settings.loading_screen_wait
        } else {
            ci.next_available_chunk
        };
        if next < self.settings.min_poll_interval {
            next = self.settings.min_poll_interval;
        }
        next.to_duration() + ci.duration.divided_by(10).to_duration()
    }

    /// Merges one poll into the replay and returns the segments to fetch.
    pub fn on_poll(&mut self, gm: &GameMetadata, ci: &LastChunkInfo) -> PollPlan {
        let wait = self.wait_after(ci);
        if ci.id.is_none() {
            tracing::info!(?ci, "server has no chunk yet");
        }

        self.replay.merge_from_meta_data(gm);
        self.replay.merge_from_last_chunk_info(ci);
        self.replay.consolidate();

        let mut chunks: Vec<ChunkId> = self.chunk_retries.keys().copied().collect();
        if let Some(last) = ci.id {
            while self.next_chunk <= last {
                chunks.push(self.next_chunk);
                self.next_chunk = self.next_chunk.next();
            }
        }

        // keyframes associated with known chunks are needed too, even when the last
        // chunk info does not name them
        let associated = self.replay.chunks().iter().filter_map(|c| c.key_frame()).max();
        let mut key_frames: Vec<KeyFrameId> = self.key_frame_retries.keys().copied().collect();
        if let Some(last) = ci.associated_key_frame_id.max(associated) {
            while self.next_key_frame <= last {
                key_frames.push(self.next_key_frame);
                self.next_key_frame = self.next_key_frame.next();
            }
        }

        PollPlan {
            chunks,
            key_frames,
            wait,
        }
    }

    /// Records a chunk whose payload is now in storage.
    pub fn on_chunk_stored(&mut self, id: ChunkId) {
        self.chunk_retries.remove(&id);
        if self.replay.chunk(id).is_none() {
            self.replay.add_chunk(ChunkInfo {
                id,
                duration: DurationMs::default(),
                received_time: LolTime::zero(),
            });
        }
    }

    pub fn on_key_frame_stored(&mut self, id: KeyFrameId) {
        self.key_frame_retries.remove(&id);
        if self.replay.key_frame(id).is_none() {
            self.replay.add_key_frame(KeyFrameInfo {
                id,
                received_time: LolTime::zero(),
                next_chunk_id: None,
            });
        }
    }

    /// Records a 404 for a chunk; it is planned again on the next poll.
    pub fn on_chunk_missing(&mut self, id: ChunkId) -> Result<(), SegmentLost> {
        let attempts = self.chunk_retries.entry(id).or_insert(0);
        *attempts += 1;
        if *attempts > self.settings.max_segment_retries {
            return Err(SegmentLost {
                segment: Segment::Chunk(id),
                attempts: *attempts,
            });
        }
        Ok(())
    }

    pub fn on_key_frame_missing(&mut self, id: KeyFrameId) -> Result<(), SegmentLost> {
        let attempts = self.key_frame_retries.entry(id).or_insert(0);
        *attempts += 1;
        if *attempts > self.settings.max_segment_retries {
            return Err(SegmentLost {
                segment: Segment::KeyFrame(id),
                attempts: *attempts,
            });
        }
        Ok(())
    }

    /// Re-runs consolidation once the segments of an iteration are in.
    pub fn end_iteration(&mut self) {
        self.replay.consolidate();
    }

    /// True once the end-of-game chunk has been planned and nothing awaits a retry.
    pub fn is_finished(&self) -> bool {
        let Some(end) = self.replay.meta_data.end_game_chunk_id else {
            return false;
        };
        self.next_chunk > end && self.chunk_retries.is_empty() && self.key_frame_retries.is_empty()
    }

    pub fn pending_retries(&self) -> usize {
        self.chunk_retries.len() + self.key_frame_retries.len()
    }
}
