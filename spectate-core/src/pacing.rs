//! Simulated live timeline over a stored replay.
//!
//! [`Pacer`] is immutable: it answers "what would the live server say if chunk N was the
//! latest one" and "when does the next chunk become available". The server's actor owns
//! the current pointer and the timers.

use std::time::{Duration, Instant};

use crate::ids::ChunkId;
use crate::metadata::{GameMetadata, LastChunkInfo};
use crate::replay::Replay;
use crate::time::DurationMs;

pub const DEFAULT_TIME_DIVISOR: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacingError {
    #[error("no chunk at or after {from} has an associated keyframe")]
    NothingToStream { from: ChunkId },
}

#[derive(Debug, Clone)]
pub struct Pacer {
    replay: Replay,
    start_chunk: ChunkId,
    end_chunk: ChunkId,
    time_divisor: i64,
}

impl Pacer {
    /// Streaming starts at the first chunk at or after the game start that already has
    /// an associated keyframe, and stops at the end-of-game chunk (or the last stored one).
    pub fn new(replay: Replay, time_divisor: i64) -> Result<Self, PacingError> {
        let from = replay
            .meta_data
            .start_game_chunk_id
            .unwrap_or(ChunkId::FIRST);
        let start_chunk = replay
            .chunks()
            .iter()
            .find(|c| {
                c.id() >= from && c.key_frame().is_some_and(|kf| replay.key_frame(kf).is_some())
            })
            .map(|c| c.id())
            .ok_or(PacingError::NothingToStream { from })?;
        let last_stored = replay.chunks().last().map_or(start_chunk, |c| c.id());
        let end_chunk = replay
            .meta_data
            .end_game_chunk_id
            .map_or(last_stored, |end| end.min(last_stored))
            .max(start_chunk);
        Ok(Self {
            replay,
            start_chunk,
            end_chunk,
            time_divisor: time_divisor.max(1),
        })
    }

    pub fn replay(&self) -> &Replay {
        &self.replay
    }

    pub fn start_chunk(&self) -> ChunkId {
        self.start_chunk
    }

    pub fn end_chunk(&self) -> ChunkId {
        self.end_chunk
    }

    pub fn time_divisor(&self) -> i64 {
        self.time_divisor
    }

    fn chunk_duration(&self, id: ChunkId) -> DurationMs {
        self.replay
            .chunk(id)
            .map(|c| c.info().duration)
            .unwrap_or_default()
    }

    /// Delay before the first advance, counted from the first client request.
    pub fn bootstrap_delay(&self) -> Duration {
        self.chunk_duration(self.start_chunk)
            .divided_by(10)
            .to_duration()
    }

    /// Time `current` stays the latest chunk.
    pub fn interval(&self, current: ChunkId) -> Duration {
        self.chunk_duration(current)
            .divided_by(self.time_divisor)
            .to_duration()
    }

    /// Stored chunk following `current`, if the end of game is not reached yet.
    pub fn next_chunk(&self, current: ChunkId) -> Option<ChunkId> {
        if current >= self.end_chunk {
            return None;
        }
        self.replay
            .chunks()
            .iter()
            .map(|c| c.id())
            .find(|id| *id > current && *id <= self.end_chunk)
    }

    /// Metadata a client would see with `current` as the latest chunk: everything from the
    /// start chunk up to `current` is listed as pending, with the keyframes they use.
    pub fn metadata_at(&self, current: ChunkId) -> GameMetadata {
        let mut gm = self.replay.meta_data.clone();
        gm.client_back_fetching_enabled = true;
        gm.clear_pending();
        let mut last_key_frame = None;
        for chunk in self
            .replay
            .chunks()
            .iter()
            .filter(|c| c.id() >= self.start_chunk && c.id() <= current)
        {
            gm.pending_available_chunk_info.push(chunk.info().clone());
            let Some(kf) = chunk.key_frame().and_then(|id| self.replay.key_frame(id)) else {
                continue;
            };
            if last_key_frame != Some(kf.id()) {
                last_key_frame = Some(kf.id());
                gm.pending_available_key_frame_info.push(kf.info().clone());
            }
        }
        gm
    }

    fn last_chunk_info(&self, current: ChunkId) -> LastChunkInfo {
        let chunk = self.replay.chunk(current);
        let key_frame = chunk.and_then(|c| c.key_frame());
        let meta = &self.replay.meta_data;
        LastChunkInfo {
            id: Some(current),
            available_since: DurationMs::default(),
            next_available_chunk: DurationMs::default(),
            associated_key_frame_id: key_frame,
            next_chunk_id: key_frame
                .and_then(|id| self.replay.key_frame(id))
                .and_then(|kf| kf.next_chunk_id()),
            end_startup_chunk_id: meta.end_startup_chunk_id,
            start_game_chunk_id: meta.start_game_chunk_id,
            end_game_chunk_id: meta.end_game_chunk_id,
            duration: self.chunk_duration(current),
        }
    }

    /// Answer served before the first advance: nothing elapsed, next chunk one interval
    /// away, regardless of when it is asked.
    pub fn initial_chunk_info(&self) -> ChunkInfoGenerator {
        let mut info = self.last_chunk_info(self.start_chunk);
        info.next_available_chunk = info.duration.divided_by(self.time_divisor);
        ChunkInfoGenerator {
            info,
            timing: None,
        }
    }

    /// Answer generator for `current`, which became the latest chunk at `emitted`.
    pub fn chunk_info_at(&self, current: ChunkId, emitted: Instant) -> ChunkInfoGenerator {
        ChunkInfoGenerator {
            info: self.last_chunk_info(current),
            timing: Some((emitted, emitted + self.interval(current))),
        }
    }
}

/// Produces a [`LastChunkInfo`] whose timing fields are relative to the time of the
/// request rather than to the time the generator was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfoGenerator {
    info: LastChunkInfo,
    /// (emitted, next chunk due)
    timing: Option<(Instant, Instant)>,
}

impl ChunkInfoGenerator {
    pub fn chunk_id(&self) -> Option<ChunkId> {
        self.info.id
    }

    pub fn generate(&self, now: Instant) -> LastChunkInfo {
        let mut info = self.info;
        if let Some((emitted, next_at)) = self.timing {
            info.available_since = DurationMs::from_duration(now.saturating_duration_since(emitted));
            info.next_available_chunk =
                DurationMs::from_duration(next_at.saturating_duration_since(now));
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::KeyFrameId;
    use crate::test_support::{chunk_info, cid, key_frame_info, kfid, sample_replay_with};

    fn pacer(chunks: i64) -> Pacer {
        Pacer::new(sample_replay_with(chunks, 2_000), DEFAULT_TIME_DIVISOR).unwrap()
    }

    #[test]
    fn timings_follow_divisor() {
        let p = pacer(10);
        assert_eq!(p.start_chunk(), cid(1));
        assert_eq!(p.end_chunk(), cid(10));
        assert_eq!(p.bootstrap_delay(), Duration::from_millis(200));
        assert_eq!(p.interval(cid(3)), Duration::from_millis(500));
    }

    #[test]
    fn walks_every_chunk_then_stops() {
        let p = pacer(10);
        let mut current = p.start_chunk();
        let mut seen = vec![current];
        while let Some(next) = p.next_chunk(current) {
            current = next;
            seen.push(current);
        }
        assert_eq!(seen, (1..=10).map(cid).collect::<Vec<_>>());
    }

    #[test]
    fn start_skips_unassociated_chunks() {
        // pick & ban: the first keyframe designates chunk 3
        let mut replay = Replay::new();
        for id in 1..=5 {
            replay.add_chunk(chunk_info(id));
        }
        replay.add_key_frame(key_frame_info(1, 3));
        replay.consolidate();
        replay.meta_data.start_game_chunk_id = ChunkId::new(1);
        let p = Pacer::new(replay, 4).unwrap();
        assert_eq!(p.start_chunk(), cid(3));
        assert_eq!(p.end_chunk(), cid(5));

        let mut bare = Replay::new();
        bare.add_chunk(chunk_info(1));
        assert_eq!(
            Pacer::new(bare, 4).unwrap_err(),
            PacingError::NothingToStream { from: cid(1) }
        );
    }

    #[test]
    fn metadata_lists_streamed_prefix() {
        let p = pacer(10);
        let gm = p.metadata_at(cid(4));
        assert!(gm.client_back_fetching_enabled);
        let ids: Vec<_> = gm.pending_available_chunk_info.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![cid(1), cid(2), cid(3), cid(4)]);
        let kfs: Vec<_> = gm
            .pending_available_key_frame_info
            .iter()
            .map(|k| k.id)
            .collect();
        assert_eq!(kfs, vec![kfid(1), kfid(2)]);
    }

    #[test]
    fn generator_is_relative_to_request_time() {
        let p = pacer(10);
        let emitted = Instant::now();
        let gen = p.chunk_info_at(cid(3), emitted);

        let at_emit = gen.generate(emitted);
        assert_eq!(at_emit.id, ChunkId::new(3));
        assert_eq!(at_emit.associated_key_frame_id, KeyFrameId::new(2));
        assert_eq!(at_emit.next_chunk_id, ChunkId::new(3));
        assert_eq!(at_emit.available_since, DurationMs(0));
        assert_eq!(at_emit.next_available_chunk, DurationMs(500));

        let later = gen.generate(emitted + Duration::from_millis(300));
        assert_eq!(later.available_since, DurationMs(300));
        assert_eq!(later.next_available_chunk, DurationMs(200));

        let late = gen.generate(emitted + Duration::from_secs(2));
        assert_eq!(late.next_available_chunk, DurationMs(0));
    }

    #[test]
    fn initial_info_is_frozen() {
        let p = pacer(10);
        let gen = p.initial_chunk_info();
        let info = gen.generate(Instant::now() + Duration::from_secs(30));
        assert_eq!(info.id, ChunkId::new(1));
        assert_eq!(info.available_since, DurationMs(0));
        assert_eq!(info.next_available_chunk, DurationMs(500));
        assert_eq!(info.end_game_chunk_id, ChunkId::new(10));
    }
}
