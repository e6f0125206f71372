//! Shared fixtures for daemon tests.

use std::path::Path;

use spectate_core::{
    ChunkId, ChunkInfo, DurationMs, GameKey, GameMetadata, KeyFrameId, KeyFrameInfo, LolTime,
    Region, Replay, ReplayManager, StoredReplay,
};
use tokio::net::TcpListener;

use crate::server::ReplayServer;

/// Stores a complete 10-chunk replay for EUW1/555 (2 s chunks, a keyframe every two
/// chunks) under `dir` and loads it back. Chunk `n` holds `[n; 4]`, keyframe `k` holds
/// `[0xa0 + k; 4]`.
pub(crate) fn stored_replay(dir: &Path) -> StoredReplay {
    let start = LolTime::parse("Jul 2, 2015 10:47:51 AM").unwrap();
    let mut gm = GameMetadata::default();
    gm.game_key = GameKey {
        game_id: 555,
        platform_id: "EUW1".into(),
    };
    gm.start_game_chunk_id = ChunkId::new(1);
    gm.end_game_chunk_id = ChunkId::new(10);
    gm.pending_available_chunk_info = (1..=10)
        .map(|id| ChunkInfo {
            id: ChunkId::new(id).unwrap(),
            duration: DurationMs(2_000),
            received_time: start.add(DurationMs(2_000 * id)),
        })
        .collect();
    gm.pending_available_key_frame_info = (1..=5)
        .map(|k| KeyFrameInfo {
            id: KeyFrameId::new(k).unwrap(),
            received_time: start.add(DurationMs(4_000 * k)),
            next_chunk_id: ChunkId::new(2 * k - 1),
        })
        .collect();

    let mut replay = Replay::new();
    replay.version = "1.82.89".into();
    replay.encryption_key = "k3y".into();
    replay.merge_from_meta_data(&gm);
    replay.consolidate();
    for id in 1..=10 {
        replay.set_chunk_data(ChunkId::new(id).unwrap(), vec![id as u8; 4]);
    }
    for k in 1..=5 {
        replay.set_key_frame_data(KeyFrameId::new(k).unwrap(), vec![0xa0 + k as u8; 4]);
    }
    replay.set_end_of_game_stats(b"eog".to_vec());

    let manager = ReplayManager::new(dir).unwrap();
    manager.store(&replay).unwrap();
    manager.get(Region::by_code("euw").unwrap(), 555).unwrap()
}

/// A server over [`stored_replay`] and a listener on an ephemeral local port.
pub(crate) async fn bind_replay_server(dir: &Path, time_divisor: i64) -> (ReplayServer, TcpListener) {
    let server = ReplayServer::new(stored_replay(dir), time_divisor).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    (server, listener)
}
