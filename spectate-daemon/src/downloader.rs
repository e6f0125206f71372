//! Live download loop: poll, merge, fetch new segments, persist, sleep.

use spectate_core::{
    ChunkId, DownloadSession, ExpandedFormatter, IntegrityError, KeyFrameId, Replay,
    ReplayDataLoader, ReplayDataWriter, SegmentLost, StorageError,
};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::SpectateSource;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("{url}: HTTP {status}")]
    Http { status: u16, url: String },
    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url}: invalid JSON: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("downloaded replay is incomplete: {0}")]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    SegmentLost(#[from] SegmentLost),
    #[error("region {0} has no spectator endpoint")]
    Region(String),
    #[error("storage task failed: {0}")]
    StorageTask(#[from] tokio::task::JoinError),
    #[error("download cancelled")]
    Cancelled,
}

/// Runs a filesystem operation on the blocking pool.
async fn with_storage<T, F>(storage: &ExpandedFormatter, op: F) -> Result<T, DownloadError>
where
    T: Send + 'static,
    F: FnOnce(&ExpandedFormatter) -> Result<T, DownloadError> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || op(&storage)).await?
}

/// Drives one [`DownloadSession`] against a [`SpectateSource`], persisting everything
/// into `storage` as it arrives.
pub struct LiveDownloader<S> {
    source: S,
    storage: ExpandedFormatter,
    session: DownloadSession,
    cancel: CancellationToken,
}

impl<S: SpectateSource> LiveDownloader<S> {
    pub fn new(
        source: S,
        storage: ExpandedFormatter,
        session: DownloadSession,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            storage,
            session,
            cancel,
        }
    }

    /// Runs until the game ended and every segment is stored, then fetches the end of
    /// game stats and checks the result. Cancellation is honoured between iterations only.
    pub async fn run(mut self) -> Result<Replay, DownloadError> {
        if self.session.replay().version.is_empty() {
            let version = self.source.version().await?;
            info!(%version, "observer version");
            self.session.replay_mut().version = version;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let gm = self.source.game_metadata().await?;
            let ci = self.source.last_chunk_info().await?;
            let deadline = Instant::now() + self.session.wait_after(&ci);
            let plan = self.session.on_poll(&gm, &ci);
            info!(
                last_chunk = ?ci.id,
                key_frame = ?ci.associated_key_frame_id,
                end_game = ?self.session.replay().meta_data.end_game_chunk_id,
                wait_ms = plan.wait.as_millis() as u64,
                "polled"
            );
            self.save_header().await?;

            for id in plan.chunks {
                self.fetch_chunk(id).await?;
            }
            for id in plan.key_frames {
                self.fetch_key_frame(id).await?;
            }
            self.session.end_iteration();
            self.save_header().await?;

            if self.session.is_finished() {
                info!("end of game reached");
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = sleep_until(deadline) => {}
            }
        }

        let stats = self.source.end_of_game_stats().await?;
        with_storage(&self.storage, move |s| Ok(s.write_end_of_game_stats(&stats)?))
            .await?;
        let replay = self.session.into_replay();
        let replay = with_storage(&self.storage, move |s| {
            replay.check(Some(s))?;
            replay.write_header(s)?;
            Ok(replay)
        })
        .await?;
        info!(
            chunks = replay.chunks().len(),
            key_frames = replay.key_frames().len(),
            dir = %self.storage.dir().display(),
            "replay complete"
        );
        Ok(replay)
    }

    async fn save_header(&self) -> Result<(), DownloadError> {
        let header = self.session.replay().header_json()?;
        with_storage(&self.storage, move |s| Ok(s.write_header(&header)?)).await
    }

    async fn fetch_chunk(&mut self, id: ChunkId) -> Result<(), DownloadError> {
        if with_storage(&self.storage, move |s| Ok(s.has_chunk(id))).await? {
            debug!(chunk = %id, "chunk already stored");
            self.session.on_chunk_stored(id);
            return Ok(());
        }
        match self.source.chunk(id).await? {
            Some(data) if !data.is_empty() => {
                let bytes = data.len();
                with_storage(&self.storage, move |s| Ok(s.write_chunk(id, &data)?))
                    .await?;
                self.session.on_chunk_stored(id);
                info!(chunk = %id, bytes, "downloaded chunk");
            }
            _ => {
                info!(chunk = %id, "skips chunk, server returned 404");
                self.session.on_chunk_missing(id)?;
            }
        }
        Ok(())
    }

    async fn fetch_key_frame(&mut self, id: KeyFrameId) -> Result<(), DownloadError> {
        if with_storage(&self.storage, move |s| Ok(s.has_key_frame(id))).await? {
            debug!(key_frame = %id, "keyframe already stored");
            self.session.on_key_frame_stored(id);
            return Ok(());
        }
        match self.source.key_frame(id).await? {
            Some(data) if !data.is_empty() => {
                let bytes = data.len();
                with_storage(&self.storage, move |s| Ok(s.write_key_frame(id, &data)?))
                    .await?;
                self.session.on_key_frame_stored(id);
                info!(key_frame = %id, bytes, "downloaded keyframe");
            }
            _ => {
                info!(key_frame = %id, "skips keyframe, server returned 404");
                self.session.on_key_frame_missing(id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use spectate_core::{DurationMs, GameMetadata, LastChunkInfo, SessionSettings};

    /// Observer API answering from a script. The last scripted chunk info repeats.
    #[derive(Default)]
    struct ScriptedSource {
        infos: Mutex<VecDeque<LastChunkInfo>>,
        chunks: Mutex<HashMap<ChunkId, Vec<u8>>>,
        key_frames: Mutex<HashMap<KeyFrameId, Vec<u8>>>,
        /// Number of 404 answers before a chunk is served.
        chunk_delays: Mutex<HashMap<ChunkId, u32>>,
        /// Chunks answered with this HTTP status instead of data.
        chunk_errors: Mutex<HashMap<ChunkId, u16>>,
        chunk_requests: AtomicUsize,
        polls: AtomicUsize,
    }

    impl ScriptedSource {
        fn with_segments(chunks: i64, key_frames: i64) -> Self {
            let s = Self::default();
            for id in 1..=chunks {
                s.chunks
                    .lock()
                    .unwrap()
                    .insert(ChunkId::new(id).unwrap(), vec![id as u8; 8]);
            }
            for id in 1..=key_frames {
                s.key_frames
                    .lock()
                    .unwrap()
                    .insert(KeyFrameId::new(id).unwrap(), vec![0xa0 + id as u8; 8]);
            }
            s
        }

        fn script(self, infos: Vec<LastChunkInfo>) -> Self {
            *self.infos.lock().unwrap() = infos.into();
            self
        }
    }

    #[async_trait]
    impl SpectateSource for Arc<ScriptedSource> {
        async fn version(&self) -> Result<String, DownloadError> {
            Ok("1.82.89".into())
        }

        async fn game_metadata(&self) -> Result<GameMetadata, DownloadError> {
            let mut gm = GameMetadata::default();
            gm.game_key.platform_id = "EUW1".into();
            gm.game_key.game_id = 555;
            gm.chunk_time_interval = DurationMs(30_000);
            Ok(gm)
        }

        async fn last_chunk_info(&self) -> Result<LastChunkInfo, DownloadError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut infos = self.infos.lock().unwrap();
            if infos.len() > 1 {
                Ok(infos.pop_front().unwrap_or_default())
            } else {
                Ok(infos.front().copied().unwrap_or_default())
            }
        }

        async fn chunk(&self, id: ChunkId) -> Result<Option<Vec<u8>>, DownloadError> {
            self.chunk_requests.fetch_add(1, Ordering::SeqCst);
            if let Some(&status) = self.chunk_errors.lock().unwrap().get(&id) {
                return Err(DownloadError::Http {
                    status,
                    url: format!("/getGameDataChunk/EUW1/555/{id}/token"),
                });
            }
            if let Some(left) = self.chunk_delays.lock().unwrap().get_mut(&id) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(None);
                }
            }
            Ok(self.chunks.lock().unwrap().get(&id).cloned())
        }

        async fn key_frame(&self, id: KeyFrameId) -> Result<Option<Vec<u8>>, DownloadError> {
            Ok(self.key_frames.lock().unwrap().get(&id).cloned())
        }

        async fn end_of_game_stats(&self) -> Result<Vec<u8>, DownloadError> {
            Ok(b"{\"stats\":true}".to_vec())
        }
    }

    fn info(id: i64, kf: i64, next: i64, end: i64) -> LastChunkInfo {
        LastChunkInfo {
            id: ChunkId::new(id),
            associated_key_frame_id: KeyFrameId::new(kf),
            next_chunk_id: ChunkId::new(next),
            end_game_chunk_id: ChunkId::new(end),
            next_available_chunk: DurationMs(20_000),
            duration: DurationMs(30_000),
            ..Default::default()
        }
    }

    fn downloader(
        source: Arc<ScriptedSource>,
        storage: ExpandedFormatter,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> LiveDownloader<Arc<ScriptedSource>> {
        let session = DownloadSession::new(String::new(), "k3y".into(), settings);
        LiveDownloader::new(source, storage, session, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_until_end_of_game() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        let source = Arc::new(
            ScriptedSource::with_segments(5, 1)
                .script(vec![info(3, 1, 4, 5), info(5, 0, 0, 5)]),
        );

        let replay = downloader(
            source.clone(),
            storage.clone(),
            SessionSettings::default(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(source.polls.load(Ordering::SeqCst), 2);
        for id in 1..=5 {
            assert!(storage.has_chunk(ChunkId::new(id).unwrap()), "chunk {id}");
        }
        assert!(!storage.has_chunk(ChunkId::new(6).unwrap()));
        assert!(storage.has_key_frame(KeyFrameId::new(1).unwrap()));
        assert!(storage.has_end_of_game_stats());
        assert!(tmp.path().join("endOfGameStats.bin").exists());
        assert_eq!(replay.version, "1.82.89");
        assert_eq!(replay.encryption_key, "k3y");

        let reloaded = Replay::load(&storage).unwrap();
        assert_eq!(reloaded.chunks().len(), 5);
        assert_eq!(reloaded.meta_data.game_key.game_id, 555);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_server_estimate_between_polls() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        let source = Arc::new(
            ScriptedSource::with_segments(5, 1)
                .script(vec![info(3, 1, 4, 5), info(5, 0, 0, 5)]),
        );
        let start = Instant::now();
        downloader(
            source,
            storage,
            SessionSettings::default(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();
        // one wait: 20 s estimate + 3 s margin
        assert_eq!(start.elapsed(), Duration::from_secs(23));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_chunk_is_retried_on_next_poll() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        let source = ScriptedSource::with_segments(5, 1)
            .script(vec![info(3, 1, 4, 5), info(5, 0, 0, 5)]);
        source
            .chunk_delays
            .lock()
            .unwrap()
            .insert(ChunkId::new(5).unwrap(), 2);
        let source = Arc::new(source);

        downloader(
            source.clone(),
            storage.clone(),
            SessionSettings::default(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);
        assert!(storage.has_chunk(ChunkId::new(5).unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_chunk_aborts_download() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        let source = ScriptedSource::with_segments(5, 1)
            .script(vec![info(3, 1, 4, 5), info(5, 0, 0, 5)]);
        source.chunks.lock().unwrap().remove(&ChunkId::new(4).unwrap());
        let settings = SessionSettings {
            max_segment_retries: 2,
            ..Default::default()
        };

        let err = downloader(
            Arc::new(source),
            storage.clone(),
            settings,
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::SegmentLost(_)), "{err}");
        // what was obtained stays on disk for a later resume
        assert!(storage.has_chunk(ChunkId::new(3).unwrap()));
        assert!(storage.has_header());
        assert!(!storage.has_end_of_game_stats());
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_aborts_and_leaves_resumable_state() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        let source = ScriptedSource::with_segments(5, 1)
            .script(vec![info(3, 1, 4, 5), info(5, 0, 0, 5)]);
        source
            .chunk_errors
            .lock()
            .unwrap()
            .insert(ChunkId::new(2).unwrap(), 503);
        let source = Arc::new(source);

        let err = downloader(
            source.clone(),
            storage.clone(),
            SessionSettings::default(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap_err();
        assert!(
            matches!(err, DownloadError::Http { status: 503, .. }),
            "{err}"
        );
        // no retry of a hard error, no further poll
        assert_eq!(source.polls.load(Ordering::SeqCst), 1);
        assert!(storage.has_chunk(ChunkId::new(1).unwrap()));
        assert!(!storage.has_chunk(ChunkId::new(2).unwrap()));
        assert!(!storage.has_end_of_game_stats());

        let saved = Replay::load_header(&storage).unwrap();
        assert_eq!(saved.encryption_key, "k3y");
        // header written after the poll, before any segment was fetched
        assert!(saved.chunk(ChunkId::new(3).unwrap()).is_some());
        assert_eq!(saved.meta_data.end_game_chunk_id, ChunkId::new(5));

        source.chunk_errors.lock().unwrap().clear();
        let requests_before = source.chunk_requests.load(Ordering::SeqCst);
        let session = DownloadSession::resume(saved, SessionSettings::default());
        let replay = LiveDownloader::new(
            source.clone(),
            storage.clone(),
            session,
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(replay.chunks().len(), 5);
        // chunk 1 is on disk already: 2 through 5 are requested
        assert_eq!(source.chunk_requests.load(Ordering::SeqCst) - requests_before, 4);
        assert!(Replay::load(&storage).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_stored_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        for id in 1..=3 {
            storage
                .write_chunk(ChunkId::new(id).unwrap(), &[id as u8; 8])
                .unwrap();
        }
        let source = Arc::new(ScriptedSource::with_segments(5, 1).script(vec![info(5, 1, 4, 5)]));

        downloader(
            source.clone(),
            storage.clone(),
            SessionSettings::default(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(source.chunk_requests.load(Ordering::SeqCst), 2);
        assert!(storage.has_end_of_game_stats());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_iterations() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ExpandedFormatter::open(tmp.path()).unwrap();
        // never ends
        let source = Arc::new(ScriptedSource::with_segments(3, 1).script(vec![info(3, 1, 4, 0)]));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            downloader(
                source.clone(),
                storage.clone(),
                SessionSettings::default(),
                cancel.clone(),
            )
            .run(),
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(DownloadError::Cancelled)));
        assert_eq!(source.polls.load(Ordering::SeqCst), 1);
        assert!(storage.has_chunk(ChunkId::new(3).unwrap()));
    }
}
