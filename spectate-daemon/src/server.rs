//! Replay server: re-serves a stored replay over the observer protocol, paced as if it
//! was live.
//!
//! One pacing actor owns the simulated timeline; HTTP handlers ask it for snapshots over
//! channels and never see a half-updated state.

use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;

use spectate_core::{
    ChunkId, ChunkInfoGenerator, ExpandedFormatter, GameKey, GameMetadata, KeyFrameId,
    LastChunkInfo, Pacer, PacingError, Param, ReplayDataLoader, Route, SpectateFunction,
    StoredReplay,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type MetadataReply = oneshot::Sender<Arc<GameMetadata>>;
type ChunkInfoReply = oneshot::Sender<ChunkInfoGenerator>;

/// Request side of the pacing actor. Answers `None` once the actor stopped.
#[derive(Debug, Clone)]
pub struct PacingHandle {
    metadata_tx: mpsc::Sender<MetadataReply>,
    chunk_info_tx: mpsc::Sender<ChunkInfoReply>,
}

impl PacingHandle {
    pub async fn metadata(&self) -> Option<Arc<GameMetadata>> {
        let (tx, rx) = oneshot::channel();
        self.metadata_tx.send(tx).await.ok()?;
        rx.await.ok()
    }

    /// Last chunk info with timings computed now.
    pub async fn chunk_info(&self) -> Option<LastChunkInfo> {
        let (tx, rx) = oneshot::channel();
        self.chunk_info_tx.send(tx).await.ok()?;
        let generator = rx.await.ok()?;
        Some(generator.generate(Instant::now().into_std()))
    }
}

struct PacingActor {
    pacer: Arc<Pacer>,
    current: ChunkId,
    metadata: Arc<GameMetadata>,
    generator: ChunkInfoGenerator,
    bootstrapped: bool,
    next_tick: Option<Instant>,
}

impl PacingActor {
    fn new(pacer: Arc<Pacer>) -> Self {
        let current = pacer.start_chunk();
        Self {
            metadata: Arc::new(pacer.metadata_at(current)),
            generator: pacer.initial_chunk_info(),
            current,
            pacer,
            bootstrapped: false,
            next_tick: None,
        }
    }

    /// The timeline starts moving with the first client request.
    fn bootstrap(&mut self) {
        if !self.bootstrapped {
            self.bootstrapped = true;
            self.next_tick = Some(Instant::now() + self.pacer.bootstrap_delay());
            info!(chunk = %self.current, "started data increment loop");
        }
    }

    fn advance(&mut self) {
        self.next_tick = None;
        let Some(next) = self.pacer.next_chunk(self.current) else {
            return;
        };
        let emitted = Instant::now();
        self.current = next;
        self.metadata = Arc::new(self.pacer.metadata_at(next));
        self.generator = self.pacer.chunk_info_at(next, emitted.into_std());
        if next < self.pacer.end_chunk() {
            self.next_tick = Some(emitted + self.pacer.interval(next));
        }
        debug!(chunk = %next, "incrementing to chunk");
    }

    async fn run(
        mut self,
        mut metadata_rx: mpsc::Receiver<MetadataReply>,
        mut chunk_info_rx: mpsc::Receiver<ChunkInfoReply>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next_tick = self.next_tick;
            let tick = async move {
                match next_tick {
                    Some(at) => sleep_until(at).await,
                    None => pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick => self.advance(),
                Some(reply) = metadata_rx.recv() => {
                    self.bootstrap();
                    let _ = reply.send(self.metadata.clone());
                }
                Some(reply) = chunk_info_rx.recv() => {
                    self.bootstrap();
                    let _ = reply.send(self.generator);
                }
                else => break,
            }
        }
        debug!("pacing loop stopped");
        // dropping the receivers answers every queued request with None
    }
}

/// Spawns the pacing actor; it stops when `shutdown` is cancelled.
pub fn spawn_pacing(pacer: Arc<Pacer>, shutdown: CancellationToken) -> (PacingHandle, JoinHandle<()>) {
    let (metadata_tx, metadata_rx) = mpsc::channel(16);
    let (chunk_info_tx, chunk_info_rx) = mpsc::channel(16);
    let actor = PacingActor::new(pacer);
    let task = tokio::spawn(actor.run(metadata_rx, chunk_info_rx, shutdown));
    (
        PacingHandle {
            metadata_tx,
            chunk_info_tx,
        },
        task,
    )
}

struct ServeState {
    key: GameKey,
    version: String,
    storage: ExpandedFormatter,
    pacing: PacingHandle,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn ok(function: SpectateFunction, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: function.content_type(),
            body,
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    fn not_found() -> Self {
        Self::status(404)
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Internal Server Error",
        }
    }
}

/// A stored replay being served.
pub struct ReplayServer {
    state: Arc<ServeState>,
    encryption_key: String,
    pacing_shutdown: CancellationToken,
    pacing_task: JoinHandle<()>,
}

impl ReplayServer {
    /// Starts the pacing actor. Must be called within a tokio runtime.
    pub fn new(stored: StoredReplay, time_divisor: i64) -> Result<Self, PacingError> {
        let StoredReplay { replay, storage } = stored;
        let key = replay.meta_data.game_key.clone();
        let version = replay.version.clone();
        let encryption_key = replay.encryption_key.clone();
        let pacer = Pacer::new(replay, time_divisor)?;
        info!(
            platform = %key.platform_id,
            game = key.game_id,
            start = %pacer.start_chunk(),
            end = %pacer.end_chunk(),
            "serving replay"
        );
        let pacing_shutdown = CancellationToken::new();
        let (pacing, pacing_task) = spawn_pacing(Arc::new(pacer), pacing_shutdown.clone());
        Ok(Self {
            state: Arc::new(ServeState {
                key,
                version,
                storage,
                pacing,
            }),
            encryption_key,
            pacing_shutdown,
            pacing_task,
        })
    }

    pub fn game_key(&self) -> &GameKey {
        &self.state.key
    }

    /// Key a client needs to decrypt the served segments.
    pub fn encryption_key(&self) -> &str {
        &self.encryption_key
    }

    /// Accepts connections until `shutdown` is cancelled, then closes the listener and
    /// only afterwards stops the pacing actor.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, peer, state).await {
                            debug!(%peer, "connection error: {e}");
                        }
                    });
                }
            }
        }
        drop(listener);
        self.pacing_shutdown.cancel();
        let _ = self.pacing_task.await;
        info!("replay server stopped");
        Ok(())
    }
}

async fn handle_client(
    mut client: TcpStream,
    peer: SocketAddr,
    state: Arc<ServeState>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 8192];
    let n = client.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    let (method, path, resp) = {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf[..n]) {
            Ok(status) if status.is_complete() => {
                let method = req.method.unwrap_or_default().to_string();
                let path = req.path.unwrap_or_default().to_string();
                (method, path, None)
            }
            _ => (String::new(), String::new(), Some(Response::status(400))),
        }
    };
    let resp = match resp {
        Some(r) => r,
        None if method != "GET" => Response::status(405),
        None => respond(&path, &state).await,
    };
    info!(%peer, %method, %path, status = resp.status, "request");
    write_response(&mut client, &resp).await
}

async fn write_response(client: &mut TcpStream, resp: &Response) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        resp.reason(),
        resp.content_type,
        resp.body.len()
    );
    client.write_all(head.as_bytes()).await?;
    client.write_all(&resp.body).await?;
    client.flush().await
}

/// Stored payload a request asks for.
#[derive(Debug, Clone, Copy)]
enum Payload {
    Chunk(ChunkId),
    KeyFrame(KeyFrameId),
    EndOfGameStats,
}

/// Reads a payload on the blocking pool. `None` when it is not on disk or unreadable.
async fn read_payload(storage: ExpandedFormatter, payload: Payload) -> Option<Vec<u8>> {
    let read = tokio::task::spawn_blocking(move || {
        let present = match payload {
            Payload::Chunk(id) => storage.has_chunk(id),
            Payload::KeyFrame(id) => storage.has_key_frame(id),
            Payload::EndOfGameStats => storage.has_end_of_game_stats(),
        };
        if !present {
            return Ok(None);
        }
        match payload {
            Payload::Chunk(id) => storage.read_chunk(id),
            Payload::KeyFrame(id) => storage.read_key_frame(id),
            Payload::EndOfGameStats => storage.read_end_of_game_stats(),
        }
        .map(Some)
    })
    .await;
    match read {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            warn!(?payload, "cannot read stored data: {e}");
            None
        }
        Err(e) => {
            warn!(?payload, "read task failed: {e}");
            None
        }
    }
}

fn json<T: serde::Serialize>(function: SpectateFunction, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => Response::ok(function, body),
        Err(e) => {
            warn!("cannot encode {function}: {e}");
            Response::status(500)
        }
    }
}

async fn respond(path: &str, state: &ServeState) -> Response {
    let Some(route) = Route::parse(path) else {
        return Response::not_found();
    };
    if !route.targets(&state.key) {
        return Response::not_found();
    }
    let function = route.function();
    let param = match route {
        Route::Version => return Response::ok(function, state.version.clone().into_bytes()),
        Route::Game { param, .. } => param,
    };

    let payload = match (function, param) {
        (SpectateFunction::GetGameMetaData, Param::Id(_)) => {
            return match state.pacing.metadata().await {
                Some(gm) => json(function, gm.as_ref()),
                None => Response::not_found(),
            };
        }
        (SpectateFunction::GetLastChunkInfo, Param::Id(_)) => {
            return match state.pacing.chunk_info().await {
                Some(ci) => json(function, &ci),
                None => Response::not_found(),
            };
        }
        (SpectateFunction::GetGameDataChunk, Param::Id(raw)) => ChunkId::new(raw).map(Payload::Chunk),
        (SpectateFunction::GetKeyFrame, Param::Id(raw)) => KeyFrameId::new(raw).map(Payload::KeyFrame),
        (SpectateFunction::EndOfGameStats, Param::Null) => Some(Payload::EndOfGameStats),
        _ => None,
    };
    let Some(payload) = payload else {
        return Response::not_found();
    };
    match read_payload(state.storage.clone(), payload).await {
        Some(body) => Response::ok(function, body),
        None => Response::not_found(),
    }
}
