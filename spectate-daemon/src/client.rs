//! Observer API client: one game on one region's spectator endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use spectate_core::protocol::{game_url, version_url};
use spectate_core::{
    ChunkId, GameKey, GameMetadata, KeyFrameId, LastChunkInfo, Param, Region, SpectateFunction,
};

use crate::downloader::DownloadError;

/// What the downloader needs from the remote observer API. Segment fetches answer
/// `None` while the segment is not published yet (HTTP 404).
#[async_trait]
pub trait SpectateSource: Send + Sync {
    async fn version(&self) -> Result<String, DownloadError>;
    async fn game_metadata(&self) -> Result<GameMetadata, DownloadError>;
    async fn last_chunk_info(&self) -> Result<LastChunkInfo, DownloadError>;
    async fn chunk(&self, id: ChunkId) -> Result<Option<Vec<u8>>, DownloadError>;
    async fn key_frame(&self, id: KeyFrameId) -> Result<Option<Vec<u8>>, DownloadError>;
    async fn end_of_game_stats(&self) -> Result<Vec<u8>, DownloadError>;
}

#[derive(Debug, Clone)]
pub struct SpectateClient {
    http: reqwest::Client,
    host: String,
    key: GameKey,
}

impl SpectateClient {
    pub fn new(
        region: &'static Region,
        game_id: u64,
        timeout: Option<Duration>,
    ) -> Result<Self, DownloadError> {
        if !region.is_spectatable() {
            return Err(DownloadError::Region(region.code.to_string()));
        }
        let key = GameKey {
            game_id,
            platform_id: region.platform_id.to_string(),
        };
        Self::with_host(region.spectator_host, key, timeout)
    }

    /// Client for `key` on an explicit `host[:port]`, such as a local replay server.
    pub fn with_host(
        host: impl Into<String>,
        key: GameKey,
        timeout: Option<Duration>,
    ) -> Result<Self, DownloadError> {
        let host = host.into();
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let http = builder.build().map_err(|source| DownloadError::Transport {
            url: host.clone(),
            source,
        })?;
        Ok(Self { http, host, key })
    }

    pub fn game_key(&self) -> &GameKey {
        &self.key
    }

    fn url(&self, function: SpectateFunction, param: Param) -> String {
        game_url(&self.host, function, &self.key, param)
    }

    /// GET returning the body, or `None` on 404.
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        let transport = |source| DownloadError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.http.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await.map_err(transport)?;
        Ok(Some(body.to_vec()))
    }

    /// GET where 404 is an error like any other status.
    async fn fetch_required(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        self.fetch(url).await?.ok_or_else(|| DownloadError::Http {
            status: StatusCode::NOT_FOUND.as_u16(),
            url: url.to_string(),
        })
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DownloadError> {
        let body = self.fetch_required(url).await?;
        serde_json::from_slice(&body).map_err(|source| DownloadError::Json {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl SpectateSource for SpectateClient {
    async fn version(&self) -> Result<String, DownloadError> {
        let body = self.fetch_required(&version_url(&self.host)).await?;
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }

    async fn game_metadata(&self) -> Result<GameMetadata, DownloadError> {
        self.fetch_json(&self.url(SpectateFunction::GetGameMetaData, Param::Id(1)))
            .await
    }

    async fn last_chunk_info(&self) -> Result<LastChunkInfo, DownloadError> {
        self.fetch_json(&self.url(SpectateFunction::GetLastChunkInfo, Param::Id(1)))
            .await
    }

    async fn chunk(&self, id: ChunkId) -> Result<Option<Vec<u8>>, DownloadError> {
        self.fetch(&self.url(SpectateFunction::GetGameDataChunk, Param::Id(id.into())))
            .await
    }

    async fn key_frame(&self, id: KeyFrameId) -> Result<Option<Vec<u8>>, DownloadError> {
        self.fetch(&self.url(SpectateFunction::GetKeyFrame, Param::Id(id.into())))
            .await
    }

    async fn end_of_game_stats(&self) -> Result<Vec<u8>, DownloadError> {
        self.fetch_required(&self.url(SpectateFunction::EndOfGameStats, Param::Null))
            .await
    }
}
