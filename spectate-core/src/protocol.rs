//! Observer REST protocol: function names, URL formatting and request path routing.
//!
//! Paths look like `/observer-mode/rest/consumer/<function>/<platform>/<game>/<id>/token`
//! or `.../<platform>/<game>/null`, except `version` which takes no argument.

use std::fmt;

use crate::metadata::GameKey;

/// Path prefix shared by every observer endpoint.
pub const PREFIX: &str = "/observer-mode/rest/consumer/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpectateFunction {
    Version,
    GetGameMetaData,
    GetLastChunkInfo,
    GetGameDataChunk,
    GetKeyFrame,
    EndOfGameStats,
}

impl SpectateFunction {
    pub const ALL: [SpectateFunction; 6] = [
        SpectateFunction::Version,
        SpectateFunction::GetGameMetaData,
        SpectateFunction::GetLastChunkInfo,
        SpectateFunction::GetGameDataChunk,
        SpectateFunction::GetKeyFrame,
        SpectateFunction::EndOfGameStats,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpectateFunction::Version => "version",
            SpectateFunction::GetGameMetaData => "getGameMetaData",
            SpectateFunction::GetLastChunkInfo => "getLastChunkInfo",
            SpectateFunction::GetGameDataChunk => "getGameDataChunk",
            SpectateFunction::GetKeyFrame => "getKeyFrame",
            SpectateFunction::EndOfGameStats => "endOfGameStats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }

    /// Content type of a successful answer.
    pub fn content_type(self) -> &'static str {
        match self {
            SpectateFunction::Version => "text/plain",
            SpectateFunction::GetGameMetaData | SpectateFunction::GetLastChunkInfo => {
                "application/json"
            }
            SpectateFunction::GetGameDataChunk
            | SpectateFunction::GetKeyFrame
            | SpectateFunction::EndOfGameStats => "application/octet-stream",
        }
    }
}

impl fmt::Display for SpectateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trailing argument of a game request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// `<n>/token`
    Id(i64),
    /// `null`
    Null,
}

/// A routed observer request. Platform and game segments are kept as text so that they
/// can be compared verbatim against a replay's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Version,
    Game {
        function: SpectateFunction,
        platform_id: &'a str,
        game_id: &'a str,
        param: Param,
    },
}

impl<'a> Route<'a> {
    /// Parses a request target. Query strings are ignored; anything that does not follow
    /// the observer scheme yields `None`.
    pub fn parse(target: &'a str) -> Option<Self> {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let rest = path.strip_prefix(PREFIX)?;
        let parts: Vec<&str> = rest.split('/').collect();
        let function = SpectateFunction::from_name(parts[0])?;
        if function == SpectateFunction::Version {
            return Some(Route::Version);
        }
        let param = match parts.as_slice() {
            [_, _, _, "null"] => Param::Null,
            [_, _, _, id, "token"] => Param::Id(id.parse().ok()?),
            _ => return None,
        };
        Some(Route::Game {
            function,
            platform_id: parts[1],
            game_id: parts[2],
            param,
        })
    }

    pub fn function(&self) -> SpectateFunction {
        match self {
            Route::Version => SpectateFunction::Version,
            Route::Game { function, .. } => *function,
        }
    }

    /// True when the request targets `key` exactly (no case folding, no numeric
    /// normalisation of the game ID).
    pub fn targets(&self, key: &GameKey) -> bool {
        match self {
            Route::Version => true,
            Route::Game {
                platform_id,
                game_id,
                ..
            } => *platform_id == key.platform_id && *game_id == key.game_id.to_string(),
        }
    }
}

/// Full URL of a game request on `host` (`host[:port]`).
pub fn game_url(
    host: &str,
    function: SpectateFunction,
    key: &GameKey,
    param: Param,
) -> String {
    match param {
        Param::Id(id) => format!(
            "http://{host}{PREFIX}{function}/{}/{}/{id}/token",
            key.platform_id, key.game_id
        ),
        Param::Null => format!(
            "http://{host}{PREFIX}{function}/{}/{}/null",
            key.platform_id, key.game_id
        ),
    }
}

pub fn version_url(host: &str) -> String {
    format!("http://{host}{PREFIX}{}", SpectateFunction::Version)
}
