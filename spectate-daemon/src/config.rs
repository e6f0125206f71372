//! Load config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use spectate_core::{DurationMs, SessionSettings, DEFAULT_TIME_DIVISOR};

/// Daemon configuration. File: ~/.config/spectate-mirror/config.toml or
/// /etc/spectate-mirror/config.toml.
/// Env overrides: SPECTATE_DATA_DIR, SPECTATE_LISTEN_ADDR, SPECTATE_TIME_DIVISOR,
/// SPECTATE_MAX_SEGMENT_RETRIES.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Replay catalog root (default ~/.cache/spectate-mirror).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Replay server listen address (default 127.0.0.1:8088).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Replay streaming speed-up (default 4).
    #[serde(default = "default_time_divisor")]
    pub time_divisor: i64,
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    #[serde(default = "default_loading_screen_wait_ms")]
    pub loading_screen_wait_ms: u64,
    #[serde(default = "default_max_segment_retries")]
    pub max_segment_retries: u32,
    /// Observer request timeout; 0 waits forever.
    #[serde(default)]
    pub request_timeout_secs: u64,
    /// `gc` deletes replays older than this (default 840, five weeks); 0 keeps all ages.
    #[serde(default = "default_gc_max_age_hours")]
    pub gc_max_age_hours: u64,
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".cache/spectate-mirror"),
        None => PathBuf::from("spectate-mirror"),
    }
}
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8088))
}
fn default_time_divisor() -> i64 {
    DEFAULT_TIME_DIVISOR
}
fn default_min_poll_interval_ms() -> u64 {
    1000
}
fn default_loading_screen_wait_ms() -> u64 {
    60_000
}
fn default_max_segment_retries() -> u32 {
    10
}
fn default_gc_max_age_hours() -> u64 {
    840
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_addr: default_listen_addr(),
            time_divisor: default_time_divisor(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            loading_screen_wait_ms: default_loading_screen_wait_ms(),
            max_segment_retries: default_max_segment_retries(),
            request_timeout_secs: 0,
            gc_max_age_hours: default_gc_max_age_hours(),
        }
    }
}

impl Config {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            min_poll_interval: DurationMs(i64::try_from(self.min_poll_interval_ms).unwrap_or(i64::MAX)),
            loading_screen_wait: DurationMs(
                i64::try_from(self.loading_screen_wait_ms).unwrap_or(i64::MAX),
            ),
            max_segment_retries: self.max_segment_retries,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Age cut-off for `gc`: `hours` from the command line, else the configured default.
    pub fn gc_max_age(&self, hours: Option<u64>) -> Option<chrono::Duration> {
        let hours = hours.unwrap_or(self.gc_max_age_hours);
        if hours == 0 {
            return None;
        }
        chrono::Duration::try_hours(i64::try_from(hours).unwrap_or(i64::MAX))
    }

    /// Applies environment overrides; unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("SPECTATE_DATA_DIR") {
            if !s.is_empty() {
                self.data_dir = PathBuf::from(s);
            }
        }
        if let Some(s) = var("SPECTATE_LISTEN_ADDR") {
            if let Ok(a) = s.parse::<SocketAddr>() {
                self.listen_addr = a;
            }
        }
        if let Some(s) = var("SPECTATE_TIME_DIVISOR") {
            if let Ok(d) = s.parse::<i64>() {
                if d > 0 {
                    self.time_divisor = d;
                }
            }
        }
        if let Some(s) = var("SPECTATE_MAX_SEGMENT_RETRIES") {
            if let Ok(n) = s.parse::<u32>() {
                self.max_segment_retries = n;
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/spectate-mirror/config.toml"));
    }
    out.push(PathBuf::from("/etc/spectate-mirror/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "ignoring config file: {e}"),
                },
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config file: {e}"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_override_defaults() {
        let c: Config = toml::from_str(
            r#"
            data_dir = "/srv/replays"
            listen_addr = "0.0.0.0:9000"
            time_divisor = 2
            "#,
        )
        .unwrap();
        assert_eq!(c.data_dir, PathBuf::from("/srv/replays"));
        assert_eq!(c.listen_addr.port(), 9000);
        assert_eq!(c.time_divisor, 2);
        assert_eq!(c.min_poll_interval_ms, 1000);
        assert_eq!(c.max_segment_retries, 10);
        assert_eq!(c.request_timeout(), None);
        assert_eq!(c.gc_max_age_hours, 840);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("SPECTATE_LISTEN_ADDR", "127.0.0.1:7000"),
            ("SPECTATE_TIME_DIVISOR", "0"),
            ("SPECTATE_MAX_SEGMENT_RETRIES", "3"),
            ("SPECTATE_DATA_DIR", "/tmp/r"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr.port(), 7000);
        assert_eq!(c.time_divisor, DEFAULT_TIME_DIVISOR);
        assert_eq!(c.max_segment_retries, 3);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/r"));
    }

    #[test]
    fn session_settings_from_config() {
        let c = Config {
            min_poll_interval_ms: 250,
            request_timeout_secs: 5,
            ..Default::default()
        };
        let s = c.session_settings();
        assert_eq!(s.min_poll_interval, DurationMs(250));
        assert_eq!(s.loading_screen_wait, DurationMs(60_000));
        assert_eq!(c.request_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn gc_age_defaults_to_five_weeks() {
        let c = Config::default();
        assert_eq!(c.gc_max_age(None), Some(chrono::Duration::hours(840)));
        assert_eq!(c.gc_max_age(Some(24)), Some(chrono::Duration::hours(24)));
        assert_eq!(c.gc_max_age(Some(0)), None);

        let keep_all = Config {
            gc_max_age_hours: 0,
            ..Default::default()
        };
        assert_eq!(keep_all.gc_max_age(None), None);
        assert_eq!(keep_all.gc_max_age(Some(u64::MAX)), None);
    }
}
