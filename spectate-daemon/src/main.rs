// Spectate mirror: download live spectator streams, re-serve stored replays.

mod client;
mod config;
mod downloader;
mod server;

#[cfg(test)]
mod test_support;

use anyhow::{anyhow, bail, Context};
use spectate_core::{DownloadSession, ExpandedFormatter, Region, ReplayManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::client::SpectateClient;
use crate::config::Config;
use crate::downloader::{DownloadError, LiveDownloader};
use crate::server::ReplayServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: spectate-daemon <command>
  download <region> <game-id> <encryption-key>   mirror a live game
  resume <region> <game-id>                      continue an interrupted download
  serve <region> [game-id]                       replay a stored game (latest by default)
  list [region]                                  list stored replays
  gc [limit] [max-age-hours]                     delete old replays (default age 840h, 0 keeps all)
  clean                                          delete incomplete replays";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("spectate-daemon {}", VERSION);
        return Ok(());
    }
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let manager = ReplayManager::new(&cfg.data_dir)
        .with_context(|| format!("replay directory {}", cfg.data_dir.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(&args, &cfg, &manager))
}

fn region_arg(args: &[String], i: usize) -> anyhow::Result<&'static Region> {
    let name = args.get(i).ok_or_else(|| anyhow!("missing region\n{USAGE}"))?;
    Region::lookup(name).ok_or_else(|| anyhow!("unknown region {name}"))
}

fn game_id_arg(args: &[String], i: usize) -> anyhow::Result<Option<u64>> {
    args.get(i)
        .map(|s| s.parse().with_context(|| format!("invalid game id {s}")))
        .transpose()
}

async fn run(args: &[String], cfg: &Config, manager: &ReplayManager) -> anyhow::Result<()> {
    match args[0].as_str() {
        "download" => {
            let region = region_arg(args, 1)?;
            let game_id = game_id_arg(args, 2)?.ok_or_else(|| anyhow!("missing game id"))?;
            let key = args.get(3).ok_or_else(|| anyhow!("missing encryption key"))?;
            let storage = manager.create(region, game_id)?;
            let session = DownloadSession::new(String::new(), key.clone(), cfg.session_settings());
            download(region, game_id, storage, session, cfg).await
        }
        "resume" => {
            let region = region_arg(args, 1)?;
            let game_id = game_id_arg(args, 2)?.ok_or_else(|| anyhow!("missing game id"))?;
            let (replay, storage) = manager.resume(region, game_id)?;
            if replay.encryption_key.is_empty() {
                bail!("no download to resume for {region} game {game_id}");
            }
            let session = DownloadSession::resume(replay, cfg.session_settings());
            download(region, game_id, storage, session, cfg).await
        }
        "serve" => {
            let region = region_arg(args, 1)?;
            let game_id = match game_id_arg(args, 2)? {
                Some(id) => id,
                None => manager
                    .latest(region)?
                    .ok_or_else(|| anyhow!("no stored replay for {region}"))?,
            };
            serve(manager, region, game_id, cfg).await
        }
        "list" => {
            let replays = match args.get(1) {
                Some(_) => manager.replays_in(region_arg(args, 1)?)?,
                None => manager.replays()?,
            };
            for gm in replays {
                println!(
                    "{}\t{}\t{}\tchunks 1..{}",
                    gm.game_key.platform_id,
                    gm.game_key.game_id,
                    gm.create_time,
                    gm.end_game_chunk_id.map_or(0, |id| id.get())
                );
            }
            Ok(())
        }
        "gc" => {
            let limit = args
                .get(1)
                .map(|s| s.parse::<usize>().with_context(|| format!("invalid limit {s}")))
                .transpose()?;
            let hours = args
                .get(2)
                .map(|s| s.parse::<u64>().with_context(|| format!("invalid age {s}")))
                .transpose()?;
            let max_age = cfg.gc_max_age(hours);
            let now = chrono::Local::now().naive_local();
            for key in manager.garbage_collect(limit, max_age, now)? {
                println!("deleted {} {}", key.platform_id, key.game_id);
            }
            Ok(())
        }
        "clean" => {
            for entry in manager.remove_incomplete()? {
                println!("deleted {} ({})", entry.dir.display(), entry.reason);
            }
            Ok(())
        }
        other => bail!("unknown command {other}\n{USAGE}"),
    }
}

async fn download(
    region: &'static Region,
    game_id: u64,
    storage: ExpandedFormatter,
    session: DownloadSession,
    cfg: &Config,
) -> anyhow::Result<()> {
    let client = SpectateClient::new(region, game_id, cfg.request_timeout())?;
    let cancel = CancellationToken::new();
    let downloader = LiveDownloader::new(client, storage, session, cancel.clone());
    let mut task = tokio::spawn(downloader.run());
    let result = tokio::select! {
        res = &mut task => res?,
        res = shutdown_signal() => {
            res?;
            tracing::info!("interrupted, stopping after the current request");
            cancel.cancel();
            task.await?
        }
    };
    match result {
        Ok(replay) => {
            println!(
                "downloaded {} {}: {} chunks, {} keyframes",
                region.platform_id,
                game_id,
                replay.chunks().len(),
                replay.key_frames().len()
            );
            Ok(())
        }
        Err(DownloadError::Cancelled) => {
            println!("download interrupted, continue with: spectate-daemon resume {region} {game_id}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn serve(
    manager: &ReplayManager,
    region: &'static Region,
    game_id: u64,
    cfg: &Config,
) -> anyhow::Result<()> {
    let stored = manager.get(region, game_id)?;
    let server = ReplayServer::new(stored, cfg.time_divisor)?;
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    let key = server.game_key();
    println!(
        "serving {} {} on {} (encryption key {})",
        key.platform_id,
        key.game_id,
        cfg.listen_addr,
        server.encryption_key()
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.run(listener, shutdown.clone()));
    shutdown_signal().await?;
    shutdown.cancel();
    task.await??;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
