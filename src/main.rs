// src/main.rs

use anyhow::{bail, Context, Result};
use chunkfetch::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_DOWNLOAD_DIR: &str = "./download/";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match std::env::var_os("CHUNKFETCH_CONFIG") {
        Some(path) => FetcherConfig::load(&PathBuf::from(path))
            .await
            .context("loading CHUNKFETCH_CONFIG")?,
        None => {
            if args.is_empty() {
                bail!("usage: chunkfetch <chunk-size> <url>...");
            }
            let chunk_size: u64 = args
                .remove(0)
                .parse()
                .context("chunk size must be a byte count")?;
            FetcherConfig {
                pool: PoolConfig::default(),
                task: TaskOptions::new(DEFAULT_DOWNLOAD_DIR, chunk_size)?,
            }
        }
    };
    if args.is_empty() {
        bail!("no URLs given");
    }

    let fetcher = Arc::new(ReqwestFetcher::new(&config.pool)?);
    let pool = DownloaderPool::new(config.pool.clone(), fetcher)?;
    let dispatcher = pool.start().await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, pending chunks are kept for the next run");
                cancel.cancel();
            }
        });
    }

    let mut tasks = JoinSet::new();
    for url in args {
        let pool = pool.clone();
        let options = config.task.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let task = Task::new(&url, &options, pool).await?;
            tokio::spawn(watch_progress(url.clone(), task.subscribe()));
            let outcome = task.run(cancel).await?;
            Ok::<_, TaskError>((url, outcome))
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok((url, TaskOutcome::Completed { path, resumed })) => {
                info!(%url, path = %path.display(), resumed, "finished");
            }
            Ok((url, TaskOutcome::Cancelled { remaining_chunks })) => {
                info!(%url, remaining_chunks, "stopped");
            }
            Err(e) => {
                error!("{e}");
                failed += 1;
            }
        }
    }

    pool.shutdown().await;
    let _ = dispatcher.await;

    if failed > 0 {
        bail!("{failed} download(s) failed");
    }
    Ok(())
}

/// Logs state changes of one task until it settles.
async fn watch_progress(url: String, mut progress: watch::Receiver<TaskProgress>) {
    while progress.changed().await.is_ok() {
        let snapshot = *progress.borrow_and_update();
        debug!(
            %url,
            state = ?snapshot.state,
            "{:.0}% of {} chunks",
            snapshot.fraction() * 100.0,
            snapshot.total_chunks
        );
        if snapshot.state.is_terminal() {
            break;
        }
    }
}
