use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use f3_manifest::{
    ManifestDocument, ManifestSource, ManifestUpdates, ManifestWatcher, RpcManifestSource,
    WatcherConfig,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Watch the F3 manifest published by a node and print each new version as a JSON line
#[derive(Parser, Debug)]
#[command(name = "f3-manifestd")]
struct Args {
    /// Config file (defaults to ~/.f3/manifest-watcher.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node JSON-RPC socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Seconds between polls
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Static manifest whose initial power table fills in fetched manifests
    #[arg(long)]
    seed: Option<PathBuf>,

    /// RPC method returning the manifest
    #[arg(long)]
    method: Option<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<WatcherConfig> {
        let config = match &self.config {
            Some(path) => WatcherConfig::load(path)?,
            None => WatcherConfig::load_or_default()?,
        };
        Ok(self.override_config(config))
    }

    /// Flags win over the config file
    fn override_config(&self, mut config: WatcherConfig) -> WatcherConfig {
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(seed) = &self.seed {
            config.seed_manifest = Some(seed.clone());
        }
        if let Some(method) = &self.method {
            config.rpc_method = method.clone();
        }
        config
    }
}

/// How long shutdown waits for the poll loop to reach its next boundary
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stop the watcher and wait for its poll loop to exit.
///
/// The loop only notices the stop after its current sleep, so the wait is
/// bounded by `grace` and cut short by `interrupt`. Returns `false` when the
/// loop was left behind.
async fn shutdown<M, S>(
    watcher: &ManifestWatcher<M, S>,
    updates: &ManifestUpdates<M>,
    cancel: &CancellationToken,
    grace: Duration,
    interrupt: impl Future<Output = ()>,
) -> anyhow::Result<bool>
where
    M: ManifestDocument,
    S: ManifestSource<M>,
{
    watcher.stop()?;
    cancel.cancel();

    let join = watcher.join();
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(join, deadline, interrupt);
    loop {
        tokio::select! {
            _ = &mut join => return Ok(true),
            _ = &mut deadline => {
                warn!(?grace, "Poll loop still sleeping, exiting without it");
                return Ok(false);
            }
            _ = &mut interrupt => {
                warn!("Interrupted again, exiting without waiting for the poll loop");
                return Ok(false);
            }
            // Keep receiving so a publish already in flight can complete.
            _ = updates.recv() => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries manifests; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.load_config()?;
    let seed = config.load_seed_manifest()?;

    let watcher = ManifestWatcher::new(
        seed.as_ref(),
        config.poll_interval_secs,
        RpcManifestSource::from_config(&config),
    )
    .with_span(tracing::info_span!(
        "manifest_watcher",
        socket = %config.socket_path.display()
    ));
    let updates = watcher.subscribe();
    let cancel = CancellationToken::new();
    watcher.start(cancel.clone())?;

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            update = updates.recv() => {
                let Some(manifest) = update else {
                    break;
                };
                stdout.write_all(serde_json::to_string(&manifest)?.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }

    shutdown(&watcher, &updates, &cancel, SHUTDOWN_GRACE, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use async_trait::async_trait;
    use f3_manifest::{Manifest, SourceError};

    use super::*;

    struct NoManifest;

    #[async_trait]
    impl ManifestSource<Manifest> for NoManifest {
        async fn get_manifest(&self, _cancel: &CancellationToken) -> Result<Option<Manifest>, SourceError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_out_poll_interval() {
        let watcher = ManifestWatcher::new(None, 60, NoManifest);
        let updates = watcher.subscribe();
        let cancel = CancellationToken::new();
        watcher.start(cancel.clone()).unwrap();

        // Let the loop poll once and fall asleep.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let joined = shutdown(&watcher, &updates, &cancel, Duration::from_millis(100), std::future::pending())
            .await
            .unwrap();
        assert!(!joined);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!watcher.is_running());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_second_interrupt_ends_shutdown() {
        let watcher = ManifestWatcher::new(None, 60, NoManifest);
        let updates = watcher.subscribe();
        let cancel = CancellationToken::new();
        watcher.start(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let joined = tokio::time::timeout(
            Duration::from_secs(5),
            shutdown(&watcher, &updates, &cancel, Duration::from_secs(600), async {}),
        )
        .await
        .expect("shutdown ignored the interrupt")
        .unwrap();
        assert!(!joined);
    }

    #[tokio::test]
    async fn test_shutdown_joins_loop_at_boundary() {
        let watcher = ManifestWatcher::new(None, 60, NoManifest);
        let updates = watcher.subscribe();
        let cancel = CancellationToken::new();
        watcher.start(cancel.clone()).unwrap();

        // The loop has not run yet, so it sees the stop at its first check.
        let joined = shutdown(&watcher, &updates, &cancel, Duration::from_secs(5), std::future::pending())
            .await
            .unwrap();
        assert!(joined);
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "f3-manifestd",
            "--socket",
            "/run/node.sock",
            "--poll-interval",
            "12",
            "--method",
            "F3.GetManifest",
        ])
        .unwrap();

        let config = args.override_config(WatcherConfig::default());
        assert_eq!(config.socket_path, PathBuf::from("/run/node.sock"));
        assert_eq!(config.poll_interval_secs, 12);
        assert_eq!(config.rpc_method, "F3.GetManifest");
        assert!(config.seed_manifest.is_none());
    }

    #[test]
    fn test_config_file_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.json");
        std::fs::write(&path, r#"{"poll_interval_secs": 60}"#).unwrap();

        let args = Args::try_parse_from([
            "f3-manifestd",
            "--config",
            path.to_str().unwrap(),
            "--seed",
            "/etc/f3/seed.json",
        ])
        .unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.seed_manifest, Some(PathBuf::from("/etc/f3/seed.json")));
    }
}
