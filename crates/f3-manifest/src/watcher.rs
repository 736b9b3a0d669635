//! Manifest Watcher
//!
//! Background poll loop that fetches the manifest from a [`ManifestSource`],
//! fills in the initial power table when the source leaves it out, and
//! publishes each validated change exactly once.
//!
//! Publishing is a rendezvous: [`ManifestWatcher::apply`] returns only after a
//! subscriber has taken the manifest, so at most one update is ever in flight
//! and the loop does not poll again until it has been consumed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::error::WatcherError;
use crate::manifest::{ManifestDocument, PowerTableCid};
use crate::source::ManifestSource;

/// Read end of the update channel.
///
/// Clones share a single receiver: every update is delivered to exactly one
/// of them, so one long-lived consumer is the intended use.
#[derive(Debug)]
pub struct ManifestUpdates<M> {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<M>>>,
}

impl<M> Clone for ManifestUpdates<M> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<M> ManifestUpdates<M> {
    /// Wait for the next published manifest
    pub async fn recv(&self) -> Option<M> {
        self.rx.lock().await.recv().await
    }

    /// Take a published manifest if one is waiting
    pub fn try_recv(&self) -> Option<M> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// State shared between the watcher handle and its poll loop
struct Inner<M, S> {
    /// Generation of the loop allowed to run, 0 when stopped
    active: AtomicU64,
    /// Last generation handed out by `start`
    generations: AtomicU64,
    poll_interval: Duration,
    current: RwLock<Option<M>>,
    fallback_initial_power_table: Option<PowerTableCid>,
    source: S,
    tx: mpsc::Sender<M>,
}

impl<M, S> Inner<M, S>
where
    M: ManifestDocument,
    S: ManifestSource<M>,
{
    fn is_live(&self, generation: u64) -> bool {
        self.active.load(Ordering::Acquire) == generation
    }

    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        while self.is_live(generation) && !cancel.is_cancelled() {
            self.poll_once(&cancel).await;
            tokio::time::sleep(self.poll_interval).await;
        }

        // A loop ended by cancellation leaves the watcher restartable.
        let _ = self
            .active
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire);
        debug!(generation, "Manifest poll loop exited");
    }

    async fn poll_once(&self, cancel: &CancellationToken) {
        debug!("Polling manifest from source...");
        let mut manifest = match self.source.get_manifest(cancel).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return,
            Err(err) => {
                warn!("Failed to get manifest from source: {}", err);
                return;
            }
        };

        if manifest.initial_power_table().is_none() {
            if let Some(cid) = &self.fallback_initial_power_table {
                manifest.set_initial_power_table(cid.clone());
            }
        }

        let changed = {
            let current = self.current.read().await;
            !manifest.equal(current.as_ref())
        };

        if changed {
            info!("Successfully polled manifest from source, updating...");
            self.apply(manifest).await;
        } else {
            info!("Successfully polled unchanged manifest from source");
        }
    }

    async fn apply(&self, manifest: M) {
        if let Err(err) = manifest.validate() {
            warn!("Invalid manifest, skip updating: {}", err);
            return;
        }

        *self.current.write().await = Some(manifest.clone());
        self.publish(manifest).await;
    }

    async fn publish(&self, manifest: M) {
        if self.tx.send(manifest).await.is_err() {
            debug!("Update channel closed, manifest dropped");
            return;
        }
        // The single slot frees up once a subscriber has taken the manifest.
        if let Ok(permit) = self.tx.reserve().await {
            drop(permit);
        }
    }
}

/// Polls a manifest source and publishes validated changes.
pub struct ManifestWatcher<M, S> {
    inner: Arc<Inner<M, S>>,
    updates: ManifestUpdates<M>,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl<M, S> ManifestWatcher<M, S>
where
    M: ManifestDocument,
    S: ManifestSource<M>,
{
    /// Create a watcher polling every `poll_interval_secs` seconds.
    ///
    /// A defined initial power table on `seed` becomes the fallback for
    /// fetched manifests that leave theirs undefined. A zero interval polls
    /// without pause.
    pub fn new(seed: Option<&M>, poll_interval_secs: u64, source: S) -> Self {
        Self::with_poll_interval(seed, Duration::from_secs(poll_interval_secs), source)
    }

    pub fn with_poll_interval(seed: Option<&M>, poll_interval: Duration, source: S) -> Self {
        let fallback_initial_power_table = seed.and_then(|m| m.initial_power_table()).cloned();
        let (tx, rx) = mpsc::channel(1);

        Self {
            inner: Arc::new(Inner {
                active: AtomicU64::new(0),
                generations: AtomicU64::new(0),
                poll_interval,
                current: RwLock::new(None),
                fallback_initial_power_table,
                source,
                tx,
            }),
            updates: ManifestUpdates {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
            task: Mutex::new(None),
            span: tracing::info_span!("manifest_watcher"),
        }
    }

    /// Emit all watcher logs under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub fn fallback_initial_power_table(&self) -> Option<&PowerTableCid> {
        self.inner.fallback_initial_power_table.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::Acquire) != 0
    }

    /// Snapshot of the last applied manifest
    pub async fn current(&self) -> Option<M> {
        self.inner.current.read().await.clone()
    }

    /// Validate `manifest` and, if it passes, make it current and publish it.
    ///
    /// Blocks until a subscriber receives the manifest. With no subscriber
    /// reading, this never returns.
    ///
    /// Dropping the future part way (for example under a timeout) does not
    /// roll anything back: once validated the manifest is already current and
    /// sits in the update slot until the next `recv`.
    pub async fn apply(&self, manifest: M) {
        self.inner.apply(manifest).instrument(self.span.clone()).await;
    }

    /// Spawn the poll loop on the current Tokio runtime.
    ///
    /// Starting an already running watcher logs a warning and does nothing.
    /// The loop ends at its next iteration once [`Self::stop`] is called or
    /// `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Result<(), WatcherError> {
        let _entered = self.span.enter();

        if self.is_running() {
            warn!("Manifest watcher has already been started");
            return Ok(());
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return Err(WatcherError::NoRuntime);
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if self
            .inner
            .active
            .compare_exchange(0, generation, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Manifest watcher has already been started");
            return Ok(());
        }
        info!(generation, poll_interval = ?self.inner.poll_interval, "Starting manifest watcher");

        let task = handle.spawn(
            Arc::clone(&self.inner)
                .run(generation, cancel)
                .instrument(self.span.clone()),
        );
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(task);
        }
        Ok(())
    }

    /// Ask the poll loop to exit.
    ///
    /// Returns immediately; an in-flight fetch, publish or sleep is not
    /// interrupted. Use [`Self::join`] to wait for the loop to finish.
    pub fn stop(&self) -> Result<(), WatcherError> {
        self.inner.active.store(0, Ordering::Release);
        self.span.in_scope(|| info!("Stopping manifest watcher"));
        Ok(())
    }

    /// Wait for the most recently started poll loop to exit
    pub async fn join(&self) {
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                self.span.in_scope(|| warn!("Manifest poll loop failed: {}", err));
            }
        }
    }

    /// The update channel's read end
    pub fn subscribe(&self) -> ManifestUpdates<M> {
        self.updates.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::error::SourceError;
    use crate::manifest::Manifest;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(150);
    const INTERVAL: Duration = Duration::from_millis(5);

    /// Replays a fixed script of fetch results, then reports nothing
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Option<Manifest>, SourceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Option<Manifest>, SourceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ManifestSource<Manifest> for ScriptedSource {
        async fn get_manifest(&self, _cancel: &CancellationToken) -> Result<Option<Manifest>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    /// Returns a new valid manifest on every call
    struct EverChangingSource {
        version: AtomicU64,
    }

    #[async_trait]
    impl ManifestSource<Manifest> for EverChangingSource {
        async fn get_manifest(&self, _cancel: &CancellationToken) -> Result<Option<Manifest>, SourceError> {
            Ok(Some(manifest(self.version.fetch_add(1, Ordering::SeqCst))))
        }
    }

    fn manifest(version: u64) -> Manifest {
        Manifest {
            protocol_version: version,
            initial_power_table: Some(PowerTableCid::new("bafyfetched")),
            ..Manifest::default()
        }
    }

    fn invalid_manifest() -> Manifest {
        Manifest {
            network_name: String::new(),
            ..manifest(99)
        }
    }

    async fn next(updates: &ManifestUpdates<Manifest>) -> Manifest {
        tokio::time::timeout(WAIT, updates.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update channel closed")
    }

    async fn assert_quiet(updates: &ManifestUpdates<Manifest>) {
        let res = tokio::time::timeout(QUIET, updates.recv()).await;
        assert!(res.is_err(), "unexpected update: {:?}", res);
    }

    #[tokio::test]
    async fn test_start_twice_runs_one_loop() {
        let source = ScriptedSource::new(vec![Ok(Some(manifest(1)))]);
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, source);
        let updates = watcher.subscribe();
        let cancel = CancellationToken::new();

        watcher.start(cancel.clone()).unwrap();
        watcher.start(cancel.clone()).unwrap();
        assert!(watcher.is_running());
        assert_eq!(watcher.inner.generations.load(Ordering::SeqCst), 1);
        assert!(watcher.inner.is_live(1));

        assert_eq!(next(&updates).await, manifest(1));
        assert_quiet(&updates).await;

        cancel.cancel();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_publishes_each_distinct_manifest_once() {
        let source = ScriptedSource::new(vec![
            Ok(Some(manifest(1))),
            Ok(Some(manifest(1))),
            Ok(Some(manifest(2))),
        ]);
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, source);
        let updates = watcher.subscribe();
        watcher.start(CancellationToken::new()).unwrap();

        assert_eq!(next(&updates).await, manifest(1));
        assert_eq!(next(&updates).await, manifest(2));
        assert_quiet(&updates).await;
        assert_eq!(watcher.current().await, Some(manifest(2)));

        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_never_published() {
        let source = ScriptedSource::new(vec![
            Ok(Some(invalid_manifest())),
            Ok(Some(manifest(1))),
            Ok(Some(invalid_manifest())),
        ]);
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, source);
        let updates = watcher.subscribe();
        watcher.start(CancellationToken::new()).unwrap();

        assert_eq!(next(&updates).await, manifest(1));
        assert_quiet(&updates).await;
        assert_eq!(watcher.current().await, Some(manifest(1)));

        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_manifest() {
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, ScriptedSource::new(vec![]));
        let updates = watcher.subscribe();

        watcher.apply(invalid_manifest()).await;
        assert!(watcher.current().await.is_none());
        assert!(updates.try_recv().is_none());

        let (_, received) = tokio::join!(watcher.apply(manifest(3)), updates.recv());
        assert_eq!(received, Some(manifest(3)));
        assert_eq!(watcher.current().await, Some(manifest(3)));
    }

    #[tokio::test]
    async fn test_abandoned_apply_leaves_manifest_queued() {
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, ScriptedSource::new(vec![]));
        let updates = watcher.subscribe();

        let res = tokio::time::timeout(QUIET, watcher.apply(manifest(7))).await;
        assert!(res.is_err());
        assert_eq!(watcher.current().await, Some(manifest(7)));
        assert_eq!(updates.try_recv(), Some(manifest(7)));
        assert!(updates.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fallback_fills_undefined_power_table() {
        let seed = Manifest {
            initial_power_table: Some(PowerTableCid::new("bafyseed")),
            ..Manifest::default()
        };
        let missing = Manifest {
            initial_power_table: None,
            ..manifest(1)
        };
        let source = ScriptedSource::new(vec![Ok(Some(missing)), Ok(Some(manifest(2)))]);
        let watcher = ManifestWatcher::with_poll_interval(Some(&seed), INTERVAL, source);
        assert_eq!(watcher.fallback_initial_power_table(), Some(&PowerTableCid::new("bafyseed")));

        let updates = watcher.subscribe();
        watcher.start(CancellationToken::new()).unwrap();

        let filled = next(&updates).await;
        assert_eq!(filled.initial_power_table, Some(PowerTableCid::new("bafyseed")));
        assert_eq!(filled.protocol_version, 1);

        let untouched = next(&updates).await;
        assert_eq!(untouched.initial_power_table, Some(PowerTableCid::new("bafyfetched")));

        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_seed_without_power_table_leaves_fallback_undefined() {
        let seed = Manifest::default();
        let missing = Manifest {
            initial_power_table: None,
            ..manifest(1)
        };
        let source = ScriptedSource::new(vec![Ok(Some(missing))]);
        let watcher = ManifestWatcher::new(Some(&seed), 0, source);
        assert!(watcher.fallback_initial_power_table().is_none());
        assert_eq!(watcher.poll_interval(), Duration::ZERO);

        let updates = watcher.subscribe();
        watcher.start(CancellationToken::new()).unwrap();
        assert!(next(&updates).await.initial_power_table.is_none());

        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_stop_halts_future_updates() {
        let source = EverChangingSource {
            version: AtomicU64::new(1),
        };
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, source);
        let updates = watcher.subscribe();
        watcher.start(CancellationToken::new()).unwrap();

        assert_eq!(next(&updates).await.protocol_version, 1);
        watcher.stop().unwrap();
        assert!(!watcher.is_running());

        // One iteration may already be in flight.
        let _ = tokio::time::timeout(QUIET, updates.recv()).await;
        assert_quiet(&updates).await;

        tokio::time::timeout(WAIT, watcher.join()).await.expect("loop did not exit");
    }

    #[tokio::test]
    async fn test_fetch_error_does_not_end_loop() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "node down",
            ))),
            Ok(None),
            Ok(Some(manifest(1))),
        ]);
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, source);
        let updates = watcher.subscribe();
        watcher.start(CancellationToken::new()).unwrap();

        assert_eq!(next(&updates).await, manifest(1));
        assert!(watcher.inner.source.calls.load(Ordering::SeqCst) >= 3);

        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_cancellation_ends_loop() {
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, ScriptedSource::new(vec![]));
        let cancel = CancellationToken::new();
        watcher.start(cancel.clone()).unwrap();

        cancel.cancel();
        tokio::time::timeout(WAIT, watcher.join()).await.expect("loop did not exit");
        assert!(!watcher.is_running());

        // Cancelled watchers can be started again with a fresh token.
        watcher.start(CancellationToken::new()).unwrap();
        assert!(watcher.is_running());
        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop_keeps_one_loop() {
        let source = ScriptedSource::new(vec![]);
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, source);
        let updates = watcher.subscribe();

        watcher.start(CancellationToken::new()).unwrap();
        watcher.stop().unwrap();
        watcher.start(CancellationToken::new()).unwrap();
        assert_eq!(watcher.inner.generations.load(Ordering::SeqCst), 2);
        assert!(!watcher.inner.is_live(1));
        assert!(watcher.inner.is_live(2));

        let (_, received) = tokio::join!(watcher.apply(manifest(5)), updates.recv());
        assert_eq!(received, Some(manifest(5)));

        watcher.stop().unwrap();
        watcher.join().await;
    }

    #[test]
    fn test_start_without_runtime() {
        let watcher = ManifestWatcher::with_poll_interval(None, INTERVAL, ScriptedSource::new(vec![]));
        assert!(matches!(
            watcher.start(CancellationToken::new()),
            Err(WatcherError::NoRuntime)
        ));
        assert!(!watcher.is_running());
    }
}
