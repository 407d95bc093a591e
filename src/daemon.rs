//! Daemon orchestration: wires the probe, merger, transport, filter, job
//! queue and commit timers together, one long-lived `tokio`
//! task per role connected by channels, joined on a shared shutdown
//! broadcast.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::event::merge::KernelMerger;
use crate::event::FsEvent;
use crate::filter::Filter;
use crate::index::lifecycle::LifecycleState;
use crate::index::IndexHandle;
use crate::jobqueue::JobQueue;
use crate::mount::{self, OverlayAllowlist, OverlayDeviceSet, PartitionTable};
use crate::transport::{self, Channel};

const MERGE_MEMORY_LIMIT: usize = 32 * 1024 * 1024;
const RENAME_PAIR_MAX_AGE: Duration = Duration::from_secs(5);
const MERGE_DRAIN_INTERVAL: Duration = Duration::from_millis(200);
const SYSFS_OVERLAY_ATTRIBUTE: &str = "/sys/module/deepin_anything/parameters/vfs_unnamed_devices";

pub struct Daemon {
    config: Arc<StdRwLock<Config>>,
    config_path: PathBuf,
    persistent_dir: PathBuf,
    index: IndexHandle,
    mounts: Arc<RwLock<PartitionTable>>,
    queue: JobQueue,
    overlay_devices: OverlayDeviceSet,
    overlay_allowlist: Arc<dyn OverlayAllowlist>,
}

impl Daemon {
    pub async fn new(config: Config, config_path: PathBuf, volatile_dir: PathBuf, persistent_dir: PathBuf) -> Result<Self> {
        let index = IndexHandle::open_with_persistent(&volatile_dir, &persistent_dir, config.clone())?;
        let mounts = Arc::new(RwLock::new(PartitionTable::new()));
        if let Ok(text) = tokio::fs::read_to_string("/proc/self/mountinfo").await {
            mounts.write().await.rebuild(&text).await;
        } else {
            warn!("could not read /proc/self/mountinfo, starting with an empty mount table");
        }
        let queue = JobQueue::new(4096);
        let overlay_devices: OverlayDeviceSet = Arc::new(StdRwLock::new(HashSet::new()));
        let overlay_allowlist: Arc<dyn OverlayAllowlist> =
            Arc::from(mount::detect_overlay_allowlist(std::path::Path::new(SYSFS_OVERLAY_ATTRIBUTE)).await);
        let config = Arc::new(StdRwLock::new(config));
        Ok(Self { config, config_path, persistent_dir, index, mounts, queue, overlay_devices, overlay_allowlist })
    }

    /// Runs until `shutdown` resolves (typically Ctrl-C). Never returns
    /// `Ok` early; a `Fatal` error from any foundational task propagates
    /// here and to `main`.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        self.index.set_lifecycle_state(LifecycleState::Loading)?;

        let worker_count = crate::config::worker_pool_size();
        self.queue.spawn_workers(worker_count, self.index.clone());
        info!(workers = worker_count, "job workers started");

        // Opt the current overlay devices in before the first scan so any
        // long-filename-overlay events during startup aren't dropped.
        sync_overlay_allowlist(&self.mounts, &self.config, &self.overlay_devices, &self.overlay_allowlist).await;

        self.index.set_lifecycle_state(LifecycleState::Scanning)?;
        let roots = self.config.read().expect("config lock poisoned").indexing_paths.clone();
        for root in &roots {
            self.queue.queue_scan(root.clone()).await;
        }

        let (probe_tx, probe_rx) = mpsc::unbounded_channel::<FsEvent>();
        let _watcher = crate::probe::spawn_watcher(&roots, probe_tx)
            .map_err(|e| crate::error::Error::Fatal(format!("failed to start filesystem watcher: {e}")))?;

        let (channel, channel_rx) = Channel::new(4096);

        tokio::spawn(merge_task(probe_rx, channel, shutdown.resubscribe()));
        tokio::spawn(filter_task(
            channel_rx,
            self.config.clone(),
            self.overlay_devices.clone(),
            self.mounts.clone(),
            self.queue.clone(),
            shutdown.resubscribe(),
        ));
        tokio::spawn(crate::jobqueue::run_commit_timers(
            self.config.read().expect("config lock poisoned").clone(),
            self.index.clone(),
            shutdown.resubscribe(),
        ));
        tokio::spawn(mount_refresh_task(
            self.mounts.clone(),
            self.config.clone(),
            self.overlay_devices.clone(),
            self.overlay_allowlist.clone(),
            shutdown.resubscribe(),
        ));
        tokio::spawn(config_reload_task(
            self.config.clone(),
            self.config_path.clone(),
            self.index.clone(),
            self.queue.clone(),
            shutdown.resubscribe(),
        ));

        self.index.set_lifecycle_state(LifecycleState::Monitoring)?;

        shutdown.recv().await.ok();
        info!("daemon shutting down");
        self.queue.stop_scanning.store(true, Ordering::Relaxed);
        self.index.shutdown(&self.persistent_dir).await?;
        Ok(())
    }
}

const MOUNT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Re-reads `/proc/self/mountinfo` on a timer. A real kernel probe would
/// rebuild the partition table synchronously from `Action::Mount`/
/// `Action::Unmount` events; `notify` cannot observe mount namespace
/// changes, so this is the pragmatic equivalent.
async fn mount_refresh_task(
    mounts: Arc<RwLock<PartitionTable>>,
    config: Arc<StdRwLock<Config>>,
    overlay_devices: OverlayDeviceSet,
    overlay_allowlist: Arc<dyn OverlayAllowlist>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(MOUNT_REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tokio::fs::read_to_string("/proc/self/mountinfo").await {
                    Ok(text) => {
                        mounts.write().await.rebuild(&text).await;
                        sync_overlay_allowlist(&mounts, &config, &overlay_devices, overlay_allowlist.as_ref()).await;
                    }
                    Err(e) => warn!(error = %e, "failed to refresh mount table"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Rewrites the kernel-side long-filename overlay allowlist to match the
/// overlay devices currently mounted under an in-scope indexing root, and
/// updates the local mirror [`OverlayDeviceSet`] the filter consults.
async fn sync_overlay_allowlist(
    mounts: &Arc<RwLock<PartitionTable>>,
    config: &Arc<StdRwLock<Config>>,
    overlay_devices: &OverlayDeviceSet,
    allowlist: &dyn OverlayAllowlist,
) {
    let indexing_paths = config.read().expect("config lock poisoned").indexing_paths.clone();
    let desired = mounts.read().await.overlay_devices_in_scope(&indexing_paths);

    let previous = overlay_devices.read().expect("overlay device set poisoned").clone();
    for device in desired.difference(&previous) {
        if let Err(e) = allowlist.allow(*device).await {
            error!(device = ?device, error = %e, "failed to opt overlay device into allowlist");
        }
    }
    for device in previous.difference(&desired) {
        if let Err(e) = allowlist.deny(*device).await {
            error!(device = ?device, error = %e, "failed to opt overlay device out of allowlist");
        }
    }
    *overlay_devices.write().expect("overlay device set poisoned") = desired;
}

async fn merge_task(mut probe_rx: mpsc::UnboundedReceiver<FsEvent>, channel: Arc<Channel>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut merger = KernelMerger::new(MERGE_MEMORY_LIMIT);
    let mut ticker = tokio::time::interval(MERGE_DRAIN_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = probe_rx.recv() => {
                merger.observe(event);
            }
            _ = ticker.tick() => {
                merger.age_out_pending_renames(RENAME_PAIR_MAX_AGE);
                for event in merger.drain(1024) {
                    let messages = match transport::split_for_wire(&event) {
                        Ok(messages) => messages,
                        Err(e) => {
                            error!(error = %e, "failed to encode event for transport");
                            continue;
                        }
                    };
                    for message in messages {
                        if let Err(e) = channel.send(&message) {
                            error!(error = %e, "failed to send event on transport channel");
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("merge task shutting down");
                break;
            }
        }
    }
}

async fn filter_task(
    mut channel_rx: transport::ChannelReceiver,
    config: Arc<StdRwLock<Config>>,
    overlay_devices: OverlayDeviceSet,
    mounts: Arc<RwLock<PartitionTable>>,
    queue: JobQueue,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let filter = Filter::new(config, overlay_devices);
    loop {
        tokio::select! {
            message = channel_rx.recv() => {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        error!(error = %e, "transport receive failed, stopping filter task");
                        break;
                    }
                };
                let Ok(raw) = transport::message_to_raw_event(&message) else {
                    warn!("dropping undecodable transport message");
                    continue;
                };
                let table = mounts.read().await;
                for job in filter.observe(raw, &table) {
                    queue.push(job).await;
                }
            }
            _ = shutdown.recv() => {
                info!("filter task shutting down");
                break;
            }
        }
    }
}

/// Listens for `SIGHUP` and reloads the configuration file in place,
/// cancelling any in-flight scan, refreshing the index against the new
/// blacklist/scope, and enqueuing scans for newly-configured roots (spec
/// §4.C6 "configuration reload").
async fn config_reload_task(
    config: Arc<StdRwLock<Config>>,
    config_path: PathBuf,
    index: IndexHandle,
    queue: JobQueue,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGHUP handling unavailable, configuration reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(path = %config_path.display(), "reloading configuration");
                let new_config = match Config::load(&config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to reload configuration, keeping previous settings");
                        continue;
                    }
                };

                queue.stop_scanning.store(true, Ordering::Relaxed);
                let new_roots = new_config.indexing_paths.clone();
                let snapshot = new_config.clone();
                *config.write().expect("config lock poisoned") = new_config;
                queue.stop_scanning.store(false, Ordering::Relaxed);

                match index.refresh_indexes(&snapshot).await {
                    Ok(changed) => info!(changed, "refreshed index after configuration reload"),
                    Err(e) => error!(error = %e, "index refresh after configuration reload failed"),
                }
                for root in new_roots {
                    queue.queue_scan(root).await;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
