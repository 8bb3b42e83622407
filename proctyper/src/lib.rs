pub mod discovery;
pub mod settings;
pub mod telemetry;
pub mod tracker;
pub mod typer;

use std::{collections::HashMap, future::Future, sync::Arc};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use proctyper_common::RuntimeKind;
use tokio::{signal, task::JoinSet};

use crate::discovery::{ProcessDelta, ProcessWatcher};
use crate::settings::{Settings, TrackerConfig};
use crate::tracker::PortTracker;
use crate::typer::{ClassificationResult, ExecutableInfo, Typer, inspect::ElfInspector};

/// Agent loop: discovers processes, classifies their executables and tracks
/// the remote ports of the instrumentable ones.
pub struct TyperEngine {
    pub settings: Settings,
    typer: Arc<Typer>,
    tracker: Arc<PortTracker>,
    tracker_config: TrackerConfig,
    watcher: ProcessWatcher,
    /// Runtime of every live process that can be instrumented.
    instrumentable: HashMap<u32, RuntimeKind>,
}

impl TyperEngine {
    pub fn new(settings: Settings) -> Result<Self> {
        let typer_config = settings
            .typer_config()
            .context("Invalid classifier configuration")?;
        let tracker_config = settings
            .tracker_config()
            .context("Invalid tracker configuration")?;

        info!(
            "Classification cache: {} entries, {} concurrent inspections",
            typer_config.cache_size, typer_config.max_concurrent_inspections
        );

        let inspector = Arc::new(ElfInspector::new(&typer_config));
        let typer = Arc::new(Typer::new(&typer_config, inspector));
        let tracker = Arc::new(PortTracker::new(tracker_config.max_values_per_owner));

        Ok(Self {
            settings,
            typer,
            tracker,
            tracker_config,
            watcher: ProcessWatcher::new(),
            instrumentable: HashMap::new(),
        })
    }

    pub fn typer(&self) -> &Arc<Typer> {
        &self.typer
    }

    pub fn tracker(&self) -> &Arc<PortTracker> {
        &self.tracker
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    /// Scans on every poll tick until `shutdown` resolves.
    ///
    /// `shutdown` is polled across iterations, so a signal that arrives while a
    /// scan is running is seen as soon as the scan finishes.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.poll_interval());
        tokio::pin!(shutdown);

        info!("Monitoring active. Press Ctrl-C to exit.");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!("Process scan failed: {:#}", e);
                    }
                }
            }
        }
        info!("Exiting...");
        self.typer.shutdown();

        Ok(())
    }

    /// One discovery round: classify new processes, forget exited ones and
    /// record the ports of instrumentable ones.
    pub async fn scan_once(&mut self) -> Result<()> {
        let mut watcher = std::mem::take(&mut self.watcher);
        let (watcher, delta) = tokio::task::spawn_blocking(move || {
            let delta = watcher.poll();
            (watcher, delta)
        })
        .await
        .context("Process scan task failed")?;
        self.watcher = watcher;
        let delta = delta?;

        self.apply_delta(delta).await;
        self.observe_ports().await?;

        let idle = self.tracker.evict_idle(self.tracker_config.idle_owner_ttl);
        if idle > 0 {
            debug!("Evicted {} idle tracker owners", idle);
        }
        telemetry::record_gauges(self.typer.limiter().in_flight(), self.tracker.owners());
        Ok(())
    }

    async fn apply_delta(&mut self, delta: ProcessDelta) {
        for pid in delta.exited {
            self.instrumentable.remove(&pid);
            self.tracker.remove_owner(pid);
        }

        let mut tasks = JoinSet::new();
        for pid in delta.started {
            let typer = Arc::clone(&self.typer);
            tasks.spawn(async move {
                let exe = match resolve_executable(pid).await {
                    Ok(exe) => exe,
                    Err(e) => {
                        // usually a process that exited before we looked at it
                        debug!("Skipping PID {}: {:#}", pid, e);
                        return None;
                    }
                };
                let result = typer.classify(&exe).await;
                log_classification(pid, &exe.exe_path.display().to_string(), &result);
                Some((pid, result))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((pid, result))) if result.instrumentable() => {
                    self.instrumentable.insert(pid, result.kind);
                }
                Ok(_) => {}
                Err(e) => warn!("Classification task failed: {}", e),
            }
        }
    }

    async fn observe_ports(&self) -> Result<()> {
        let pids: Vec<u32> = self.instrumentable.keys().copied().collect();
        let tracker = Arc::clone(&self.tracker);

        tokio::task::spawn_blocking(move || {
            for pid in pids {
                match discovery::remote_ports_for_pid(pid) {
                    Ok(ports) => {
                        for port in ports {
                            tracker.add(pid, port);
                        }
                    }
                    Err(e) => debug!("Failed to read sockets of PID {}: {:#}", pid, e),
                }
            }
        })
        .await
        .context("Port observation task failed")
    }

    /// Classifies a single process on demand.
    pub async fn classify_pid(&self, pid: u32) -> Result<Arc<ClassificationResult>> {
        let exe = resolve_executable(pid).await?;
        let result = self.typer.classify(&exe).await;
        log_classification(pid, &exe.exe_path.display().to_string(), &result);
        Ok(result)
    }
}

/// Reads a process's executable descriptor from procfs off the async workers.
async fn resolve_executable(pid: u32) -> Result<ExecutableInfo> {
    tokio::task::spawn_blocking(move || discovery::executable_for_pid(pid))
        .await
        .context("Executable lookup task failed")?
}

fn log_classification(pid: u32, path: &str, result: &ClassificationResult) {
    match &result.error {
        Some(reason) => debug!("PID {} ({}) not instrumentable: {}", pid, path, reason),
        None => info!(
            "PID {} ({}) classified as {} ({} offsets)",
            pid,
            path,
            result.kind.as_str(),
            result.offsets.map(|o| o.len()).unwrap_or(0)
        ),
    }
}
