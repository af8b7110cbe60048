//! Autosleep: stop idle environments, then the VM once nothing is left.
//!
//! The scheduler polls state on a fixed interval. Each cycle reads state
//! without the lock, stops every idle environment (committing each stop in
//! its own session), then re-reads and decides whether the VM can go.
//!
//! ## Example
//!
//! ```ignore
//! use drowse_core::{Autosleep, Lifecycle, Settings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(lifecycle: Lifecycle, settings: Settings) -> drowse_core::Result<()> {
//! let autosleep = Autosleep::new(lifecycle, settings.autosleep);
//! let shutdown = CancellationToken::new();
//!
//! // Runs until the token is cancelled or SIGINT/SIGTERM arrives.
//! autosleep.run(shutdown).await?;
//!
//! println!("stopped {} environments", autosleep.stats().environments_stopped());
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::idle::{format_idle, idle_duration, IdlePolicy};
use crate::lifecycle::Lifecycle;
use crate::settings::AutosleepSettings;
use crate::state::Status;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Statistics
// ============================================================================

/// Scheduler counters.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct AutosleepStats {
    /// Cycles run.
    pub cycles: AtomicU64,
    /// Environments stopped for being idle.
    pub environments_stopped: AtomicU64,
    /// Stops that failed (backend error or lock contention).
    pub stop_failures: AtomicU64,
    /// Times the VM was stopped.
    pub vm_stops: AtomicU64,
}

impl AutosleepStats {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn environments_stopped(&self) -> u64 {
        self.environments_stopped.load(Ordering::Relaxed)
    }

    pub fn stop_failures(&self) -> u64 {
        self.stop_failures.load(Ordering::Relaxed)
    }

    pub fn vm_stops(&self) -> u64 {
        self.vm_stops.load(Ordering::Relaxed)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Environments stopped this cycle.
    pub stopped: Vec<String>,
    /// Environments whose stop failed.
    pub failed: Vec<String>,
    /// Whether the VM was stopped.
    pub vm_stopped: bool,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Idle scheduler.
pub struct Autosleep {
    lifecycle: Lifecycle,
    settings: AutosleepSettings,
    stats: Arc<AutosleepStats>,
}

impl Autosleep {
    pub fn new(lifecycle: Lifecycle, settings: AutosleepSettings) -> Self {
        Self {
            lifecycle,
            settings,
            stats: Arc::new(AutosleepStats::default()),
        }
    }

    pub fn stats(&self) -> &AutosleepStats {
        &self.stats
    }

    pub fn settings(&self) -> &AutosleepSettings {
        &self.settings
    }

    /// Run cycles until `shutdown` is cancelled or the process is asked to
    /// terminate. The first cycle runs immediately.
    ///
    /// A cycle already in progress is allowed to finish; no new one starts.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.settings.validate()?;
        tracing::info!(
            container_timeout = %humantime::format_duration(self.settings.container_timeout),
            vm_timeout = %humantime::format_duration(self.settings.vm_timeout),
            poll_interval = %humantime::format_duration(self.settings.poll_interval),
            stop_vm = self.settings.stop_vm,
            "Autosleep started"
        );

        let watcher = shutdown.clone();
        let signals = tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => {
                    tracing::info!("Autosleep received shutdown signal");
                    watcher.cancel();
                }
                _ = watcher.cancelled() => {}
            }
        });

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.stopped.is_empty() || !report.failed.is_empty() || report.vm_stopped {
                        tracing::info!(
                            stopped = report.stopped.len(),
                            failed = report.failed.len(),
                            vm_stopped = report.vm_stopped,
                            "Autosleep cycle finished"
                        );
                    }
                }
            }
        }

        signals.abort();
        tracing::info!(cycles = self.stats.cycles(), "Autosleep stopped");
        Ok(())
    }

    /// Run one cycle.
    pub async fn tick(&self) -> TickReport {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport::default();
        let policy = self.settings.policy();

        let doc = match self.lifecycle.store().read_only() {
            Ok(loaded) => loaded.document,
            Err(e) => {
                tracing::warn!(error = %e, "Autosleep could not read state, skipping cycle");
                return report;
            }
        };

        let now = self.lifecycle.now();
        let idle = policy.idle_environments(&doc, now);
        tracing::debug!(candidates = idle.len(), "Autosleep cycle");

        for name in idle {
            match self.sleep_environment(&name, &policy).await {
                Ok(true) => {
                    self.stats
                        .environments_stopped
                        .fetch_add(1, Ordering::Relaxed);
                    report.stopped.push(name);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(env = %name, error = %e, "Failed to stop idle environment");
                    self.stats.stop_failures.fetch_add(1, Ordering::Relaxed);
                    report.failed.push(name);
                }
            }
        }

        if self.settings.stop_vm {
            match self.sleep_vm(&policy).await {
                Ok(stopped) => report.vm_stopped = stopped,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to stop idle VM");
                    self.stats.stop_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        report
    }

    /// Stop `name` if it is still idle. Returns whether it was stopped.
    ///
    /// The VM's activity stamp is left alone so its own timeout keeps
    /// counting from the last real use.
    async fn sleep_environment(&self, name: &str, policy: &IdlePolicy) -> Result<bool> {
        let now = self.lifecycle.now();
        let loaded = self.lifecycle.store().read_only()?;
        let Some(env) = loaded.document.environment(name) else {
            return Ok(false);
        };
        if !policy.environment_is_idle(env, now) {
            tracing::debug!(env = %name, "Environment became active, skipping");
            return Ok(false);
        }

        tracing::info!(
            env = %name,
            idle = %format_idle(idle_duration(env.last_active, now)),
            "Stopping idle environment"
        );
        self.lifecycle.stop_container(name).await?;
        self.lifecycle.store().with_exclusive_session(|doc| {
            if doc.environment(name).is_some() {
                doc.update_environment_status(name, Status::Stopped)?;
            }
            Ok(())
        })?;
        Ok(true)
    }

    /// Stop the VM if a running one exists and it is idle.
    async fn sleep_vm(&self, policy: &IdlePolicy) -> Result<bool> {
        let now = self.lifecycle.now();
        let doc = self.lifecycle.store().read_only()?.document;
        let Some(vm) = doc.vm() else {
            return Ok(false);
        };
        if vm.status != Status::Running || !policy.vm_is_idle(&doc, now) {
            return Ok(false);
        }

        tracing::info!(
            idle = %format_idle(idle_duration(vm.last_active, now)),
            "Stopping idle VM"
        );
        self.lifecycle.stop_vm().await?;
        self.stats.vm_stops.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
