use std::time::Duration;

use chrono::Utc;
use fleet_core::config::Config;
use fleet_core::store::FleetStore;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cycle::{CycleReport, SweepCycle};

/// Cloneable stop switch for a running [`Daemon`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Ask the daemon to stop after the sweep in flight, if any.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Runs the sweep cycle on a fixed interval until shut down.
pub struct Daemon {
    cycle: SweepCycle,
    interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(cycle: SweepCycle, interval: Duration) -> Self {
        Self {
            cycle,
            interval,
            shutdown: watch::channel(false).0,
        }
    }

    pub fn from_config(cfg: &Config, store: FleetStore) -> Self {
        Self::new(
            SweepCycle::from_config(cfg, store),
            Duration::from_secs(cfg.daemon.sweep_interval_secs.max(1)),
        )
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// One cycle at the current time.
    pub async fn run_once(&self) -> fleet_core::error::Result<CycleReport> {
        self.cycle.run_once(Utc::now()).await
    }

    /// One cycle, then every notification retry it queued.
    pub async fn run_once_settled(&self) -> fleet_core::error::Result<CycleReport> {
        let mut report = self.run_once().await?;
        self.cycle.settle(&mut report).await;
        Ok(report)
    }

    /// Sweep immediately, then on every tick until a [`ShutdownHandle`]
    /// fires. A failed cycle is logged and the loop carries on.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        // the first tick completes immediately; the initial sweep covers it
        ticker.tick().await;
        let mut stop = self.shutdown.subscribe();

        info!(interval_secs = self.interval.as_secs(), "fleet daemon started");
        if !*stop.borrow_and_update() {
            self.sweep().await;
        }

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = stop.changed() => {}
            }
        }
        info!("fleet daemon stopped");
    }

    async fn sweep(&self) {
        match self.run_once().await {
            Ok(report) => info!(
                exit_code = report.exit_code(),
                notifications_sent = report.notifications.sent,
                "cycle completed"
            ),
            Err(e) => error!(error = %e, "cycle failed"),
        }
    }
}
