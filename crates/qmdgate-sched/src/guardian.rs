//! Sidecar guardian.
//!
//! Periodically probes the backend sidecar's health endpoint. A failing
//! sidecar is restarted (stop, start, verify) up to a bounded number of
//! times; past that, the gateway drops to CLI-only mode until the sidecar
//! recovers on its own. The guardian is the only process-supervision hook
//! the gateway has.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use qmdgate_core::{Capability, Error, Executor, HealthLevel, Result};

/// Guardian cadence and restart budget.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub check_interval: Duration,
    pub timeout: Duration,
    pub restart_max_retries: u32,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            restart_max_retries: 3,
        }
    }
}

#[derive(Default)]
struct State {
    health: Option<HealthLevel>,
    last_check: Option<DateTime<Utc>>,
    last_healthy: Option<DateTime<Utc>>,
    fail_count: u32,
    restart_count: u32,
    cli_mode: bool,
}

pub struct Guardian {
    cfg: GuardianConfig,
    exec: Arc<dyn Executor>,
    state: Mutex<State>,
}

impl Guardian {
    pub fn new(cfg: GuardianConfig, exec: Arc<dyn Executor>) -> Self {
        Self {
            cfg,
            exec,
            state: Mutex::new(State::default()),
        }
    }

    /// Begin periodic health checking. Returns `None` (after marking CLI
    /// mode) when the backend has no sidecar capability at all.
    pub async fn start(guardian: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !guardian.exec.has_capability(Capability::Sidecar) {
            warn!("sidecar not available, guardian disabled, using CLI mode only");
            let mut state = guardian.state.lock().unwrap();
            state.cli_mode = true;
            state.health = Some(HealthLevel::Degraded);
            return None;
        }

        if let Err(err) = guardian.probe().await {
            warn!(%err, "sidecar not healthy on startup, attempting start");
            if let Err(err) = guardian.start_sidecar().await {
                error!(%err, "failed to start sidecar daemon");
                let mut state = guardian.state.lock().unwrap();
                state.cli_mode = true;
                state.health = Some(HealthLevel::Degraded);
            }
        }

        let guardian = Arc::clone(guardian);
        info!(interval = ?guardian.cfg.check_interval, "guardian started");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(guardian.cfg.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Guardian::check(&guardian).await;
            }
        }))
    }

    /// Current health plus a human-readable message for the heartbeat.
    pub fn health(&self) -> (HealthLevel, String) {
        let state = self.state.lock().unwrap();
        let mut msg = String::new();
        if state.cli_mode {
            msg = "sidecar unavailable, using CLI fallback".to_string();
        }
        if state.fail_count > 0 {
            msg = format!("sidecar health check failed {} times", state.fail_count);
        }
        (state.health.unwrap_or(HealthLevel::Healthy), msg)
    }

    pub fn is_cli_mode(&self) -> bool {
        self.state.lock().unwrap().cli_mode
    }

    /// Admin entry: restart the sidecar now.
    pub async fn restart_sidecar(&self) -> Result<()> {
        info!("manual sidecar restart requested");
        self.do_restart().await
    }

    async fn probe(&self) -> Result<()> {
        timeout(self.cfg.timeout, self.exec.sidecar_health())
            .await
            .map_err(|_| Error::DeadlineExceeded("sidecar health check".to_string()))?
    }

    async fn check(guardian: &Arc<Self>) {
        let result = guardian.probe().await;

        let mut state = guardian.state.lock().unwrap();
        state.last_check = Some(Utc::now());

        match result {
            Ok(()) => {
                if state.fail_count > 0 || state.cli_mode {
                    info!("sidecar daemon recovered");
                }
                state.health = Some(HealthLevel::Healthy);
                state.last_healthy = Some(Utc::now());
                state.fail_count = 0;
                state.cli_mode = false;
            }
            Err(err) => {
                state.fail_count += 1;
                warn!(fail_count = state.fail_count, %err, "sidecar health check failed");

                if state.fail_count >= guardian.cfg.restart_max_retries {
                    error!(
                        fail_count = state.fail_count,
                        max_retries = guardian.cfg.restart_max_retries,
                        "sidecar daemon unrecoverable, switching to CLI mode"
                    );
                    state.health = Some(HealthLevel::Degraded);
                    state.cli_mode = true;
                    state.fail_count = 0;
                    return;
                }

                state.health = Some(HealthLevel::Unhealthy);
                drop(state);

                let guardian = Arc::clone(guardian);
                tokio::spawn(async move {
                    if let Err(err) = guardian.do_restart().await {
                        error!(%err, "sidecar restart failed");
                    }
                });
            }
        }
    }

    async fn start_sidecar(&self) -> Result<()> {
        self.exec.sidecar_start().await?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        self.probe()
            .await
            .map_err(|err| Error::Unavailable(format!("sidecar started but not healthy: {err}")))?;

        {
            let mut state = self.state.lock().unwrap();
            state.health = Some(HealthLevel::Healthy);
            state.last_healthy = Some(Utc::now());
            state.cli_mode = false;
        }
        info!("sidecar daemon started successfully");
        Ok(())
    }

    async fn do_restart(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.restart_count += 1;
        }
        info!("restarting sidecar daemon");

        let _ = self.exec.sidecar_stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start_sidecar().await
    }
}
