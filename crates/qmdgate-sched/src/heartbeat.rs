//! Component heartbeat.
//!
//! Named checkers run on a fixed cadence; the worst component level becomes
//! the overall health, and level transitions are logged once. The health
//! RPC reads the tracker's latest snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use qmdgate_core::{Capability, ComponentHealth, Executor, HealthLevel, SystemHealth};

/// A named component probe: level plus a human-readable message.
pub type CheckFuture = Pin<Box<dyn Future<Output = (HealthLevel, String)> + Send>>;
pub type ComponentChecker = Box<dyn Fn() -> CheckFuture + Send + Sync>;

pub struct Heartbeat {
    checkers: Vec<(String, ComponentChecker)>,
    tracker: Arc<SystemHealthTracker>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            checkers: Vec::new(),
            tracker: Arc::new(SystemHealthTracker::new()),
            interval,
        }
    }

    /// Register a checker before `start`.
    pub fn register(&mut self, name: &str, checker: ComponentChecker) {
        self.checkers.push((name.to_string(), checker));
    }

    pub fn tracker(&self) -> Arc<SystemHealthTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run all checks once immediately, then on every tick.
    pub fn start(self) -> JoinHandle<()> {
        info!(interval = ?self.interval, components = self.checkers.len(), "heartbeat started");
        tokio::spawn(async move {
            self.run_checks().await;

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_checks().await;
            }
        })
    }

    async fn run_checks(&self) {
        for (name, checker) in &self.checkers {
            let (level, msg) = checker().await;
            let prev = self.tracker.component_level(name);
            self.tracker.update(name, level, &msg);
            if prev != level {
                log_transition(name, prev, level, &msg);
            }
        }
    }
}

fn log_transition(name: &str, from: HealthLevel, to: HealthLevel, msg: &str) {
    match to {
        HealthLevel::Healthy if from > HealthLevel::Healthy => {
            info!(component = name, from = from.as_str(), "component recovered");
        }
        HealthLevel::Critical => error!(component = name, message = msg, "component critical"),
        HealthLevel::Unhealthy => error!(component = name, message = msg, "component unhealthy"),
        HealthLevel::Degraded => warn!(component = name, message = msg, "component degraded"),
        HealthLevel::Healthy => {}
    }
}

/// Thread-safe store of per-component health.
pub struct SystemHealthTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    components: HashMap<String, ComponentHealth>,
    started_at: chrono::DateTime<Utc>,
}

impl SystemHealthTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                components: HashMap::new(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn update(&self, name: &str, level: HealthLevel, msg: &str) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let comp = inner
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth {
                name: name.to_string(),
                level: HealthLevel::Healthy,
                last_check: now,
                last_healthy: None,
                message: String::new(),
                fail_count: 0,
            });

        comp.level = level;
        comp.last_check = now;
        comp.message = msg.to_string();
        if level == HealthLevel::Healthy {
            comp.last_healthy = Some(now);
            comp.fail_count = 0;
        } else {
            comp.fail_count += 1;
        }
    }

    pub fn component_level(&self, name: &str) -> HealthLevel {
        let inner = self.inner.lock().unwrap();
        inner
            .components
            .get(name)
            .map(|c| c.level)
            .unwrap_or(HealthLevel::Healthy)
    }

    /// Snapshot of all components; overall = worst level; mode derived from
    /// the overall level.
    pub fn health(&self) -> SystemHealth {
        let inner = self.inner.lock().unwrap();
        let overall = inner
            .components
            .values()
            .map(|c| c.level)
            .max()
            .unwrap_or(HealthLevel::Healthy);

        let mode = match overall {
            HealthLevel::Healthy => "normal",
            HealthLevel::Degraded => "cli_fallback",
            HealthLevel::Unhealthy => "degraded",
            HealthLevel::Critical => "critical",
        };

        SystemHealth {
            overall,
            components: inner.components.clone(),
            started_at: inner.started_at,
            uptime_sec: (Utc::now() - inner.started_at).num_seconds(),
            mode: mode.to_string(),
        }
    }
}

impl Default for SystemHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard component checkers over the executor and filesystem.
pub struct SelfHealer {
    exec: Arc<dyn Executor>,
    backend_bin: String,
    index_db: String,
}

impl SelfHealer {
    pub fn new(exec: Arc<dyn Executor>, backend_bin: String, index_db: String) -> Self {
        Self {
            exec,
            backend_bin,
            index_db,
        }
    }

    /// The backend binary answers a version probe.
    pub async fn check_backend_cli(&self) -> (HealthLevel, String) {
        match self.exec.version().await {
            Ok(_) => (HealthLevel::Healthy, String::new()),
            Err(err) => {
                if std::fs::metadata(&self.backend_bin).is_err() {
                    return (
                        HealthLevel::Critical,
                        format!("qmd binary not found: {}", self.backend_bin),
                    );
                }
                (HealthLevel::Unhealthy, format!("qmd cli not responding: {err}"))
            }
        }
    }

    /// The index database file exists and is non-empty.
    pub fn check_index_db(&self) -> (HealthLevel, String) {
        if self.index_db.is_empty() {
            return (HealthLevel::Healthy, String::new());
        }
        match std::fs::metadata(&self.index_db) {
            Err(_) => (
                HealthLevel::Critical,
                format!("index database not found: {}", self.index_db),
            ),
            Ok(meta) if meta.len() == 0 => (
                HealthLevel::Critical,
                format!("index database is empty: {}", self.index_db),
            ),
            Ok(_) => (HealthLevel::Healthy, String::new()),
        }
    }

    /// Embeddings exist, so vsearch/query can work.
    pub async fn check_embeddings(&self) -> (HealthLevel, String) {
        if !self.exec.has_capability(Capability::Status) {
            return (
                HealthLevel::Healthy,
                "status capability not available, skipping embed check".to_string(),
            );
        }
        match self.exec.status().await {
            Err(err) => (
                HealthLevel::Degraded,
                format!("cannot check embeddings: {err}"),
            ),
            Ok(status) if status.vectors == 0 => (
                HealthLevel::Degraded,
                "no embeddings found, vsearch/query may not work".to_string(),
            ),
            Ok(_) => (HealthLevel::Healthy, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_overall_is_worst_component() {
        let tracker = SystemHealthTracker::new();
        tracker.update("cache", HealthLevel::Healthy, "");
        tracker.update("sidecar", HealthLevel::Degraded, "cli fallback");

        let health = tracker.health();
        assert_eq!(health.overall, HealthLevel::Degraded);
        assert_eq!(health.mode, "cli_fallback");
        assert_eq!(health.components.len(), 2);
    }

    #[test]
    fn test_tracker_fail_count_resets_on_recovery() {
        let tracker = SystemHealthTracker::new();
        tracker.update("backend", HealthLevel::Unhealthy, "down");
        tracker.update("backend", HealthLevel::Unhealthy, "down");
        {
            let inner = tracker.inner.lock().unwrap();
            assert_eq!(inner.components["backend"].fail_count, 2);
        }

        tracker.update("backend", HealthLevel::Healthy, "");
        let inner = tracker.inner.lock().unwrap();
        assert_eq!(inner.components["backend"].fail_count, 0);
        assert!(inner.components["backend"].last_healthy.is_some());
    }

    #[test]
    fn test_unknown_component_is_healthy() {
        let tracker = SystemHealthTracker::new();
        assert_eq!(tracker.component_level("nope"), HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn test_heartbeat_runs_registered_checkers() {
        let mut hb = Heartbeat::new(Duration::from_secs(60));
        hb.register(
            "always_degraded",
            Box::new(|| {
                Box::pin(async { (HealthLevel::Degraded, "test component".to_string()) })
            }),
        );
        let tracker = hb.tracker();

        hb.run_checks().await;
        assert_eq!(tracker.component_level("always_degraded"), HealthLevel::Degraded);
        assert_eq!(tracker.health().mode, "cli_fallback");
    }
}
