//! # qmdgate-guard
//!
//! Background CPU sampler with two latched predicates consumed by the
//! orchestrator:
//!
//! - **overloaded**: degrades requests (forces lexical mode, caps search
//!   concurrency)
//! - **critical**: sheds uncached work entirely
//!
//! Both latch with hysteresis: a predicate flips on after a sustained run of
//! samples above its threshold and off after a sustained run below the
//! recovery threshold. Critical recovery reuses the overload threshold and
//! the standard recover sustain so the guard does not flap between the two
//! states when usage hovers between them.
//!
//! On Linux the sampler reads the aggregate line of `/proc/stat`; the latch
//! logic itself only needs a usage percentage per tick, which keeps it
//! directly testable.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Guard thresholds and sample cadence.
#[derive(Debug, Clone)]
pub struct CpuGuardConfig {
    pub enabled: bool,
    pub sample_interval: Duration,
    pub overload_pct: f64,
    pub overload_sustain: Duration,
    pub recover_pct: f64,
    pub recover_sustain: Duration,
    pub critical_pct: f64,
    pub critical_sustain: Duration,
}

impl Default for CpuGuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval: Duration::from_secs(1),
            overload_pct: 90.0,
            overload_sustain: Duration::from_secs(10),
            recover_pct: 75.0,
            recover_sustain: Duration::from_secs(12),
            critical_pct: 95.0,
            critical_sustain: Duration::from_secs(5),
        }
    }
}

impl CpuGuardConfig {
    fn normalized(mut self) -> Self {
        let d = CpuGuardConfig::default();
        if self.sample_interval.is_zero() {
            self.sample_interval = d.sample_interval;
        }
        if self.overload_pct <= 0.0 {
            self.overload_pct = d.overload_pct;
        }
        if self.overload_sustain.is_zero() {
            self.overload_sustain = d.overload_sustain;
        }
        if self.recover_pct <= 0.0 {
            self.recover_pct = d.recover_pct;
        }
        if self.recover_sustain.is_zero() {
            self.recover_sustain = d.recover_sustain;
        }
        if self.critical_pct <= 0.0 {
            self.critical_pct = d.critical_pct;
        }
        if self.critical_sustain.is_zero() {
            self.critical_sustain = d.critical_sustain;
        }
        // Critical below overload would latch critical before overload.
        if self.critical_pct < self.overload_pct {
            self.critical_pct = self.overload_pct;
        }
        self
    }
}

/// Point-in-time copy of the guard state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSnapshot {
    pub overloaded: bool,
    pub critical: bool,
    pub usage_pct: f64,
    pub updated_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    overloaded: bool,
    critical: bool,
    usage_pct: f64,
    updated_at: Option<Instant>,

    above: u32,
    below: u32,
    critical_above: u32,
    critical_below: u32,
}

/// Latched CPU overload guard.
pub struct CpuGuard {
    cfg: CpuGuardConfig,
    state: Mutex<State>,
    need_above: u32,
    need_below: u32,
    need_critical: u32,
}

impl CpuGuard {
    pub fn new(cfg: CpuGuardConfig) -> Self {
        let cfg = cfg.normalized();
        let need_above = required_samples(cfg.overload_sustain, cfg.sample_interval);
        let need_below = required_samples(cfg.recover_sustain, cfg.sample_interval);
        let need_critical = required_samples(cfg.critical_sustain, cfg.sample_interval);
        Self {
            cfg,
            state: Mutex::new(State::default()),
            need_above,
            need_below,
            need_critical,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.state.lock().unwrap().overloaded
    }

    pub fn is_critical_overloaded(&self) -> bool {
        self.state.lock().unwrap().critical
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        let s = self.state.lock().unwrap();
        CpuSnapshot {
            overloaded: s.overloaded,
            critical: s.critical,
            usage_pct: s.usage_pct,
            updated_at: s.updated_at,
        }
    }

    /// Apply one usage sample to both latches. Called from the sampling loop
    /// once per interval.
    pub fn step(&self, usage: f64) {
        let mut s = self.state.lock().unwrap();
        s.usage_pct = usage;
        s.updated_at = Some(Instant::now());

        if usage >= self.cfg.overload_pct {
            s.above += 1;
            s.below = 0;
            if s.above >= self.need_above && !s.overloaded {
                s.overloaded = true;
                warn!(
                    usage_pct = format!("{usage:.2}"),
                    threshold_pct = self.cfg.overload_pct,
                    "cpu overload protection activated"
                );
            }
        } else if usage <= self.cfg.recover_pct {
            s.below += 1;
            s.above = 0;
            if s.below >= self.need_below && s.overloaded {
                s.overloaded = false;
                info!(
                    usage_pct = format!("{usage:.2}"),
                    recover_pct = self.cfg.recover_pct,
                    "cpu overload protection recovered"
                );
            }
        } else {
            s.above = 0;
            s.below = 0;
        }

        if usage >= self.cfg.critical_pct {
            s.critical_above += 1;
            s.critical_below = 0;
            if s.critical_above >= self.need_critical && !s.critical {
                s.critical = true;
                error!(
                    usage_pct = format!("{usage:.2}"),
                    critical_pct = self.cfg.critical_pct,
                    "cpu critical overload activated"
                );
            }
        } else if usage <= self.cfg.overload_pct {
            // Recovery reuses the overload threshold and the recover sustain;
            // activation stays fast, recovery stays conservative.
            s.critical_below += 1;
            s.critical_above = 0;
            if s.critical_below >= self.need_below && s.critical {
                s.critical = false;
                info!(
                    usage_pct = format!("{usage:.2}"),
                    critical_pct = self.cfg.critical_pct,
                    "cpu critical overload recovered"
                );
            }
        } else {
            s.critical_above = 0;
            s.critical_below = 0;
        }
    }

    /// Spawn the sampling loop. Returns `None` when the guard is disabled or
    /// the platform counters are unavailable.
    pub fn start(self: std::sync::Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.cfg.enabled {
            return None;
        }

        let (mut prev_idle, mut prev_total) = match read_cpu_jiffies() {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "cpu guard disabled: failed to read /proc/stat");
                return None;
            }
        };

        let guard = self;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(guard.cfg.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let (idle, total) = match read_cpu_jiffies() {
                    Ok(v) => v,
                    Err(err) => {
                        debug!(%err, "cpu guard sample failed");
                        continue;
                    }
                };
                let d_idle = idle.saturating_sub(prev_idle);
                let d_total = total.saturating_sub(prev_total);
                prev_idle = idle;
                prev_total = total;
                if d_total == 0 {
                    continue;
                }
                let usage = (d_total - d_idle.min(d_total)) as f64 / d_total as f64 * 100.0;
                guard.step(usage);
            }
        }))
    }
}

fn required_samples(duration: Duration, interval: Duration) -> u32 {
    if duration.is_zero() || interval.is_zero() {
        return 1;
    }
    let n = (duration.as_millis() + interval.as_millis() - 1) / interval.as_millis();
    (n as u32).max(1)
}

/// Aggregate (idle, total) jiffies from `/proc/stat`. Idle includes iowait.
fn read_cpu_jiffies() -> std::io::Result<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat")?;
    parse_cpu_line(&content).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "cpu line not found in /proc/stat")
    })
}

fn parse_cpu_line(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let vals: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|s| s.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if vals.len() < 5 {
        return None;
    }
    let total: u64 = vals.iter().sum();
    let idle = vals[3] + vals[4];
    Some((idle, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(overload_samples: u32, recover_samples: u32, critical_samples: u32) -> CpuGuard {
        CpuGuard::new(CpuGuardConfig {
            enabled: true,
            sample_interval: Duration::from_secs(1),
            overload_pct: 90.0,
            overload_sustain: Duration::from_secs(overload_samples as u64),
            recover_pct: 75.0,
            recover_sustain: Duration::from_secs(recover_samples as u64),
            critical_pct: 95.0,
            critical_sustain: Duration::from_secs(critical_samples as u64),
        })
    }

    #[test]
    fn test_overload_latches_after_sustained_samples() {
        let g = guard(3, 3, 2);
        g.step(92.0);
        g.step(93.0);
        assert!(!g.is_overloaded());
        g.step(95.0);
        assert!(g.is_overloaded());
    }

    #[test]
    fn test_overload_counter_resets_on_dip() {
        let g = guard(3, 3, 2);
        g.step(92.0);
        g.step(93.0);
        g.step(60.0);
        g.step(92.0);
        g.step(93.0);
        assert!(!g.is_overloaded());
    }

    #[test]
    fn test_recovery_requires_sustained_low_samples() {
        let g = guard(2, 3, 2);
        g.step(92.0);
        g.step(92.0);
        assert!(g.is_overloaded());

        g.step(70.0);
        g.step(70.0);
        assert!(g.is_overloaded());
        g.step(70.0);
        assert!(!g.is_overloaded());
    }

    #[test]
    fn test_middle_band_holds_the_latch() {
        let g = guard(2, 2, 2);
        g.step(92.0);
        g.step(92.0);
        assert!(g.is_overloaded());

        // Between recover and overload thresholds nothing changes.
        for _ in 0..10 {
            g.step(80.0);
        }
        assert!(g.is_overloaded());
    }

    #[test]
    fn test_critical_latches_and_recovers_at_overload_threshold() {
        let g = guard(2, 2, 2);
        g.step(96.0);
        g.step(97.0);
        assert!(g.is_critical_overloaded());
        assert!(g.is_overloaded());

        // 92% is below critical but above the overload threshold: critical
        // holds in the 90-95 band.
        g.step(92.0);
        g.step(92.0);
        assert!(g.is_critical_overloaded());

        g.step(85.0);
        g.step(85.0);
        assert!(!g.is_critical_overloaded());
        assert!(g.is_overloaded());
    }

    #[test]
    fn test_critical_threshold_clamped_to_overload() {
        let g = CpuGuard::new(CpuGuardConfig {
            critical_pct: 50.0,
            overload_pct: 90.0,
            ..CpuGuardConfig::default()
        });
        assert_eq!(g.cfg.critical_pct, 90.0);
    }

    #[test]
    fn test_required_samples_rounds_up() {
        assert_eq!(
            required_samples(Duration::from_secs(10), Duration::from_secs(3)),
            4
        );
        assert_eq!(
            required_samples(Duration::from_secs(1), Duration::from_secs(1)),
            1
        );
        assert_eq!(required_samples(Duration::ZERO, Duration::from_secs(1)), 1);
    }

    #[test]
    fn test_parse_cpu_line() {
        let content = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let (idle, total) = parse_cpu_line(content).unwrap();
        assert_eq!(idle, 850);
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_parse_cpu_line_missing() {
        assert!(parse_cpu_line("intr 12345\n").is_none());
    }

    #[test]
    fn test_snapshot_reflects_last_sample() {
        let g = guard(2, 2, 2);
        g.step(42.5);
        let snap = g.snapshot();
        assert_eq!(snap.usage_pct, 42.5);
        assert!(!snap.overloaded);
        assert!(snap.updated_at.is_some());
    }
}
