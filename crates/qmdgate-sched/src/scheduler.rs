//! Periodic maintenance tasks.
//!
//! Four independent loops: index refresh, incremental embed, full embed,
//! and cache cleanup. A task still in flight is silently skipped at its next
//! tick (single-flight), and a failed run is retried up to three times with
//! quadratic backoff. The deep-negative cleanup is injected as a callback so
//! the scheduler never holds a reference back to the orchestrator.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use qmdgate_cache::ResultCache;
use qmdgate_core::{Executor, Result};

const MAX_RETRIES: u32 = 3;

/// Tick intervals for the four periodic tasks.
#[derive(Debug, Clone)]
pub struct SchedulerIntervals {
    pub index_refresh: Duration,
    pub embed_refresh: Duration,
    pub embed_full_refresh: Duration,
    pub cache_cleanup: Duration,
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        Self {
            index_refresh: Duration::from_secs(30 * 60),
            embed_refresh: Duration::from_secs(24 * 60 * 60),
            embed_full_refresh: Duration::from_secs(7 * 24 * 60 * 60),
            cache_cleanup: Duration::from_secs(60 * 60),
        }
    }
}

/// Callback sweeping the deep-negative cache; returns removed count.
pub type NegativeCleanupFn = Arc<dyn Fn() -> usize + Send + Sync>;

pub struct Scheduler {
    exec: Arc<dyn Executor>,
    cache: Arc<ResultCache>,
    intervals: SchedulerIntervals,
    /// Embedding tasks are skipped when low-resource mode disables them
    embed_enabled: bool,
    negative_cleanup: NegativeCleanupFn,
    running: Mutex<HashSet<&'static str>>,
    retry_base: Duration,
}

impl Scheduler {
    pub fn new(
        exec: Arc<dyn Executor>,
        cache: Arc<ResultCache>,
        intervals: SchedulerIntervals,
        embed_enabled: bool,
        negative_cleanup: NegativeCleanupFn,
    ) -> Self {
        Self {
            exec,
            cache,
            intervals,
            embed_enabled,
            negative_cleanup,
            running: Mutex::new(HashSet::new()),
            retry_base: Duration::from_secs(1),
        }
    }

    /// Spawn the four periodic loops.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            index_refresh = ?self.intervals.index_refresh,
            embed_refresh = ?self.intervals.embed_refresh,
            embed_full_refresh = ?self.intervals.embed_full_refresh,
            cache_cleanup = ?self.intervals.cache_cleanup,
            "scheduler started"
        );

        vec![
            Self::spawn_loop(
                Arc::clone(&self),
                "index_refresh",
                self.intervals.index_refresh,
                |s| async move { s.task_reindex().await },
            ),
            Self::spawn_loop(
                Arc::clone(&self),
                "embed_refresh",
                self.intervals.embed_refresh,
                |s| async move { s.task_embed(false).await },
            ),
            Self::spawn_loop(
                Arc::clone(&self),
                "embed_full_refresh",
                self.intervals.embed_full_refresh,
                |s| async move { s.task_embed(true).await },
            ),
            Self::spawn_loop(
                Arc::clone(&self),
                "cache_cleanup",
                self.intervals.cache_cleanup,
                |s| async move { s.task_cache_cleanup().await },
            ),
        ]
    }

    fn spawn_loop<F, Fut>(
        sched: Arc<Self>,
        name: &'static str,
        interval: Duration,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let sched_for_task = Arc::clone(&sched);
                let task_ref = &task;
                if let Err(err) = sched
                    .run_task(name, || task_ref(Arc::clone(&sched_for_task)))
                    .await
                {
                    error!(task = name, %err, "scheduled task failed");
                }
            }
        })
    }

    /// Admin entry: trigger a reindex now, with the same single-flight rule.
    pub async fn trigger_reindex(&self) -> Result<()> {
        self.run_task("index_refresh", || self.task_reindex()).await
    }

    /// Admin entry: trigger an embed pass now.
    pub async fn trigger_embed(&self, force: bool) -> Result<()> {
        let name = if force { "embed_full_refresh" } else { "embed_refresh" };
        self.run_task(name, || self.task_embed(force)).await
    }

    async fn run_task<F, Fut>(&self, name: &'static str, task: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        {
            let mut running = self.running.lock().unwrap();
            if !running.insert(name) {
                debug!(task = name, "task already running, skipping");
                return Ok(());
            }
        }
        let _release = ReleaseOnDrop { scheduler: self, name };

        info!(task = name, "running scheduled task");
        let start = Instant::now();
        match task().await {
            Ok(()) => {
                info!(task = name, elapsed = ?start.elapsed(), "task completed");
                Ok(())
            }
            Err(err) => {
                error!(task = name, elapsed = ?start.elapsed(), %err, "task failed");
                self.retry(name, task).await
            }
        }
    }

    async fn retry<F, Fut>(&self, name: &'static str, task: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut last_err = None;
        for attempt in 1..=MAX_RETRIES {
            let delay = self.retry_base * (attempt * attempt);
            info!(task = name, attempt, ?delay, "retrying task");
            tokio::time::sleep(delay).await;

            match task().await {
                Ok(()) => {
                    info!(task = name, attempt, "retry succeeded");
                    return Ok(());
                }
                Err(err) => {
                    warn!(task = name, attempt, %err, "retry failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("at least one retry attempt"))
    }

    async fn task_reindex(&self) -> Result<()> {
        self.exec.update().await?;
        let version = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        self.cache.set_version(&version);
        info!(version, "index refreshed, cache version updated");
        Ok(())
    }

    async fn task_embed(&self, force: bool) -> Result<()> {
        if !self.embed_enabled {
            debug!(force, "embedding disabled by runtime policy, skipping");
            return Ok(());
        }
        self.exec.embed(force).await
    }

    async fn task_cache_cleanup(&self) -> Result<()> {
        let removed = self.cache.cleanup();
        let negative_removed = (self.negative_cleanup)();
        if removed > 0 || negative_removed > 0 {
            info!(removed, negative_removed, "cache cleanup");
        }
        Ok(())
    }
}

struct ReleaseOnDrop<'a> {
    scheduler: &'a Scheduler,
    name: &'static str,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.scheduler.running.lock().unwrap().remove(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qmdgate_cache::CacheSettings;
    use qmdgate_core::{
        Capability, CollectionInfo, Document, Error, GetOpts, Hit, IndexStatus, PathContext,
        SearchOpts,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyExecutor {
        update_calls: AtomicUsize,
        embed_calls: AtomicUsize,
        /// Number of leading update calls that fail
        fail_first: usize,
        update_delay: Option<Duration>,
    }

    #[async_trait]
    impl qmdgate_core::Executor for FlakyExecutor {
        async fn search(&self, _q: &str, _o: SearchOpts) -> Result<Vec<Hit>> {
            Ok(Vec::new())
        }
        async fn vsearch(&self, _q: &str, _o: SearchOpts) -> Result<Vec<Hit>> {
            Ok(Vec::new())
        }
        async fn query(&self, _q: &str, _o: SearchOpts) -> Result<Vec<Hit>> {
            Ok(Vec::new())
        }
        async fn get(&self, _r: &str, _o: GetOpts) -> Result<String> {
            Ok(String::new())
        }
        async fn multi_get(&self, _p: &str, _m: usize) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn collection_add(&self, _p: &str, _n: &str, _m: &str) -> Result<()> {
            Ok(())
        }
        async fn collection_list(&self) -> Result<Vec<CollectionInfo>> {
            Ok(Vec::new())
        }
        async fn update(&self) -> Result<()> {
            let call = self.update_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.update_delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.fail_first {
                return Err(Error::Backend("index busy".to_string()));
            }
            Ok(())
        }
        async fn embed(&self, _force: bool) -> Result<()> {
            self.embed_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn context_add(&self, _p: &str, _d: &str) -> Result<()> {
            Ok(())
        }
        async fn context_list(&self) -> Result<Vec<PathContext>> {
            Ok(Vec::new())
        }
        async fn context_remove(&self, _p: &str) -> Result<()> {
            Ok(())
        }
        async fn status(&self) -> Result<IndexStatus> {
            Ok(IndexStatus::default())
        }
        async fn sidecar_start(&self) -> Result<()> {
            Ok(())
        }
        async fn sidecar_stop(&self) -> Result<()> {
            Ok(())
        }
        async fn sidecar_health(&self) -> Result<()> {
            Ok(())
        }
        async fn version(&self) -> Result<String> {
            Ok("test".to_string())
        }
        fn has_capability(&self, _cap: Capability) -> bool {
            true
        }
    }

    fn cache() -> Arc<ResultCache> {
        Arc::new(ResultCache::new(&CacheSettings {
            enabled: true,
            ttl: Duration::from_secs(60),
            max_entries: 10,
            version_aware: true,
        }))
    }

    fn scheduler(exec: Arc<FlakyExecutor>, embed_enabled: bool) -> Arc<Scheduler> {
        let mut sched = Scheduler::new(
            exec,
            cache(),
            SchedulerIntervals::default(),
            embed_enabled,
            Arc::new(|| 0),
        );
        sched.retry_base = Duration::from_millis(1);
        Arc::new(sched)
    }

    #[tokio::test]
    async fn test_trigger_reindex_updates_cache_version() {
        let exec = Arc::new(FlakyExecutor::default());
        let sched = scheduler(Arc::clone(&exec), true);

        sched.trigger_reindex().await.unwrap();
        assert_eq!(exec.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_with_quadratic_backoff_eventually_succeeds() {
        let exec = Arc::new(FlakyExecutor {
            fail_first: 2,
            ..FlakyExecutor::default()
        });
        let sched = scheduler(Arc::clone(&exec), true);

        sched.trigger_reindex().await.unwrap();
        // Initial attempt plus two retries.
        assert_eq!(exec.update_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_three_attempts() {
        let exec = Arc::new(FlakyExecutor {
            fail_first: 100,
            ..FlakyExecutor::default()
        });
        let sched = scheduler(Arc::clone(&exec), true);

        assert!(sched.trigger_reindex().await.is_err());
        assert_eq!(exec.update_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_single_flight_skips_overlapping_runs() {
        let exec = Arc::new(FlakyExecutor {
            update_delay: Some(Duration::from_millis(100)),
            ..FlakyExecutor::default()
        });
        let sched = scheduler(Arc::clone(&exec), true);

        let first = {
            let sched = Arc::clone(&sched);
            tokio::spawn(async move { sched.trigger_reindex().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Second trigger while the first is still in flight: skipped, Ok.
        sched.trigger_reindex().await.unwrap();
        assert_eq!(exec.update_calls.load(Ordering::SeqCst), 1);

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_embed_skipped_when_disabled() {
        let exec = Arc::new(FlakyExecutor::default());
        let sched = scheduler(Arc::clone(&exec), false);

        sched.trigger_embed(false).await.unwrap();
        sched.trigger_embed(true).await.unwrap();
        assert_eq!(exec.embed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_cleanup_invokes_negative_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let sched = Arc::new(Scheduler::new(
            Arc::new(FlakyExecutor::default()),
            cache(),
            SchedulerIntervals::default(),
            true,
            Arc::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                2
            }),
        ));

        sched.task_cache_cleanup().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
