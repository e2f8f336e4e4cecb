//! YAML configuration loading.
//!
//! Every field has a default; paths support `~/` and environment-variable
//! expansion. Durations accept either bare integers (seconds) or suffixed
//! strings (`500ms`, `30s`, `15m`, `2h`, `7d`). When both
//! `low_resource_mode` and `allow_cpu_deep_query` are set, a tightened
//! runtime profile is applied to fields the file left unset.

use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use qmdgate_cache::CacheSettings;
use qmdgate_core::{Error, Result};
use qmdgate_exec::ExecConfig;
use qmdgate_guard::CpuGuardConfig;
use qmdgate_route::{CollectionSpec, RuntimeSettings, SearchSettings};
use qmdgate_sched::guardian::GuardianConfig;
use qmdgate_sched::SchedulerIntervals;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub qmd: QmdConfig,
    #[serde(default)]
    pub collections: Vec<CollectionSpec>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub guardian: GuardianSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub security_model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QmdConfig {
    /// Path to the backend binary
    #[serde(default)]
    pub bin: String,
    /// Index database file, used only for health checks
    #[serde(default)]
    pub index_db: String,
    /// JSON-RPC sidecar port; 0 disables the sidecar transport
    #[serde(default)]
    pub mcp_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub default_mode: String,
    #[serde(default)]
    pub coarse_k: usize,
    #[serde(default)]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub max_chars: usize,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub files_all_max_hits: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_mode: String::new(),
            coarse_k: 0,
            top_k: 0,
            min_score: 0.0,
            max_chars: 0,
            fallback_enabled: true,
            files_all_max_hits: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "de_duration")]
    pub ttl: Duration,
    #[serde(default)]
    pub max_entries: usize,
    #[serde(default, deserialize_with = "de_duration")]
    pub cleanup_interval: Duration,
    #[serde(default)]
    pub version_aware: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::ZERO,
            max_entries: 0,
            cleanup_interval: Duration::ZERO,
            version_aware: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default, deserialize_with = "de_duration")]
    pub index_refresh: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub embed_refresh: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub embed_full_refresh: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub cache_cleanup: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardianSection {
    #[serde(default, deserialize_with = "de_duration")]
    pub check_interval: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub restart_max_retries: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub low_resource_mode: bool,
    #[serde(default)]
    pub allow_cpu_deep_query: bool,
    #[serde(default)]
    pub allow_cpu_vsearch: bool,
    #[serde(default)]
    pub smart_routing: bool,
    #[serde(default)]
    pub cpu_deep_min_words: usize,
    #[serde(default)]
    pub cpu_deep_min_chars: usize,
    #[serde(default)]
    pub cpu_deep_max_words: usize,
    #[serde(default)]
    pub cpu_deep_max_chars: usize,
    #[serde(default)]
    pub cpu_deep_max_abstract_cues: usize,
    #[serde(default)]
    pub query_max_concurrency: usize,
    #[serde(default, deserialize_with = "de_duration")]
    pub query_timeout: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub deep_fail_timeout: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub deep_negative_ttl: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub deep_negative_scope_cooldown: Duration,
    #[serde(default)]
    pub cpu_overload_protect: bool,
    #[serde(default)]
    pub cpu_overload_threshold: f64,
    #[serde(default, deserialize_with = "de_duration")]
    pub cpu_overload_sustain: Duration,
    #[serde(default)]
    pub cpu_recover_threshold: f64,
    #[serde(default, deserialize_with = "de_duration")]
    pub cpu_recover_sustain: Duration,
    #[serde(default)]
    pub cpu_critical_threshold: f64,
    #[serde(default, deserialize_with = "de_duration")]
    pub cpu_critical_sustain: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub cpu_sample_interval: Duration,
    #[serde(default)]
    pub overload_max_concurrent_search: usize,
}

fn default_true() -> bool {
    true
}

/// Load, normalize, and validate a config file.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("read config {}: {e}", path.display())))?;
    parse(&raw)
}

/// Parse config from a YAML string (split out for tests).
pub fn parse(raw: &str) -> Result<Config> {
    let mut cfg: Config =
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("parse config: {e}")))?;
    cfg.normalize();
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    fn normalize(&mut self) {
        self.qmd.bin = expand_path(&self.qmd.bin);
        self.qmd.index_db = expand_path(&self.qmd.index_db);
        self.logging.file = expand_path(&self.logging.file);
        for col in &mut self.collections {
            col.path = expand_path(&col.path);
        }

        if self.server.listen.is_empty() {
            self.server.listen = "127.0.0.1:19091".to_string();
        }
        if self.server.security_model.is_empty() {
            self.server.security_model = "loopback_trust".to_string();
        }
        if self.qmd.mcp_port == 0 {
            self.qmd.mcp_port = 8181;
        }
        if self.search.default_mode.is_empty() {
            self.search.default_mode = "auto".to_string();
        }
        if self.search.coarse_k == 0 {
            self.search.coarse_k = 20;
        }
        if self.search.top_k == 0 {
            self.search.top_k = 8;
        }
        if self.search.min_score == 0.0 {
            self.search.min_score = 0.3;
        }
        if self.search.max_chars == 0 {
            self.search.max_chars = 9000;
        }
        if self.search.files_all_max_hits == 0 {
            self.search.files_all_max_hits = 200;
        }
        if self.cache.ttl.is_zero() {
            self.cache.ttl = Duration::from_secs(30 * 60);
        }
        if self.cache.max_entries == 0 {
            self.cache.max_entries = 500;
        }
        if self.cache.cleanup_interval.is_zero() {
            self.cache.cleanup_interval = Duration::from_secs(60 * 60);
        }
        if self.scheduler.index_refresh.is_zero() {
            self.scheduler.index_refresh = Duration::from_secs(30 * 60);
        }
        if self.scheduler.embed_refresh.is_zero() {
            self.scheduler.embed_refresh = Duration::from_secs(24 * 60 * 60);
        }
        if self.scheduler.embed_full_refresh.is_zero() {
            self.scheduler.embed_full_refresh = Duration::from_secs(7 * 24 * 60 * 60);
        }
        if self.scheduler.cache_cleanup.is_zero() {
            self.scheduler.cache_cleanup = Duration::from_secs(60 * 60);
        }
        if self.guardian.check_interval.is_zero() {
            self.guardian.check_interval = Duration::from_secs(60);
        }
        if self.guardian.timeout.is_zero() {
            self.guardian.timeout = Duration::from_secs(5);
        }
        if self.guardian.restart_max_retries == 0 {
            self.guardian.restart_max_retries = 3;
        }
        if self.logging.level.is_empty() {
            self.logging.level = "info".to_string();
        }

        self.apply_runtime_defaults();
    }

    fn apply_runtime_defaults(&mut self) {
        let rt = &mut self.runtime;
        let query_timeout_unset = rt.query_timeout.is_zero();
        let query_concurrency_unset = rt.query_max_concurrency == 0;
        let deep_fail_timeout_unset = rt.deep_fail_timeout.is_zero();
        let deep_negative_ttl_unset = rt.deep_negative_ttl.is_zero();

        if query_timeout_unset {
            rt.query_timeout = Duration::from_secs(120);
        }
        if query_concurrency_unset {
            rt.query_max_concurrency = 2;
        }
        if deep_fail_timeout_unset {
            rt.deep_fail_timeout = Duration::from_secs(15);
        }
        if deep_negative_ttl_unset {
            rt.deep_negative_ttl = Duration::from_secs(10 * 60);
        }
        if rt.deep_negative_scope_cooldown.is_zero() {
            rt.deep_negative_scope_cooldown = Duration::from_secs(10 * 60);
        }
        if rt.overload_max_concurrent_search == 0 {
            rt.overload_max_concurrent_search = 2;
        }
        if rt.cpu_overload_threshold == 0.0 {
            rt.cpu_overload_threshold = 90.0;
        }
        if rt.cpu_overload_sustain.is_zero() {
            rt.cpu_overload_sustain = Duration::from_secs(10);
        }
        if rt.cpu_recover_threshold == 0.0 {
            rt.cpu_recover_threshold = 75.0;
        }
        if rt.cpu_recover_sustain.is_zero() {
            rt.cpu_recover_sustain = Duration::from_secs(12);
        }
        if rt.cpu_critical_threshold == 0.0 {
            rt.cpu_critical_threshold = 95.0;
        }
        if rt.cpu_critical_sustain.is_zero() {
            rt.cpu_critical_sustain = Duration::from_secs(5);
        }
        if rt.cpu_sample_interval.is_zero() {
            rt.cpu_sample_interval = Duration::from_secs(1);
        }

        if rt.low_resource_mode && rt.allow_cpu_deep_query {
            rt.smart_routing = true;
            if rt.cpu_deep_min_words == 0 {
                rt.cpu_deep_min_words = 10;
            }
            if rt.cpu_deep_min_chars == 0 {
                rt.cpu_deep_min_chars = 24;
            }
            if rt.cpu_deep_max_words == 0 {
                rt.cpu_deep_max_words = 28;
            }
            if rt.cpu_deep_max_chars == 0 {
                rt.cpu_deep_max_chars = 160;
            }
            if rt.cpu_deep_max_abstract_cues == 0 {
                rt.cpu_deep_max_abstract_cues = 2;
            }
            if query_concurrency_unset {
                rt.query_max_concurrency = 1;
            }
            if query_timeout_unset {
                rt.query_timeout = Duration::from_secs(45);
            }
            if deep_fail_timeout_unset {
                rt.deep_fail_timeout = Duration::from_secs(12);
            }
            if deep_negative_ttl_unset {
                rt.deep_negative_ttl = Duration::from_secs(15 * 60);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.qmd.bin.is_empty() {
            return Err(Error::Config("qmd.bin is required".to_string()));
        }
        if std::fs::metadata(&self.qmd.bin).is_err() {
            return Err(Error::Config(format!(
                "qmd binary not found at {}",
                self.qmd.bin
            )));
        }
        if self.collections.is_empty() {
            return Err(Error::Config("at least one collection is required".to_string()));
        }
        for col in &self.collections {
            if col.name.is_empty() {
                return Err(Error::Config("collection name is required".to_string()));
            }
            if col.path.is_empty() {
                return Err(Error::Config(format!(
                    "collection {}: path is required",
                    col.name
                )));
            }
            if col.tier == 0 {
                return Err(Error::Config(format!(
                    "collection {}: tier must be positive",
                    col.name
                )));
            }
        }
        Ok(())
    }

    // -------- views consumed by the component crates --------

    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            bin: self.qmd.bin.clone(),
            low_resource_mode: self.runtime.low_resource_mode,
            allow_cpu_deep_query: self.runtime.allow_cpu_deep_query,
            query_timeout: self.runtime.query_timeout,
            query_max_concurrency: self.runtime.query_max_concurrency,
        }
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            coarse_k: self.search.coarse_k,
            top_k: self.search.top_k,
            min_score: self.search.min_score,
            max_chars: self.search.max_chars,
            fallback_enabled: self.search.fallback_enabled,
            files_all_max_hits: self.search.files_all_max_hits,
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        let rt = &self.runtime;
        RuntimeSettings {
            low_resource_mode: rt.low_resource_mode,
            allow_cpu_deep_query: rt.allow_cpu_deep_query,
            smart_routing: rt.smart_routing,
            cpu_deep_min_words: rt.cpu_deep_min_words,
            cpu_deep_min_chars: rt.cpu_deep_min_chars,
            cpu_deep_max_words: rt.cpu_deep_max_words,
            cpu_deep_max_chars: rt.cpu_deep_max_chars,
            cpu_deep_max_abstract_cues: rt.cpu_deep_max_abstract_cues,
            query_timeout: rt.query_timeout,
            deep_fail_timeout: rt.deep_fail_timeout,
            deep_negative_ttl: rt.deep_negative_ttl,
            deep_negative_scope_cooldown: rt.deep_negative_scope_cooldown,
            overload_max_concurrent_search: rt.overload_max_concurrent_search,
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            enabled: self.cache.enabled,
            ttl: self.cache.ttl,
            max_entries: self.cache.max_entries,
            version_aware: self.cache.version_aware,
        }
    }

    pub fn scheduler_intervals(&self) -> SchedulerIntervals {
        SchedulerIntervals {
            index_refresh: self.scheduler.index_refresh,
            embed_refresh: self.scheduler.embed_refresh,
            embed_full_refresh: self.scheduler.embed_full_refresh,
            cache_cleanup: self.scheduler.cache_cleanup,
        }
    }

    pub fn guardian_config(&self) -> GuardianConfig {
        GuardianConfig {
            check_interval: self.guardian.check_interval,
            timeout: self.guardian.timeout,
            restart_max_retries: self.guardian.restart_max_retries,
        }
    }

    pub fn cpu_guard_config(&self) -> CpuGuardConfig {
        let rt = &self.runtime;
        CpuGuardConfig {
            enabled: rt.cpu_overload_protect,
            sample_interval: rt.cpu_sample_interval,
            overload_pct: rt.cpu_overload_threshold,
            overload_sustain: rt.cpu_overload_sustain,
            recover_pct: rt.cpu_recover_threshold,
            recover_sustain: rt.cpu_recover_sustain,
            critical_pct: rt.cpu_critical_threshold,
            critical_sustain: rt.cpu_critical_sustain,
        }
    }

    /// Embedding is suppressed when low-resource mode disables every
    /// embedding-consuming capability.
    pub fn embed_enabled(&self) -> bool {
        !(self.runtime.low_resource_mode
            && !(self.runtime.allow_cpu_vsearch || self.runtime.allow_cpu_deep_query))
    }
}

/// `~/` prefix and `$VAR` / `${VAR}` expansion.
fn expand_path(p: &str) -> String {
    if p.is_empty() {
        return String::new();
    }
    let mut out = expand_env(p);
    if let Some(rest) = out.clone().strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            out = dirs.home_dir().join(rest).to_string_lossy().into_owned();
        }
    }
    out
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

/// Durations: bare integers are seconds; strings take an `ms`/`s`/`m`/`h`/`d`
/// suffix.
fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(s) => Ok(Duration::from_secs(s)),
        Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration {s:?} missing unit"))?;
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration value {s:?}"))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86400)),
        other => Err(format!("unknown duration unit {other:?}")),
    }
}
