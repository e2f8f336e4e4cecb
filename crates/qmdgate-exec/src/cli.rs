//! Subprocess executor over the `qmd` binary.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use qmdgate_core::{
    Capabilities, Capability, CollectionInfo, Document, Error, Executor, GetOpts, Hit, IndexStatus,
    PathContext, Result, SearchOpts,
};

use crate::parse;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(300);
const EMBED_TIMEOUT: Duration = Duration::from_secs(1800);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime knobs the executor needs from the application config.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Path to the backend binary
    pub bin: String,
    pub low_resource_mode: bool,
    pub allow_cpu_deep_query: bool,
    /// Deep-query call deadline
    pub query_timeout: Duration,
    /// Bounded concurrency for the deep path; 0 disables the gate
    pub query_max_concurrency: usize,
}

/// Executor that shells out to the backend binary for every operation.
pub struct CliExecutor {
    bin: String,
    caps: Capabilities,
    low_resource: bool,
    query_timeout: Duration,
    query_tokens: Option<Arc<Semaphore>>,
}

impl CliExecutor {
    /// Probe the backend and build the executor. Probing downgrades missing
    /// capabilities; only a completely unusable binary fails construction.
    pub async fn new(cfg: ExecConfig) -> Result<Self> {
        let query_tokens = if cfg.query_max_concurrency > 0 {
            Some(Arc::new(Semaphore::new(cfg.query_max_concurrency)))
        } else {
            None
        };

        let mut exec = Self {
            bin: cfg.bin,
            caps: Capabilities::default(),
            low_resource: cfg.low_resource_mode,
            query_timeout: cfg.query_timeout,
            query_tokens,
        };
        exec.probe(cfg.allow_cpu_deep_query).await?;
        Ok(exec)
    }

    async fn probe(&mut self, allow_cpu_deep: bool) -> Result<()> {
        match self.run(PROBE_TIMEOUT, &["--version"]).await {
            Ok(out) => info!(version = %out.trim(), "qmd detected"),
            Err(version_err) => {
                // Some backend builds lack --version yet work fine otherwise.
                if let Err(help_err) = self.run(PROBE_TIMEOUT, &["--help"]).await {
                    return Err(Error::Unavailable(format!(
                        "qmd not available (version check failed: {version_err}; help check failed: {help_err})"
                    )));
                }
                info!(probe = "--help", "qmd detected (without --version support)");
            }
        }

        self.caps.vector = self.run(PROBE_TIMEOUT, &["vsearch", "--help"]).await.is_ok();
        self.caps.deep_query = self.run(PROBE_TIMEOUT, &["query", "--help"]).await.is_ok();
        self.caps.sidecar = self.run(PROBE_TIMEOUT, &["mcp", "--help"]).await.is_ok();
        self.caps.status = self.run(PROBE_TIMEOUT, &["status", "--help"]).await.is_ok();

        if self.low_resource {
            if self.caps.vector {
                info!("low_resource_mode enabled, disabling vector capability");
            }
            self.caps.vector = false;

            if allow_cpu_deep {
                if self.caps.deep_query {
                    info!("low_resource_mode enabled, deep-query kept with CPU fallback");
                } else {
                    warn!("allow_cpu_deep_query enabled, but qmd query capability not detected");
                }
            } else {
                if self.caps.deep_query {
                    info!("low_resource_mode enabled, disabling deep-query capability");
                }
                self.caps.deep_query = false;
            }
        }

        info!(
            vector = self.caps.vector,
            deep_query = self.caps.deep_query,
            sidecar = self.caps.sidecar,
            status = self.caps.status,
            "qmd capabilities"
        );
        Ok(())
    }

    async fn run(&self, deadline: Duration, args: &[&str]) -> Result<String> {
        debug!(?args, "exec qmd");
        let child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Backend(format!("spawn {}: {e}", self.bin)))?;

        let output = timeout(deadline, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::DeadlineExceeded(format!("qmd {} after {:?}", args.join(" "), deadline))
            })?
            .map_err(|e| Error::Backend(format!("qmd {}: {e}", args.join(" "))))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(?args, stderr = %stderr, "exec qmd failed");
            return Err(Error::from_backend_message(format!(
                "qmd {}: {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    async fn exec_search(&self, args: Vec<String>, deadline: Duration) -> Result<Vec<Hit>> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(deadline, &arg_refs).await?;
        parse::parse_search_output(&out)
    }

    fn search_args(base: &[&str], query: &str, opts: &SearchOpts) -> Vec<String> {
        let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        args.push(query.to_string());
        args.push("--json".to_string());
        if !opts.collection.is_empty() {
            args.push("--collection".to_string());
            args.push(opts.collection.clone());
        }
        if opts.n > 0 {
            args.push("-n".to_string());
            args.push(opts.n.to_string());
        }
        if opts.min_score > 0.0 {
            args.push("--min-score".to_string());
            args.push(format!("{:.2}", opts.min_score));
        }
        if opts.files_only {
            args.push("--files".to_string());
        }
        if opts.files_only && opts.all {
            args.push("--all".to_string());
        }
        args
    }

    async fn acquire_query_slot(&self) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        let Some(tokens) = &self.query_tokens else {
            return Ok(None);
        };
        let permit = timeout(self.query_timeout, Arc::clone(tokens).acquire_owned())
            .await
            .map_err(|_| Error::ResourceExhausted("query queue busy".to_string()))?
            .map_err(|e| Error::ResourceExhausted(format!("query queue closed: {e}")))?;
        Ok(Some(permit))
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn search(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        let args = Self::search_args(&["search"], query, &opts);
        self.exec_search(args, DEFAULT_TIMEOUT).await
    }

    async fn vsearch(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        if !self.caps.vector {
            return Err(Error::Unavailable("vsearch not available".to_string()));
        }
        let args = Self::search_args(&["vsearch"], query, &opts);
        self.exec_search(args, DEFAULT_TIMEOUT).await
    }

    async fn query(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        if !self.caps.deep_query {
            return Err(Error::Unavailable("query not available".to_string()));
        }

        let _permit = self.acquire_query_slot().await?;

        let args = Self::search_args(&["query"], query, &opts);
        let deadline = if self.query_timeout.is_zero() {
            Duration::from_secs(120)
        } else {
            self.query_timeout
        };
        self.exec_search(args, deadline).await
    }

    async fn get(&self, doc_ref: &str, opts: GetOpts) -> Result<String> {
        let mut args = vec!["get", doc_ref];
        if opts.full {
            args.push("--full");
        }
        if opts.line_numbers {
            args.push("--line-numbers");
        }
        self.run(DEFAULT_TIMEOUT, &args).await
    }

    async fn multi_get(&self, pattern: &str, max_bytes: usize) -> Result<Vec<Document>> {
        let max_bytes_s;
        let mut args = vec!["multi-get", pattern, "--json"];
        if max_bytes > 0 {
            max_bytes_s = max_bytes.to_string();
            args.push("--max-bytes");
            args.push(&max_bytes_s);
        }
        let out = self.run(DEFAULT_TIMEOUT, &args).await?;
        serde_json::from_str(out.trim())
            .map_err(|e| Error::Parse(format!("multi-get output: {e}")))
    }

    async fn collection_add(&self, path: &str, name: &str, mask: &str) -> Result<()> {
        let mut args = vec!["collection", "add", path, "--name", name];
        if !mask.is_empty() {
            args.push("--mask");
            args.push(mask);
        }
        self.run(DEFAULT_TIMEOUT, &args).await.map(|_| ())
    }

    async fn collection_list(&self) -> Result<Vec<CollectionInfo>> {
        let out = self
            .run(DEFAULT_TIMEOUT, &["collection", "list", "--json"])
            .await?;
        parse::parse_collection_list(&out)
    }

    async fn update(&self) -> Result<()> {
        self.run(UPDATE_TIMEOUT, &["update"]).await.map(|_| ())
    }

    async fn embed(&self, force: bool) -> Result<()> {
        let mut args = vec!["embed"];
        if force {
            args.push("-f");
        }
        self.run(EMBED_TIMEOUT, &args).await.map(|_| ())
    }

    async fn context_add(&self, path: &str, description: &str) -> Result<()> {
        self.run(DEFAULT_TIMEOUT, &["context", "add", path, description])
            .await
            .map(|_| ())
    }

    async fn context_list(&self) -> Result<Vec<PathContext>> {
        let out = self
            .run(DEFAULT_TIMEOUT, &["context", "list", "--json"])
            .await?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|e| Error::Parse(format!("context list: {e}")))
    }

    async fn context_remove(&self, path: &str) -> Result<()> {
        self.run(DEFAULT_TIMEOUT, &["context", "remove", path])
            .await
            .map(|_| ())
    }

    async fn status(&self) -> Result<IndexStatus> {
        if !self.caps.status {
            return Err(Error::Unavailable("status not available".to_string()));
        }
        let out = self.run(DEFAULT_TIMEOUT, &["status", "--json"]).await?;
        let mut status = parse::parse_status(&out)?;
        status.raw = out;
        Ok(status)
    }

    async fn sidecar_start(&self) -> Result<()> {
        if !self.caps.sidecar {
            return Err(Error::Unavailable("mcp not available".to_string()));
        }
        self.run(DEFAULT_TIMEOUT, &["mcp", "--http", "--daemon"])
            .await
            .map(|_| ())
    }

    async fn sidecar_stop(&self) -> Result<()> {
        if !self.caps.sidecar {
            return Err(Error::Unavailable("mcp not available".to_string()));
        }
        self.run(DEFAULT_TIMEOUT, &["mcp", "stop"]).await.map(|_| ())
    }

    async fn sidecar_health(&self) -> Result<()> {
        if !self.caps.sidecar {
            return Err(Error::Unavailable("mcp not available".to_string()));
        }
        self.run(HEALTH_TIMEOUT, &["mcp", "health"]).await.map(|_| ())
    }

    async fn version(&self) -> Result<String> {
        match self.run(HEALTH_TIMEOUT, &["--version"]).await {
            Ok(out) => Ok(out.trim().to_string()),
            Err(version_err) => {
                if let Err(help_err) = self.run(HEALTH_TIMEOUT, &["--help"]).await {
                    return Err(Error::Unavailable(format!(
                        "qmd version check failed: {version_err}; help check failed: {help_err}"
                    )));
                }
                Ok("unknown".to_string())
            }
        }
    }

    fn has_capability(&self, cap: Capability) -> bool {
        self.caps.has(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Write a fake backend script into a tempdir and return its path.
    fn fake_backend(body: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmd");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{body}").unwrap();
        drop(f);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    fn exec_config(bin: String) -> ExecConfig {
        ExecConfig {
            bin,
            low_resource_mode: false,
            allow_cpu_deep_query: false,
            query_timeout: Duration::from_secs(5),
            query_max_concurrency: 2,
        }
    }

    #[tokio::test]
    async fn test_probe_detects_all_capabilities() {
        let (_dir, bin) = fake_backend(r#"echo "qmd 1.2.3""#);
        let exec = CliExecutor::new(exec_config(bin)).await.unwrap();
        assert!(exec.has_capability(Capability::Vector));
        assert!(exec.has_capability(Capability::DeepQuery));
        assert!(exec.has_capability(Capability::Sidecar));
        assert!(exec.has_capability(Capability::Status));
    }

    #[tokio::test]
    async fn test_probe_downgrades_missing_subcommands() {
        let (_dir, bin) = fake_backend(
            r#"case "$1" in
  vsearch|query) echo "unknown command" >&2; exit 1 ;;
  *) echo ok ;;
esac"#,
        );
        let exec = CliExecutor::new(exec_config(bin)).await.unwrap();
        assert!(!exec.has_capability(Capability::Vector));
        assert!(!exec.has_capability(Capability::DeepQuery));
        assert!(exec.has_capability(Capability::Sidecar));
    }

    #[tokio::test]
    async fn test_low_resource_suppresses_vector_and_deep() {
        let (_dir, bin) = fake_backend(r#"echo ok"#);
        let mut cfg = exec_config(bin);
        cfg.low_resource_mode = true;
        cfg.allow_cpu_deep_query = false;
        let exec = CliExecutor::new(cfg).await.unwrap();
        assert!(!exec.has_capability(Capability::Vector));
        assert!(!exec.has_capability(Capability::DeepQuery));
    }

    #[tokio::test]
    async fn test_low_resource_keeps_deep_when_cpu_deep_allowed() {
        let (_dir, bin) = fake_backend(r#"echo ok"#);
        let mut cfg = exec_config(bin);
        cfg.low_resource_mode = true;
        cfg.allow_cpu_deep_query = true;
        let exec = CliExecutor::new(cfg).await.unwrap();
        assert!(!exec.has_capability(Capability::Vector));
        assert!(exec.has_capability(Capability::DeepQuery));
    }

    #[tokio::test]
    async fn test_search_parses_json_hits() {
        let (_dir, bin) = fake_backend(
            r#"if [ "$1" = "search" ]; then
  echo '[{"title":"A","file":"qmd://notes/a.md","collection":"notes","score":0.9,"snippet":"s","docid":"d1"}]'
else
  echo ok
fi"#,
        );
        let exec = CliExecutor::new(exec_config(bin)).await.unwrap();
        let hits = exec
            .search("design doc", SearchOpts::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].collection, "notes");
    }

    #[tokio::test]
    async fn test_search_empty_output_is_not_an_error() {
        let (_dir, bin) = fake_backend(
            r#"if [ "$1" = "search" ]; then
  echo "No results found."
else
  echo ok
fi"#,
        );
        let exec = CliExecutor::new(exec_config(bin)).await.unwrap();
        let hits = exec.search("nothing", SearchOpts::default()).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_stderr() {
        let (_dir, bin) = fake_backend(
            r#"if [ "$1" = "search" ]; then
  echo "index corrupted" >&2; exit 1
else
  echo ok
fi"#,
        );
        let exec = CliExecutor::new(exec_config(bin)).await.unwrap();
        let err = exec
            .search("boom", SearchOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index corrupted"));
    }

    #[tokio::test]
    async fn test_vsearch_unavailable_without_capability() {
        let (_dir, bin) = fake_backend(
            r#"case "$1" in
  vsearch) exit 1 ;;
  *) echo ok ;;
esac"#,
        );
        let exec = CliExecutor::new(exec_config(bin)).await.unwrap();
        let err = exec
            .vsearch("anything", SearchOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
