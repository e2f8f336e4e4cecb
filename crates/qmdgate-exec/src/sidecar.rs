//! JSON-RPC sidecar executor.
//!
//! The backend can run an HTTP sidecar exposing the retrieval primitives as
//! JSON-RPC 2.0 `tools/call` methods (`qmd_search`, `qmd_vector_search`,
//! `qmd_deep_search`). This executor routes those three operations through
//! the sidecar and falls back to the wrapped CLI transport when the sidecar
//! call fails; every other operation always goes through the CLI.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use qmdgate_core::{
    Capability, CollectionInfo, Document, Error, Executor, GetOpts, Hit, IndexStatus, PathContext,
    Result, SearchOpts,
};

use crate::cli::CliExecutor;
use crate::parse;

#[derive(Serialize)]
struct ToolCall {
    jsonrpc: &'static str,
    method: &'static str,
    params: ToolParams,
    id: u32,
}

#[derive(Serialize)]
struct ToolParams {
    name: String,
    arguments: Value,
}

#[derive(Deserialize)]
struct ToolResponse {
    #[serde(default)]
    result: Option<ToolResult>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct ToolResult {
    #[serde(default)]
    content: Vec<ToolContent>,
}

#[derive(Deserialize)]
struct ToolContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Executor that prefers the JSON-RPC sidecar for retrieval primitives.
pub struct SidecarExecutor {
    cli: CliExecutor,
    base_url: String,
    client: reqwest::Client,
}

impl SidecarExecutor {
    pub fn new(cli: CliExecutor, port: u16) -> Self {
        Self {
            cli,
            base_url: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<String> {
        let call = ToolCall {
            jsonrpc: "2.0",
            method: "tools/call",
            params: ToolParams {
                name: tool.to_string(),
                arguments,
            },
            id: 1,
        };

        let resp = self
            .client
            .post(format!("{}/mcp", self.base_url))
            .json(&call)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("sidecar call {tool}: {e}")))?;

        let body: ToolResponse = resp
            .json()
            .await
            .map_err(|e| Error::Parse(format!("sidecar response: {e}")))?;

        if let Some(err) = body.error {
            return Err(Error::from_backend_message(format!(
                "sidecar error {}: {}",
                err.code, err.message
            )));
        }

        Ok(body
            .result
            .and_then(|r| r.content.into_iter().next())
            .map(|c| c.text)
            .unwrap_or_default())
    }

    fn tool_arguments(query: &str, opts: &SearchOpts) -> Value {
        let mut args = json!({ "query": query });
        if !opts.collection.is_empty() {
            args["collection"] = json!(opts.collection);
        }
        if opts.n > 0 {
            args["n"] = json!(opts.n);
        }
        args
    }

    async fn sidecar_search(&self, tool: &str, query: &str, opts: &SearchOpts) -> Result<Vec<Hit>> {
        let text = self.call_tool(tool, Self::tool_arguments(query, opts)).await?;
        parse::parse_search_output(&text)
    }
}

#[async_trait]
impl Executor for SidecarExecutor {
    async fn search(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        match self.sidecar_search("qmd_search", query, &opts).await {
            Ok(hits) => Ok(hits),
            Err(err) => {
                warn!(%err, "sidecar search failed, falling back to cli");
                self.cli.search(query, opts).await
            }
        }
    }

    async fn vsearch(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        if !self.cli.has_capability(Capability::Vector) {
            return Err(Error::Unavailable("vsearch not available".to_string()));
        }
        match self.sidecar_search("qmd_vector_search", query, &opts).await {
            Ok(hits) => Ok(hits),
            Err(err) => {
                warn!(%err, "sidecar vsearch failed, falling back to cli");
                self.cli.vsearch(query, opts).await
            }
        }
    }

    async fn query(&self, query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        if !self.cli.has_capability(Capability::DeepQuery) {
            return Err(Error::Unavailable("query not available".to_string()));
        }
        match self.sidecar_search("qmd_deep_search", query, &opts).await {
            Ok(hits) => Ok(hits),
            Err(err) => {
                debug!(%err, "sidecar deep query failed, falling back to cli");
                self.cli.query(query, opts).await
            }
        }
    }

    async fn get(&self, doc_ref: &str, opts: GetOpts) -> Result<String> {
        self.cli.get(doc_ref, opts).await
    }

    async fn multi_get(&self, pattern: &str, max_bytes: usize) -> Result<Vec<Document>> {
        self.cli.multi_get(pattern, max_bytes).await
    }

    async fn collection_add(&self, path: &str, name: &str, mask: &str) -> Result<()> {
        self.cli.collection_add(path, name, mask).await
    }

    async fn collection_list(&self) -> Result<Vec<CollectionInfo>> {
        self.cli.collection_list().await
    }

    async fn update(&self) -> Result<()> {
        self.cli.update().await
    }

    async fn embed(&self, force: bool) -> Result<()> {
        self.cli.embed(force).await
    }

    async fn context_add(&self, path: &str, description: &str) -> Result<()> {
        self.cli.context_add(path, description).await
    }

    async fn context_list(&self) -> Result<Vec<PathContext>> {
        self.cli.context_list().await
    }

    async fn context_remove(&self, path: &str) -> Result<()> {
        self.cli.context_remove(path).await
    }

    async fn status(&self) -> Result<IndexStatus> {
        self.cli.status().await
    }

    async fn sidecar_start(&self) -> Result<()> {
        self.cli.sidecar_start().await
    }

    async fn sidecar_stop(&self) -> Result<()> {
        self.cli.sidecar_stop().await
    }

    async fn sidecar_health(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("sidecar health check failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Unavailable(format!(
                "sidecar health check returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        self.cli.version().await
    }

    fn has_capability(&self, cap: Capability) -> bool {
        self.cli.has_capability(cap)
    }
}
