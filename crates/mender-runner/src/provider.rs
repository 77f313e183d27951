//! Language-model provider abstraction.
//!
//! A provider is an external coding agent invoked as a subprocess. It is
//! free to mutate the working copy; all we get back is text plus accounting.

use anyhow::Result;
use async_trait::async_trait;
use mender_core::config::LlmConfig;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Returned when a provider subprocess was killed by cancellation. Expected
/// during shutdown; never treated as a job failure.
#[derive(Debug, Error)]
#[error("provider invocation cancelled")]
pub struct Cancelled;

/// Result of one provider invocation.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    /// Commit created by the agent itself, if it reported one.
    pub commit_sha: Option<String>,
    /// Structured transcript file written by the agent, if any.
    pub jsonl_path: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Invoke the agent in `work_dir`. Cancellation terminates the
    /// subprocess and yields `Err(Cancelled)`.
    async fn run(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
        prompt: &str,
    ) -> Result<ProviderResponse>;
}

/// Select the configured provider variant.
pub fn provider_from_config(cfg: &LlmConfig) -> Result<Arc<dyn Provider>> {
    match cfg.provider.as_str() {
        "claude" => Ok(Arc::new(crate::claude::ClaudeCli::new())),
        "codex" => Ok(Arc::new(crate::codex::CodexCli::new())),
        other => anyhow::bail!("unsupported llm.provider: {other:?}"),
    }
}

/// Escape a prompt for single-quoted shell interpolation.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
