//! Codex CLI provider.
//!
//! Spawns `codex exec --json "prompt"`. Output is JSONL; the last
//! `agent_message` item carries the final text.

use crate::provider::{Cancelled, Provider, ProviderResponse, shell_quote};
use crate::subprocess::run_cmd;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CODEX_TIMEOUT: Duration = Duration::from_secs(600);

pub struct CodexCli {
    pub timeout: Duration,
}

impl CodexCli {
    pub fn new() -> Self {
        Self {
            timeout: CODEX_TIMEOUT,
        }
    }
}

impl Default for CodexCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for CodexCli {
    fn name(&self) -> &str {
        "codex"
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
        prompt: &str,
    ) -> Result<ProviderResponse> {
        let cmd = format!(
            "codex exec --json --skip-git-repo-check {}",
            shell_quote(prompt)
        );
        tracing::info!(prompt_len = prompt.len(), work_dir = %work_dir.display(), "invoking codex CLI");

        let started = std::time::Instant::now();
        let output = run_cmd(&cmd, work_dir, self.timeout, cancel).await?;
        if output.cancelled {
            return Err(Cancelled.into());
        }
        if output.timed_out {
            anyhow::bail!("codex CLI timed out after {:?}", self.timeout);
        }
        if output.exit_code != 0 {
            anyhow::bail!(
                "codex CLI exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }

        Ok(ProviderResponse {
            text: parse_codex_output(&output.stdout),
            duration_ms: started.elapsed().as_millis() as i64,
            ..Default::default()
        })
    }
}

/// Extract the last agent message from codex JSONL output, falling back to
/// raw stdout.
fn parse_codex_output(stdout: &str) -> String {
    let mut last_message: Option<String> = None;
    for line in stdout.lines() {
        let Ok(item) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let msg = item.get("msg").unwrap_or(&item);
        if msg.get("type").and_then(|t| t.as_str()) == Some("agent_message") {
            if let Some(text) = msg.get("message").and_then(|m| m.as_str()) {
                last_message = Some(text.to_string());
            }
        }
    }
    last_message.unwrap_or_else(|| stdout.to_string())
}
