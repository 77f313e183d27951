//! Claude Code CLI provider.
//!
//! Spawns `claude -p "prompt" --output-format json` in the working copy.
//! The agent has full file/terminal/git access there; the JSON envelope on
//! stdout carries the final text and token usage.

use crate::provider::{Cancelled, Provider, ProviderResponse, shell_quote};
use crate::subprocess::run_cmd;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Ceiling for a single agent session.
const CLAUDE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ClaudeCli {
    pub timeout: Duration,
}

impl ClaudeCli {
    pub fn new() -> Self {
        Self {
            timeout: CLAUDE_TIMEOUT,
        }
    }
}

impl Default for ClaudeCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ClaudeCli {
    fn name(&self) -> &str {
        "claude"
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
        prompt: &str,
    ) -> Result<ProviderResponse> {
        let cmd = format!(
            "claude -p {} --output-format json --dangerously-skip-permissions",
            shell_quote(prompt)
        );
        tracing::info!(prompt_len = prompt.len(), work_dir = %work_dir.display(), "invoking claude CLI");

        let started = std::time::Instant::now();
        let output = run_cmd(&cmd, work_dir, self.timeout, cancel).await?;
        if output.cancelled {
            return Err(Cancelled.into());
        }
        if output.timed_out {
            anyhow::bail!("claude CLI timed out after {:?}", self.timeout);
        }
        if output.exit_code != 0 {
            anyhow::bail!(
                "claude CLI exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }

        let mut response = parse_claude_output(&output.stdout);
        if response.duration_ms == 0 {
            response.duration_ms = started.elapsed().as_millis() as i64;
        }
        Ok(response)
    }
}

/// Pull text and usage out of the CLI's JSON envelope, falling back to raw
/// stdout when the output is not JSON.
fn parse_claude_output(stdout: &str) -> ProviderResponse {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return ProviderResponse {
            text: stdout.to_string(),
            ..Default::default()
        };
    };

    let text = json
        .get("result")
        .and_then(|v| v.as_str())
        .unwrap_or(stdout)
        .to_string();
    let usage = json.get("usage");
    let token = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    };

    ProviderResponse {
        text,
        input_tokens: token("input_tokens"),
        output_tokens: token("output_tokens"),
        duration_ms: json
            .get("duration_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        commit_sha: None,
        jsonl_path: None,
    }
}
