use crate::error::{PipelineError, Result};
use crate::scraper::ScraperRuntime;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Executes stored scraper code in an interpreter subprocess. The code is
/// handed to the interpreter through its eval flag, the source configuration
/// arrives on the child's stdin as JSON, and the child writes
/// `{"events": [...]}` to stdout. The child is killed when the deadline
/// passes.
pub struct SubprocessRuntime {
    interpreter: String,
    /// Flag that makes the interpreter evaluate its next argument as code
    /// ("-e" for node, "-c" for python).
    eval_flag: String,
}

#[derive(Deserialize)]
struct ScrapeOutput {
    events: Vec<serde_json::Value>,
}

impl SubprocessRuntime {
    pub fn new(interpreter: impl Into<String>, eval_flag: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            eval_flag: eval_flag.into(),
        }
    }
}

#[async_trait]
impl ScraperRuntime for SubprocessRuntime {
    async fn run(
        &self,
        code: &str,
        config: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>> {
        let mut child = Command::new(&self.interpreter)
            .arg(&self.eval_flag)
            .arg(code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::external(
                    "scraper-runtime",
                    format!("failed to spawn {}: {}", self.interpreter, e),
                    false,
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let config_bytes = serde_json::to_vec(config)?;
            stdin.write_all(&config_bytes).await?;
            // Close stdin so the child sees EOF on its config stream.
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                PipelineError::external("scraper-runtime", e.to_string(), true)
            })?,
            Err(_) => {
                // kill_on_drop reaps the child; its partial output is discarded.
                warn!("Scraper subprocess exceeded {}s deadline", timeout.as_secs());
                return Err(PipelineError::Timeout(timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::external(
                "scraper-runtime",
                format!(
                    "scraper exited with {}: {}",
                    output.status,
                    stderr.chars().take(500).collect::<String>()
                ),
                false,
            ));
        }

        let parsed: ScrapeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            PipelineError::external(
                "scraper-runtime",
                format!("scraper output was not valid JSON: {}", e),
                false,
            )
        })?;

        debug!("Scraper subprocess produced {} raw events", parsed.events.len());
        Ok(parsed.events)
    }
}
