//! Artifact generation: turning a repository into its text summary.

use std::process::Stdio;

use async_trait::async_trait;
use reposcrape_shared::{GeneratorConfig, RepositoryDescriptor, ReposcrapeError, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tracing::{debug, warn};

const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Produces the summary content for one repository.
///
/// Implementations need not enforce a deadline; the orchestrator wraps every
/// call in its own timeout and drops the future when it elapses.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, repo: &RepositoryDescriptor) -> Result<String>;
}

/// Runs an external program per repository and takes its stdout as content.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
    max_output_bytes: usize,
}

impl From<&GeneratorConfig> for CommandGenerator {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, args: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            command: command.into(),
            args,
            max_output_bytes,
        }
    }

    /// Arguments with `{url}`, `{org}` and `{name}` filled in.
    fn render_args(&self, repo: &RepositoryDescriptor) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", &repo.url)
                    .replace("{org}", &repo.org)
                    .replace("{name}", &repo.name)
            })
            .collect()
    }
}

#[async_trait]
impl ArtifactGenerator for CommandGenerator {
    async fn generate(&self, repo: &RepositoryDescriptor) -> Result<String> {
        let args = self.render_args(repo);
        debug!(command = %self.command, ?args, "spawning generator");

        // kill_on_drop: a timed-out future takes the child down with it.
        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ReposcrapeError::Generation(format!("failed to spawn '{}': {e}", self.command))
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ReposcrapeError::Generation("generator pipes unavailable".into()));
        };
        let stderr_tail = tokio::spawn(read_tail(stderr));

        let mut output = Vec::new();
        stdout
            .take(self.max_output_bytes as u64 + 1)
            .read_to_end(&mut output)
            .await
            .map_err(|e| ReposcrapeError::Generation(format!("failed to read output: {e}")))?;

        if output.len() > self.max_output_bytes {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill generator");
            }
            return Err(ReposcrapeError::Generation(format!(
                "output exceeds limit of {} bytes",
                self.max_output_bytes
            )));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ReposcrapeError::Generation(format!("failed to wait for generator: {e}")))?;

        if !status.success() {
            let stderr = stderr_tail.await.unwrap_or_default();
            let stderr = String::from_utf8_lossy(&stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            return Err(ReposcrapeError::Generation(format!(
                "'{}' exited with {status}: {tail}",
                self.command
            )));
        }

        let content = String::from_utf8_lossy(&output).into_owned();
        if content.trim().is_empty() {
            return Err(ReposcrapeError::Generation("generator produced no output".into()));
        }
        Ok(content)
    }
}

/// Drain `stderr` to EOF, keeping only the last `STDERR_TAIL_BYTES`.
async fn read_tail(mut stderr: ChildStderr) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    tail
}
