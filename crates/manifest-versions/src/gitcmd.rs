use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, PublishError, Result};

const MAX_LOG_CHARS: usize = 2048;

/// Bounded retry for git operations that can fail transiently (network
/// blips, server hiccups). Conflict-class failures are never retried here;
/// they belong to the caller's resync-and-recompute loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitRunner {
    pub retry: RetryPolicy,
}

impl GitRunner {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Run git in `dir` and return stdout. Non-zero exit becomes an error
    /// carrying the most useful output stream.
    pub fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.output(dir, args)?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "git {} failed: {}",
                args.join(" "),
                command_summary(&out)
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Like [`git`](Self::git) but retries transient failures with a short
    /// linear backoff. Meant for network-touching operations (clone, fetch).
    pub fn git_retry(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let mut last = String::new();
        for attempt in 1..=self.retry.max_attempts {
            let out = self.output(dir, args)?;
            if out.status.success() {
                return Ok(String::from_utf8_lossy(&out.stdout).trim().to_string());
            }
            last = command_summary(&out);
            warn!(
                attempt,
                max = self.retry.max_attempts,
                "git {} failed: {last}",
                args.join(" ")
            );
            if attempt < self.retry.max_attempts {
                std::thread::sleep(self.retry.delay_for_attempt(attempt));
            }
        }
        Err(Error::msg(format!(
            "git {} failed after {} attempts: {last}",
            args.join(" "),
            self.retry.max_attempts
        )))
    }

    /// Push with transient retry at this layer; rejection because the remote
    /// advanced is reported as `Conflict` immediately so the caller can
    /// resync and recompute instead of hammering the same push.
    pub fn push(&self, dir: &Path, args: &[&str]) -> std::result::Result<(), PublishError> {
        let mut last = String::new();
        for attempt in 1..=self.retry.max_attempts {
            let out = self
                .output(dir, args)
                .map_err(|e| PublishError::Fatal(e.to_string()))?;
            if out.status.success() {
                return Ok(());
            }
            last = command_summary(&out);
            if is_push_conflict_text(&last) {
                return Err(PublishError::Conflict(last));
            }
            warn!(
                attempt,
                max = self.retry.max_attempts,
                "git push failed: {last}"
            );
            if attempt < self.retry.max_attempts {
                std::thread::sleep(self.retry.delay_for_attempt(attempt));
            }
        }
        Err(PublishError::Transient(last))
    }

    fn output(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        debug!("running git {} in {}", args.join(" "), dir.display());
        cmd.output()
            .map_err(|e| Error::msg(format!("failed to run git {}: {e}", args.join(" "))))
    }
}

/// Bring `dir` to the tip of `remote`'s `branch`, cloning on first use.
/// Anything a previous aborted attempt left in the working tree is
/// discarded. An empty remote leaves a fresh local branch in place so the
/// first publish can bootstrap it.
pub fn sync_checkout(runner: &GitRunner, dir: &Path, remote: &str, branch: &str) -> Result<()> {
    if !dir.join(".git").exists() {
        crate::util::ensure_dir(dir)?;
        runner.git_retry(dir, &["clone", remote, "."])?;
    } else {
        runner.git_retry(dir, &["fetch", "origin"])?;
    }

    let upstream = format!("origin/{branch}");
    if runner
        .git(dir, &["rev-parse", "--verify", upstream.as_str()])
        .is_ok()
    {
        runner.git(dir, &["checkout", "-B", branch, upstream.as_str()])?;
        runner.git(dir, &["reset", "--hard", upstream.as_str()])?;
    } else {
        runner.git(dir, &["checkout", "-B", branch])?;
    }
    runner.git(dir, &["clean", "-fd"])?;
    Ok(())
}

fn command_summary(out: &Output) -> String {
    let stderr = sanitize_output(&String::from_utf8_lossy(&out.stderr));
    let stdout = sanitize_output(&String::from_utf8_lossy(&out.stdout));
    if !stderr.is_empty() {
        return stderr;
    }
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

/// Push rejections caused by the remote moving underneath us. Git phrases
/// this a few different ways depending on version and server.
pub fn is_push_conflict_text(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("non-fast-forward")
        || m.contains("fetch first")
        || m.contains("cannot lock ref")
        || m.contains("stale info")
        || m.contains("remote rejected")
}

// Subprocess output ends up in terminal logs; strip escape sequences and
// control characters before it gets there.
fn sanitize_output(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut in_escape = false;
    let mut count = 0usize;
    for c in input.trim().chars() {
        if in_escape {
            // CSI/OSC terminators; good enough for git's output.
            if c.is_ascii_alphabetic() || c == '\x07' {
                in_escape = false;
            }
            continue;
        }
        if c == '\x1b' {
            in_escape = true;
            continue;
        }
        if c == '\n' {
            out.push(' ');
        } else if c == '\t' {
            out.push(' ');
        } else if c.is_control() {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out.trim().to_string()
}
