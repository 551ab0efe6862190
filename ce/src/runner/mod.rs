//! Sandbox runner
//!
//! Nodes are saved runnable units on disk; the sandbox executes them in an
//! isolated subprocess speaking JSON over stdin/stdout, with a wall-clock
//! timeout and peak-RSS sampling.

mod node;
mod sandbox;

pub use node::{NodeMeta, NodeStore};
pub use sandbox::{RunnerError, SandboxRunner};

use serde::{Deserialize, Serialize};

/// What one execution cost and produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub latency_ms: u64,

    /// Approximated from CPU usage samples; a lower bound
    pub cpu_time_ms: u64,

    /// Peak resident set sampled at a fixed interval; a lower bound
    pub memory_mb_peak: f64,

    /// -1 when the process died without an exit code or could not run
    pub exit_code: i32,

    /// true iff exit code 0 and no timeout
    pub success: bool,

    pub timed_out: bool,

    pub stdout: String,
    pub stderr: String,
}

impl ExecutionMetrics {
    /// Compact error digest for prompts and failure reports
    pub fn error_digest(&self, max_chars: usize) -> String {
        let mut digest = String::new();
        if self.timed_out {
            digest.push_str("timed out; ");
        }
        digest.push_str(&format!("exit {}", self.exit_code));
        if !self.stderr.trim().is_empty() {
            digest.push_str("; stderr: ");
            digest.push_str(self.stderr.trim());
        } else if !self.stdout.trim().is_empty() {
            digest.push_str("; stdout: ");
            digest.push_str(self.stdout.trim());
        }
        if digest.chars().count() > max_chars {
            digest = digest.chars().take(max_chars).collect::<String>() + "...";
        }
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_digest_prefers_stderr() {
        let metrics = ExecutionMetrics {
            exit_code: 1,
            stderr: "NameError: name 'sys' is not defined".to_string(),
            stdout: "partial".to_string(),
            ..Default::default()
        };
        let digest = metrics.error_digest(200);
        assert!(digest.contains("exit 1"));
        assert!(digest.contains("NameError"));
        assert!(!digest.contains("partial"));
    }

    #[test]
    fn test_error_digest_truncates() {
        let metrics = ExecutionMetrics {
            exit_code: 1,
            stderr: "x".repeat(1000),
            ..Default::default()
        };
        let digest = metrics.error_digest(50);
        assert!(digest.chars().count() <= 53);
        assert!(digest.ends_with("..."));
    }

    #[test]
    fn test_error_digest_timeout_marker() {
        let metrics = ExecutionMetrics {
            timed_out: true,
            exit_code: -1,
            ..Default::default()
        };
        assert!(metrics.error_digest(100).starts_with("timed out"));
    }
}
