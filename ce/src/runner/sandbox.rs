//! Subprocess sandbox
//!
//! Runs a node (or any argv) in its own process group, feeds one JSON
//! object on stdin, and collects stdout/stderr with a wall-clock timeout.
//! On timeout the whole group is killed within a one-second grace period.
//! Peak RSS is sampled at a fixed interval, so the reported value is a
//! lower bound on the true peak.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionMetrics, NodeStore};
use crate::config::RunnerConfig;

/// How long a killed process gets to die before we stop waiting
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Errors where the runner itself failed, as opposed to the child failing
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn process: {0}")]
    Spawn(std::io::Error),

    #[error("Failed to talk to process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Runner has no interpreter configured")]
    NoInterpreter,
}

/// Executes nodes and commands under resource supervision
pub struct SandboxRunner {
    config: RunnerConfig,
    nodes: NodeStore,
}

impl SandboxRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let nodes = NodeStore::new(config.nodes_dir.clone());
        Self { config, nodes }
    }

    /// The node store this runner executes from
    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    /// Run a saved node with the given stdin payload
    pub async fn run_node(
        &self,
        node_id: &str,
        input_json: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecutionMetrics, RunnerError> {
        if !self.nodes.exists(node_id) {
            return Err(RunnerError::UnknownNode(node_id.to_string()));
        }
        let Some((program, args)) = self.config.interpreter.split_first() else {
            return Err(RunnerError::NoInterpreter);
        };

        let mut argv: Vec<String> = Vec::with_capacity(self.config.interpreter.len() + 1);
        argv.push(program.clone());
        argv.extend(args.iter().cloned());
        argv.push(self.nodes.source_path(node_id).display().to_string());

        let timeout_ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let metrics = self.run_command(&argv, input_json, timeout_ms).await?;

        if let Err(e) = self.nodes.record_metrics(node_id, &metrics) {
            warn!(node_id, error = %e, "Failed to record node metrics");
        }
        Ok(metrics)
    }

    /// Run an arbitrary argv under supervision
    pub async fn run_command(
        &self,
        argv: &[String],
        input: &str,
        timeout_ms: u64,
    ) -> Result<ExecutionMetrics, RunnerError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(RunnerError::NoInterpreter);
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(RunnerError::Spawn)?;

        let pid = child.id().unwrap_or(0);
        let start = Instant::now();

        // Feed stdin from a task so a child that writes before reading
        // cannot deadlock us on a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.to_string();
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf).await;
                buf
            })
        });

        let (sampler_stop, peak_bytes, cpu_micros) = self.spawn_sampler(pid);

        let timeout = Duration::from_millis(timeout_ms);
        let mut timed_out = false;
        let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1),
            Err(_) => {
                timed_out = true;
                kill_process_group(pid);
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1),
                    Err(_) => {
                        warn!(pid, "Process survived SIGKILL grace period");
                        -1
                    }
                }
            }
        };

        sampler_stop.store(true, Ordering::SeqCst);
        let latency_ms = start.elapsed().as_millis() as u64;

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let metrics = ExecutionMetrics {
            latency_ms,
            cpu_time_ms: cpu_micros.load(Ordering::SeqCst) / 1000,
            memory_mb_peak: peak_bytes.load(Ordering::SeqCst) as f64 / (1024.0 * 1024.0),
            exit_code,
            success: exit_code == 0 && !timed_out,
            timed_out,
            stdout,
            stderr,
        };

        debug!(
            latency_ms = metrics.latency_ms,
            exit_code = metrics.exit_code,
            timed_out = metrics.timed_out,
            memory_mb_peak = metrics.memory_mb_peak,
            "Run complete"
        );
        Ok(metrics)
    }

    /// Sample peak RSS and approximate CPU time until stopped
    fn spawn_sampler(&self, pid: u32) -> (Arc<AtomicBool>, Arc<AtomicU64>, Arc<AtomicU64>) {
        let stop = Arc::new(AtomicBool::new(false));
        let peak_bytes = Arc::new(AtomicU64::new(0));
        let cpu_micros = Arc::new(AtomicU64::new(0));

        let stop_flag = stop.clone();
        let peak = peak_bytes.clone();
        let cpu = cpu_micros.clone();
        let interval_ms = self.config.sample_interval_ms.max(10);

        tokio::spawn(async move {
            let mut sys = System::new();
            let sys_pid = SysPid::from_u32(pid);
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
                let Some(process) = sys.process(sys_pid) else { break };
                peak.fetch_max(process.memory(), Ordering::SeqCst);
                let share = f64::from(process.cpu_usage()) / 100.0;
                cpu.fetch_add((share * interval_ms as f64 * 1000.0) as u64, Ordering::SeqCst);
            }
        });

        (stop, peak_bytes, cpu_micros)
    }
}

/// SIGKILL the whole process group so grandchildren die too
fn kill_process_group(pid: u32) {
    if pid == 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(pid, error = %e, "Failed to kill process group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn runner_at(dir: &std::path::Path) -> SandboxRunner {
        SandboxRunner::new(RunnerConfig {
            interpreter: vec!["sh".to_string()],
            nodes_dir: dir.to_path_buf(),
            default_timeout_ms: 5_000,
            memory_limit_mb: 512,
            sample_interval_ms: 20,
        })
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_stdin_flows_to_stdout() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        let metrics = runner
            .run_command(&argv(&["sh", "-c", "cat"]), r#"{"a":5,"b":3}"#, 5_000)
            .await
            .unwrap();

        assert!(metrics.success);
        assert_eq!(metrics.exit_code, 0);
        assert_eq!(metrics.stdout, r#"{"a":5,"b":3}"#);
        assert!(!metrics.timed_out);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_success() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        let metrics = runner
            .run_command(&argv(&["sh", "-c", "exit 3"]), "", 5_000)
            .await
            .unwrap();

        assert_eq!(metrics.exit_code, 3);
        assert!(!metrics.success);
    }

    #[tokio::test]
    async fn test_stderr_captured_separately() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        let metrics = runner
            .run_command(&argv(&["sh", "-c", "echo out; echo err >&2"]), "", 5_000)
            .await
            .unwrap();

        assert_eq!(metrics.stdout.trim(), "out");
        assert_eq!(metrics.stderr.trim(), "err");
    }

    #[tokio::test]
    #[serial]
    async fn test_timeout_kills_within_grace() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        let start = Instant::now();
        let metrics = runner
            .run_command(&argv(&["sh", "-c", "sleep 10"]), "", 200)
            .await
            .unwrap();

        assert!(metrics.timed_out);
        assert!(!metrics.success);
        assert!(
            start.elapsed() < Duration::from_millis(200) + KILL_GRACE + Duration::from_millis(500),
            "kill happened within the grace period"
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_runner_error() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        let result = runner
            .run_command(&argv(&["definitely-not-a-real-binary-4761"]), "", 1_000)
            .await;
        assert!(matches!(result, Err(RunnerError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_run_node_roundtrip() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        // An "sh node": reads stdin, echoes a JSON object
        let meta = runner
            .nodes()
            .save("cat > /dev/null\necho '{\"result\":8}'", None, "adder", "adds", None)
            .unwrap();

        let metrics = runner
            .run_node(&meta.node_id, r#"{"a":5,"b":3}"#, None)
            .await
            .unwrap();

        assert!(metrics.success);
        assert_eq!(metrics.stdout.trim(), r#"{"result":8}"#);

        // The run was recorded against the node
        let (loaded, _) = runner.nodes().load(&meta.node_id).unwrap();
        assert!(loaded.last_metrics.unwrap().success);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let dir = tempdir().unwrap();
        let runner = runner_at(dir.path());

        let result = runner.run_node("node-nope", "{}", None).await;
        assert!(matches!(result, Err(RunnerError::UnknownNode(_))));
    }
}
