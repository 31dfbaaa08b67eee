//! Engine process supervision.
//!
//! Launch mode spawns an engine executable told to wait for a debugger,
//! then scans its stdout for the console-server announcement line to
//! learn which port to attach to. A launch that never announces a port
//! within the deadline is torn down, process tree included, so no
//! half-started engine outlives a failed launch.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::AdapterError;

/// Stdout line announcing the engine's console server.
const PORT_ANNOUNCEMENT: &str = r"Started console server \((\d+)\)";

/// How a launch is performed.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub toolchain_root: PathBuf,
    /// Passed to the engine as `--wait-for-debugger <secs>` and used as
    /// our own scan deadline.
    pub wait_timeout: Duration,
    pub extra_args: Vec<String>,
}

/// A successfully launched engine, holding the child for teardown.
#[derive(Debug)]
pub struct LaunchedEngine {
    child: Child,
    pub port: u16,
}

impl LaunchedEngine {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the engine and everything it spawned.
    pub async fn kill_tree(&mut self) {
        if let Some(pid) = self.child.id() {
            kill_process_tree(pid);
        }
        if let Err(err) = self.child.kill().await {
            tracing::debug!(%err, "engine child already gone");
        }
        let _ = self.child.wait().await;
    }
}

/// Spawn the engine and wait for its console-server port.
pub async fn launch(spec: &LaunchSpec) -> Result<LaunchedEngine, AdapterError> {
    let wait_secs = spec.wait_timeout.as_secs().max(1);
    let mut command = Command::new(&spec.executable);
    command
        .arg("--wait-for-debugger")
        .arg(wait_secs.to_string())
        .arg("--toolchain")
        .arg(&spec.toolchain_root)
        .arg("--no-compile")
        .args(&spec.extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    tracing::info!(exe = %spec.executable.display(), "spawning engine");
    let mut child = command.spawn().map_err(|err| {
        AdapterError::Launch(format!("cannot spawn {}: {err}", spec.executable.display()))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Launch("engine stdout not captured".into()))?;

    match tokio::time::timeout(spec.wait_timeout, scan_for_port(stdout)).await {
        Ok(Some(port)) => {
            tracing::info!(port, "engine console server is up");
            Ok(LaunchedEngine { child, port })
        }
        Ok(None) => {
            teardown(&mut child).await;
            Err(AdapterError::Launch(
                "engine exited before announcing its console server".into(),
            ))
        }
        Err(_) => {
            teardown(&mut child).await;
            Err(AdapterError::Launch(format!(
                "engine did not announce a console server within {wait_secs}s"
            )))
        }
    }
}

/// Read stdout lines until the announcement appears or the pipe ends.
/// Lines after the port is found keep draining in a background task so
/// the engine never blocks on a full pipe.
async fn scan_for_port(stdout: tokio::process::ChildStdout) -> Option<u16> {
    let pattern = Regex::new(PORT_ANNOUNCEMENT).expect("announcement regex is valid");
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(target: "glint_adapter::engine_stdout", "{line}");
        if let Some(captures) = pattern.captures(&line) {
            if let Ok(port) = captures[1].parse::<u16>() {
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::trace!(target: "glint_adapter::engine_stdout", "{line}");
                    }
                });
                return Some(port);
            }
        }
    }
    None
}

async fn teardown(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_process_tree(pid);
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(%err, "engine child already gone");
    }
    let _ = child.wait().await;
}

/// The launched child leads its own process group, so group-wide
/// SIGKILL reaches whatever it spawned.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!(pid, %err, "killpg failed");
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .status();
    if let Err(err) = status {
        tracing::warn!(pid, %err, "taskkill failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_engine(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spec(executable: PathBuf, dir: &tempfile::TempDir, timeout: Duration) -> LaunchSpec {
        LaunchSpec {
            executable,
            toolchain_root: dir.path().to_path_buf(),
            wait_timeout: timeout,
            extra_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn launch_reads_announced_port() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_engine(&dir, "echo 'booting'\necho 'Started console server (14007)'\nsleep 30");
        let mut engine = launch(&spec(exe, &dir, Duration::from_secs(10))).await.unwrap();
        assert_eq!(engine.port, 14007);
        assert!(engine.pid().is_some());
        engine.kill_tree().await;
    }

    #[tokio::test]
    async fn launch_times_out_and_kills_the_tree() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let exe = fake_engine(
            &dir,
            &format!("echo $$ > {}\necho 'no port here'\nsleep 30", pid_file.display()),
        );
        let started = std::time::Instant::now();
        let err = launch(&spec(exe, &dir, Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Launch(_)));
        // The child must be gone well before its 30s sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(kill(Pid::from_raw(pid), None).is_err(), "child still alive");
    }

    #[tokio::test]
    async fn launch_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = launch(&spec(dir.path().join("missing"), &dir, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot spawn"));
    }

    #[tokio::test]
    async fn launch_detects_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_engine(&dir, "echo 'crash'\nexit 3");
        let err = launch(&spec(exe, &dir, Duration::from_secs(10))).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
