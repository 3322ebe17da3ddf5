//! Process spawning and signalling.
//!
//! Dev servers are spawned in their own process group with piped output so the relay
//! can fan it out, and are stopped by signalling the whole group (bundlers fork
//! workers that would otherwise outlive the wrapper).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

use crate::events::ProcessSignal;
use crate::output::{echo_chunk, OutputChunk, StreamKind};

const READ_CHUNK: usize = 8 * 1024;

/// A fully resolved program invocation for a dev server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Spawns a dev server with piped stdout/stderr in a new process group.
pub fn spawn_dev_server(plan: &LaunchPlan) -> std::io::Result<Child> {
    let mut command = Command::new(&plan.program);
    command
        .args(&plan.args)
        .current_dir(&plan.cwd)
        .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(false);

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command.spawn()
}

/// Sends `signal` to the process group led by `pid`, then to `pid` itself.
#[cfg(unix)]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
pub fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) probes for existence; EPERM means it exists under another user.
    unsafe {
        if libc::kill(pid as i32, 0) == 0 {
            return true;
        }
        matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(code) if code == libc::EPERM
        )
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

pub async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> Result<Option<std::process::ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

/// Sends SIGTERM to the child's group, escalating to SIGKILL after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        send_os_signal(pid, ProcessSignal::SigTerm);
    }
    match wait_for_exit(child, grace).await {
        Ok(Some(status)) => return Some(status),
        Ok(None) => {}
        Err(err) => tracing::debug!(error = %err, "wait after SIGTERM failed"),
    }
    if let Some(pid) = child.id() {
        send_os_signal(pid, ProcessSignal::SigKill);
    }
    let _ = child.kill().await;
    child.wait().await.ok()
}

/// Reads raw chunks from a child stream and broadcasts them, optionally echoing to the host.
pub async fn pump_stream<R>(
    reader: R,
    stream: StreamKind,
    tx: broadcast::Sender<OutputChunk>,
    echo: bool,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = OutputChunk {
            stream,
            data: Bytes::copy_from_slice(&buf[..n]),
        };
        if echo {
            echo_chunk(&chunk).await;
        }
        // No receivers just means nobody is attached right now.
        let _ = tx.send(chunk);
    }
}

/// Runs a one-shot command to completion, failing on a non-zero exit or timeout.
pub async fn run_to_completion(
    cmdline: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<()> {
    let Some((program, args)) = cmdline.split_first() else {
        bail!("empty command");
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let shown = shell_words::join(cmdline);
    tracing::info!(command = %shown, cwd = %cwd.display(), "running");
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| format!("{} timed out after {}ms", shown, timeout.as_millis()))?
        .with_context(|| format!("failed to run {}", shown))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} exited {}: {}",
            shown,
            output.status.code().unwrap_or(1),
            stderr.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_plan_display_quotes_arguments() {
        let plan = LaunchPlan {
            program: PathBuf::from("/app/node_modules/.bin/vite"),
            args: vec!["--port".into(), "5173".into(), "a b".into()],
            cwd: PathBuf::from("/app"),
            env: Vec::new(),
        };
        assert_eq!(plan.display(), "/app/node_modules/.bin/vite --port 5173 'a b'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LaunchPlan {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "sleep 30 & wait".into()],
            cwd: dir.path().to_path_buf(),
            env: Vec::new(),
        };
        let mut child = spawn_dev_server(&plan).unwrap();
        let pid = child.id().unwrap();
        assert!(pid_alive(pid));
        terminate(&mut child, Duration::from_secs(2)).await;
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn run_to_completion_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ok = run_to_completion(
            &["sh".into(), "-c".into(), "exit 0".into()],
            dir.path(),
            Duration::from_secs(5),
        )
        .await;
        assert!(ok.is_ok());
        let err = run_to_completion(
            &["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()],
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exited 3"));
        assert!(err.to_string().contains("boom"));
    }
}
