//! Runs a product's pipeline script against a staged artifact.
//!
//! The script gets the parent's environment plus `ARTIFACT_PATH`, no stdin,
//! and piped stdout/stderr. Both pipes are drained concurrently with the wait
//! so a chatty child can never block on a full pipe while we block on its
//! exit.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub const ARTIFACT_PATH_ENV: &str = "ARTIFACT_PATH";

/// Bytes retained per stream; anything beyond is read and discarded.
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("cannot start pipeline script {}: {source}", script.display())]
    Spawn {
        script: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pipeline script {} has no {stream} pipe", script.display())]
    MissingPipe { script: PathBuf, stream: &'static str },

    #[error("cannot read {stream} of pipeline script {}: {source}", script.display())]
    Read {
        script: PathBuf,
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot wait on pipeline script {}: {source}", script.display())]
    Wait {
        script: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pipeline script {} timed out after {}s", script.display(), after.as_secs())]
    Timeout { script: PathBuf, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// The product has no script.
    Skipped,
    Succeeded,
    Failed(ExitStatus),
}

/// Output of one stream, capped at [`MAX_CAPTURED_OUTPUT`] bytes.
#[derive(Debug, Default, Clone)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// Bytes the child actually wrote, including the discarded tail.
    pub total_len: u64,
}

impl CapturedOutput {
    pub fn is_truncated(&self) -> bool {
        self.total_len > self.bytes.len() as u64
    }

    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub exit: PipelineExit,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl PipelineResult {
    fn skipped() -> Self {
        Self {
            exit: PipelineExit::Skipped,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        }
    }

    /// A skipped pipeline counts as a success.
    pub fn succeeded(&self) -> bool {
        !matches!(self.exit, PipelineExit::Failed(_))
    }
}

/// Runs `script` once with `ARTIFACT_PATH=<artifact>`.
///
/// No retries. On timeout the child receives SIGTERM, then SIGKILL if it is
/// still alive after a grace period. The child is also killed if the returned
/// future is dropped.
pub async fn run(
    script: Option<&Path>,
    artifact: &Path,
    timeout: Duration,
) -> Result<PipelineResult, InvocationError> {
    let Some(script) = script else {
        debug!("No pipeline script configured, skipping");
        return Ok(PipelineResult::skipped());
    };

    let mut child = Command::new(script)
        .env(ARTIFACT_PATH_ENV, artifact)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| InvocationError::Spawn {
            script: script.to_path_buf(),
            source,
        })?;

    debug!(script = %script.display(), pid = child.id(), "Pipeline script started");

    let stdout = child.stdout.take().ok_or_else(|| InvocationError::MissingPipe {
        script: script.to_path_buf(),
        stream: "stdout",
    })?;
    let stderr = child.stderr.take().ok_or_else(|| InvocationError::MissingPipe {
        script: script.to_path_buf(),
        stream: "stderr",
    })?;

    let finished = {
        let drain_and_wait = async {
            tokio::join!(capture(stdout), capture(stderr), child.wait())
        };
        tokio::time::timeout(timeout, drain_and_wait).await
    };

    let Ok((stdout, stderr, status)) = finished else {
        kill_gracefully(&mut child, script).await;
        return Err(InvocationError::Timeout {
            script: script.to_path_buf(),
            after: timeout,
        });
    };

    let read_err = |stream, source| InvocationError::Read {
        script: script.to_path_buf(),
        stream,
        source,
    };
    let stdout = stdout.map_err(|e| read_err("stdout", e))?;
    let stderr = stderr.map_err(|e| read_err("stderr", e))?;
    let status = status.map_err(|source| InvocationError::Wait {
        script: script.to_path_buf(),
        source,
    })?;

    let exit = if status.success() {
        PipelineExit::Succeeded
    } else {
        PipelineExit::Failed(status)
    };
    debug!(
        script = %script.display(),
        %status,
        stdout_bytes = stdout.total_len,
        stderr_bytes = stderr.total_len,
        "Pipeline script exited"
    );

    Ok(PipelineResult { exit, stdout, stderr })
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<CapturedOutput> {
    let mut output = CapturedOutput::default();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(output);
        }
        let keep = n.min(MAX_CAPTURED_OUTPUT - output.bytes.len());
        output.bytes.extend_from_slice(&buf[..keep]);
        output.total_len += n as u64;
    }
}

/// Send SIGTERM and wait for a clean exit; escalate to SIGKILL if needed.
///
/// On non-Unix platforms SIGTERM is not available, so we go straight to SIGKILL.
async fn kill_gracefully(child: &mut Child, script: &Path) {
    warn!(script = %script.display(), "Pipeline script timed out, sending SIGTERM");

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => return,
            Err(_) => warn!(script = %script.display(), "SIGTERM ignored, escalating to SIGKILL"),
        }
    }

    let _ = child.start_kill();
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(
            script = %script.display(),
            error = %e,
            "Error waiting for killed pipeline script"
        ),
        Err(_) => warn!(script = %script.display(), "Pipeline script still alive after SIGKILL"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn artifact(dir: &TempDir, contents: &[u8]) -> PathBuf {
        let path = dir.path().join("artifact");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn no_script_is_a_trivial_success() {
        let dir = TempDir::new().unwrap();
        let result = run(None, &artifact(&dir, b"x"), TIMEOUT).await.unwrap();

        assert_eq!(result.exit, PipelineExit::Skipped);
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn zero_exit_succeeds_and_captures_output() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "ok.sh", "echo deployed; echo warning >&2");

        let result = run(Some(&script), &artifact(&dir, b"x"), TIMEOUT).await.unwrap();

        assert_eq!(result.exit, PipelineExit::Succeeded);
        assert_eq!(result.stdout.lossy(), "deployed\n");
        assert_eq!(result.stderr.lossy(), "warning\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "fail.sh", "echo 'bad artifact' >&2; exit 3");

        let result = run(Some(&script), &artifact(&dir, b"x"), TIMEOUT).await.unwrap();

        assert!(!result.succeeded());
        match result.exit {
            PipelineExit::Failed(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(result.stderr.lossy(), "bad artifact\n");
    }

    #[tokio::test]
    async fn script_sees_artifact_path() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "cat.sh",
            "printf '%s' \"$ARTIFACT_PATH\"; cat \"$ARTIFACT_PATH\" >&2",
        );
        let artifact = artifact(&dir, b"release-1.2.3");

        let result = run(Some(&script), &artifact, TIMEOUT).await.unwrap();

        assert_eq!(result.stdout.lossy(), artifact.display().to_string());
        assert_eq!(result.stderr.lossy(), "release-1.2.3");
    }

    #[tokio::test]
    async fn script_gets_no_stdin() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "stdin.sh", "cat; echo done");

        let artifact = artifact(&dir, b"x");
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(Some(&script), &artifact, TIMEOUT),
        )
        .await
        .expect("reading stdin must hit EOF immediately")
        .unwrap();

        assert_eq!(result.stdout.lossy(), "done\n");
    }

    #[tokio::test]
    async fn missing_script_cannot_start() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.sh");

        let err = run(Some(&missing), &artifact(&dir, b"x"), TIMEOUT).await.unwrap_err();

        assert!(matches!(err, InvocationError::Spawn { .. }));
    }

    #[tokio::test]
    async fn large_output_on_both_streams_does_not_hang() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "noisy.sh",
            "head -c 4000000 /dev/zero; head -c 4000000 /dev/zero >&2; echo finished >&2",
        );

        let artifact = artifact(&dir, b"x");
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            run(Some(&script), &artifact, TIMEOUT),
        )
        .await
        .expect("pipeline must not deadlock on full pipes")
        .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.stdout.total_len, 4_000_000);
        assert_eq!(result.stderr.total_len, 4_000_009);
        assert_eq!(result.stdout.bytes.len(), MAX_CAPTURED_OUTPUT);
        assert!(result.stdout.is_truncated());
        assert!(result.stderr.is_truncated());
    }

    #[tokio::test]
    async fn timeout_kills_the_script() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "slow.sh", "exec sleep 30");
        let started = Instant::now();

        let artifact = artifact(&dir, b"x");
        let err = run(Some(&script), &artifact, Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InvocationError::Timeout { after, .. } if after == Duration::from_millis(300)
        ));
        assert!(started.elapsed() < Duration::from_secs(5), "SIGTERM must stop sleep promptly");
    }

    #[test]
    fn capture_keeps_only_the_head() {
        let output = CapturedOutput {
            bytes: vec![b'a'; 4],
            total_len: 10,
        };
        assert!(output.is_truncated());
        assert_eq!(output.lossy(), "aaaa");
    }
}
