use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PyrunError, Result};
use crate::sandbox::traits::RunOutput;

/// How long a killed child may take to be reaped before we give up waiting.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long the pipes may stay open once the child exited and its group was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

type Capture = JoinHandle<std::io::Result<(Vec<u8>, bool)>>;

/// Spawn `cmd`, capture its streams separately and enforce `timeout`.
///
/// The child leads its own process group. Once it exits, or the deadline
/// passes, the whole group is killed so nothing it started outlives the run
/// or keeps the pipes open. On expiry everything it printed is discarded.
/// A cancelled caller still kills the group through the guard's `Drop`.
pub async fn run_child(
    mut cmd: Command,
    program: &str,
    timeout: Duration,
    max_output: usize,
) -> Result<RunOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| PyrunError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let mut group = ProcessGroup(child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PyrunError::Internal("child stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PyrunError::Internal("child stderr was not piped".to_string()))?;

    let stdout_task: Capture = tokio::spawn(read_capped(stdout, max_output));
    let stderr_task: Capture = tokio::spawn(read_capped(stderr, max_output));
    let aborts = [stdout_task.abort_handle(), stderr_task.abort_handle()];

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            aborts.iter().for_each(|handle| handle.abort());
            group.kill();
            reclaim(&mut child).await;
            return Err(e.into());
        }
        Err(_) => {
            aborts.iter().for_each(|handle| handle.abort());
            warn!(program = %program, timeout_secs = timeout.as_secs(), "Deadline reached, killing process group");
            group.kill();
            reclaim(&mut child).await;
            return Ok(RunOutput::timed_out());
        }
    };

    // Background processes left behind would hold the pipes open
    group.kill();

    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        let out = join_capture(stdout_task).await?;
        let err = join_capture(stderr_task).await?;
        Ok::<_, PyrunError>((out, err))
    })
    .await;

    let ((stdout, out_truncated), (stderr, err_truncated)) = match drained {
        Ok(captured) => captured?,
        Err(_) => {
            aborts.iter().for_each(|handle| handle.abort());
            warn!(program = %program, "Output pipes still open after the process group was killed");
            return Err(PyrunError::Internal(
                "output pipes stayed open after the program exited".to_string(),
            ));
        }
    };

    let output = RunOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        timed_out: false,
        truncated: out_truncated || err_truncated,
    };

    debug!(
        program = %program,
        exit_code = ?output.exit_code,
        stdout_len = output.stdout.len(),
        stderr_len = output.stderr.len(),
        truncated = output.truncated,
        "Child completed"
    );

    Ok(output)
}

/// Process group led by a spawned child, killed at most once.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Killed process group"),
        // Every member already exited
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Kill the child and wait a bounded time for it to be reaped.
async fn reclaim(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(?status, "Child already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to poll child status"),
    }

    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to send kill signal to child");
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "Child reaped after kill"),
        Ok(Err(e)) => warn!(error = %e, "Failed to reap killed child"),
        Err(_) => warn!("Killed child did not exit within grace period"),
    }
}

async fn join_capture(task: Capture) -> Result<(Vec<u8>, bool)> {
    let captured = task
        .await
        .map_err(|e| PyrunError::Internal(format!("output capture task failed: {}", e)))?;
    Ok(captured?)
}

/// Read `reader` to the end, keeping at most `limit` bytes.
///
/// Bytes past the limit are still drained so the writer never blocks on a
/// full pipe. Returns the kept bytes and whether anything was dropped.
pub async fn read_capped<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            kept.extend_from_slice(&buf[..room]);
            truncated = true;
        } else {
            kept.extend_from_slice(&buf[..n]);
        }
    }

    Ok((kept, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_under_limit() {
        let (kept, truncated) = read_capped(&b"hello"[..], 16).await.unwrap();
        assert_eq!(kept, b"hello");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_read_capped_truncates() {
        let data = vec![b'x'; 20_000];
        let (kept, truncated) = read_capped(&data[..], 10_000).await.unwrap();
        assert_eq!(kept.len(), 10_000);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_streams_are_separate() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_child(cmd, "sh", Duration::from_secs(5), 1024)
            .await
            .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_deadline_discards_partial_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo partial; exec sleep 10"]);
        let started = std::time::Instant::now();
        let output = run_child(cmd, "sh", Duration::from_millis(500), 1024)
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
        assert_eq!(output.stderr, crate::sandbox::traits::TIMEOUT_SIGNAL);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Wait until `pid` has exited (gone or a zombie awaiting its reaper).
    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..40 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => return true,
                Ok(stat) => {
                    // State follows the parenthesised command name
                    let state = stat.rsplit(") ").next().and_then(|rest| rest.chars().next());
                    if state == Some('Z') {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_process_does_not_hold_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & echo $!; echo done"]);
        let started = std::time::Instant::now();
        let output = run_child(cmd, "sh", Duration::from_secs(10), 1024)
            .await
            .unwrap();

        assert!(!output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
        let mut lines = output.stdout.lines();
        let pid: u32 = lines.next().unwrap().parse().unwrap();
        assert_eq!(lines.next(), Some("done"));
        assert!(wait_until_gone(pid).await, "background sleep {pid} survived");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_deadline_kills_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let mut cmd = Command::new("sh");
        cmd.args([
            "-c".to_string(),
            format!("sleep 30 & echo $! > {}; wait", pidfile.display()),
        ]);
        let output = run_child(cmd, "sh", Duration::from_millis(500), 1024)
            .await
            .unwrap();

        assert!(output.timed_out);
        let pid: u32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(pid).await, "background sleep {pid} survived");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let cmd = Command::new("/nonexistent/interpreter-xyz");
        let err = run_child(cmd, "interpreter-xyz", Duration::from_secs(1), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, PyrunError::Spawn { .. }));
    }
}
