//! Helpers for running child processes with timeouts and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

type Tee = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child is placed in its own process group; on timeout the whole group is killed.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_with_stream(cmd, stdin, timeout, output_limit_bytes, Tracking::default())
}

/// Files a long-running child is observable through while it runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracking<'a> {
    /// Every stdout/stderr line is appended here as it arrives (flushed per line).
    pub stream_path: Option<&'a Path>,
    /// Holds the child's pid, which is also its process group id, until it exits.
    pub pid_path: Option<&'a Path>,
}

/// Like [`run_command_with_timeout`], but makes the child observable through `tracking`
/// so its log can be tailed live and its process group signalled from outside.
#[instrument(
    skip_all,
    fields(
        timeout_secs = timeout.as_secs(),
        output_limit_bytes,
        streaming = tracking.stream_path.is_some()
    )
)]
pub fn run_command_with_stream(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tracking: Tracking<'_>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    own_process_group(&mut cmd);

    let tee: Tee = Arc::new(match tracking.stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Mutex::new(BufWriter::new(file)))
        }
        None => None,
    });

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    if let Some(pid_path) = tracking.pid_path
        && let Err(e) = std::fs::write(pid_path, format!("{}\n", child.id()))
    {
        warn!(err = %e, path = %pid_path.display(), "failed to record child pid");
    }

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading its input closes the pipe early.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin before reading all input");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_tee = Arc::clone(&tee);
    let stderr_tee = Arc::clone(&tee);
    let stdout_handle =
        thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, &stdout_tee));
    let stderr_handle =
        thread::spawn(move || read_lines_limited(stderr, output_limit_bytes, &stderr_tee));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    if let Some(pid_path) = tracking.pid_path {
        let _ = std::fs::remove_file(pid_path);
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Kill the child and everything it spawned.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        warn!(err = %e, "killpg failed, killing child only");
        child.kill().context("kill child")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

/// Send SIGTERM to process `pid`. Returns false if it no longer exists.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(anyhow!("signal process {pid}: {e}")),
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> Result<bool> {
    Err(anyhow!("stopping process {pid} is only supported on unix"))
}

/// Send SIGTERM to the process group led by `pid`. Returns false if no such group exists.
#[cfg(unix)]
pub fn terminate_group(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(anyhow!("signal process group {pid}: {e}")),
    }
}

#[cfg(not(unix))]
pub fn terminate_group(pid: u32) -> Result<bool> {
    Err(anyhow!("stopping loop {pid} is only supported on unix"))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing each line to the stream file.
fn read_lines_limited<R: Read>(reader: R, limit: usize, tee: &Tee) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = tee.as_ref()
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_stdin() {
        let out = run_command_with_timeout(
            sh("cat; echo err >&2"),
            Some(b"hello\n"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"hello\n");
        assert_eq!(out.combined_text(), "hello\nerr\n");
    }

    #[test]
    fn output_beyond_limit_is_counted() {
        let out = run_command_with_timeout(sh("printf 'abcdef'"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 2);
        assert!(out.truncated_notice("agent").contains("truncated 2 bytes"));
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let out = run_command_with_timeout(
            sh("sleep 30 & sleep 30; wait"),
            None,
            Duration::from_millis(300),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn stream_file_receives_both_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("logs/agent.log");
        let pid = dir.path().join("agent.pid");
        let mut cmd = sh("echo out; echo err >&2; sleep 0.5; test -s \"$PID_FILE\"");
        cmd.env("PID_FILE", &pid);
        let out = run_command_with_stream(
            cmd,
            None,
            Duration::from_secs(10),
            1024,
            Tracking {
                stream_path: Some(&log),
                pid_path: Some(&pid),
            },
        )
        .expect("run");
        assert!(out.success(), "pid file should exist while the child runs");
        assert!(!pid.exists());
        let text = std::fs::read_to_string(&log).expect("read log");
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[test]
    fn signalling_a_missing_process_reports_false() {
        // Pid numbers above the kernel's pid_max are never assigned.
        assert!(!terminate_process(4_194_304 + 7).expect("signal"));
        assert!(!terminate_group(4_194_304 + 7).expect("signal"));
    }
}
