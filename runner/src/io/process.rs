//! Helpers for running child processes under cooperative cancellation.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::task::CancelFlag;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command until it exits or `cancel` is raised, streaming stdout lines into `sink`.
///
/// The cancel flag is checked every `poll`; once raised the child is killed.
/// `output_limit_bytes` bounds the stdout/stderr kept in memory while the pipes
/// are still fully drained.
#[instrument(skip_all, fields(poll_ms = poll.as_millis() as u64, output_limit_bytes))]
pub fn run_command_cancellable<W>(
    mut cmd: Command,
    cancel: &CancelFlag,
    poll: Duration,
    output_limit_bytes: usize,
    sink: W,
) -> Result<CommandOutput>
where
    W: Write + Send + 'static,
{
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle =
        thread::spawn(move || read_lines_limited_with_tee(stdout, output_limit_bytes, sink));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(poll).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing command");
            cancelled = true;
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        cancelled,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, writing every line to `sink`.
fn read_lines_limited_with_tee<R: Read, W: Write>(
    reader: R,
    limit: usize,
    mut sink: W,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Err(e) = sink.write_all(&line) {
            warn!(err = %e, "failed to forward output line");
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    if let Err(e) = sink.flush() {
        warn!(err = %e, "failed to flush output sink");
    }
    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("sink lock").extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn streams_stdout_and_captures_stderr() {
        let sink = SharedSink::default();
        let output = run_command_cancellable(
            sh("echo one; echo two; echo oops >&2"),
            &CancelFlag::new(),
            Duration::from_millis(10),
            1024,
            sink.clone(),
        )
        .expect("run");

        assert!(output.status.success());
        assert!(!output.cancelled);
        assert_eq!(sink.0.lock().expect("lock").as_slice(), b"one\ntwo\n");
        assert_eq!(output.stderr, b"oops\n");
    }

    #[test]
    fn limits_captured_output() {
        let output = run_command_cancellable(
            sh("printf 'abcdefgh'"),
            &CancelFlag::new(),
            Duration::from_millis(10),
            4,
            std::io::sink(),
        )
        .expect("run");

        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 4);
    }

    #[test]
    fn raised_cancel_flag_kills_child() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let started = Instant::now();
        let output = run_command_cancellable(
            sh("exec sleep 5"),
            &cancel,
            Duration::from_millis(10),
            1024,
            std::io::sink(),
        )
        .expect("run");

        assert!(output.cancelled);
        assert!(!output.status.success());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
