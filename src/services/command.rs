//! Subprocess supervisor
//!
//! Spawns external binaries (yt-dlp, ffmpeg) with stdin closed and
//! stdout/stderr piped, streams output line-by-line to the caller's hooks,
//! and polls a cancellation probe between chunks (and on a short interval,
//! so a silent child still gets terminated). No shell is involved.

use crate::{Error, Result};
use futures::future::BoxFuture;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Async per-line callback; receives each newline-delimited line with its
/// terminator stripped, plus the flushed tail on stream close.
pub type LineHook = Box<dyn FnMut(String) -> BoxFuture<'static, ()> + Send>;

/// Async cancellation probe; polled after every output chunk and every
/// [`CANCEL_POLL_INTERVAL`].
pub type CancelHook = Box<dyn FnMut() -> BoxFuture<'static, bool> + Send>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
pub struct CommandOptions {
    pub on_stdout_line: Option<LineHook>,
    pub on_stderr_line: Option<LineHook>,
    pub should_cancel: Option<CancelHook>,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Splits a byte stream into `\r?\n`-delimited lines, holding the partial
/// tail across chunks.
struct LineSplitter {
    buffer: String,
}

impl LineSplitter {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Run `program args...` to completion.
///
/// Fails with the OS error when the process cannot be spawned, with a
/// descriptive error (command, args, captured stderr falling back to
/// stdout) on nonzero exit, and with [`Error::Canceled`] when the
/// cancellation probe fires; in the cancel case the child is killed first.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    mut opts: CommandOptions,
) -> Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    tracing::debug!(program, ?args, "Spawning command");

    let mut child = command
        .spawn()
        .map_err(|e| Error::Infrastructure(format!("Failed to spawn {program}: {e}")))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| Error::Infrastructure(format!("No stdout pipe for {program}")))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| Error::Infrastructure(format!("No stderr pipe for {program}")))?;

    let mut stdout_acc = String::new();
    let mut stderr_acc = String::new();
    let mut stdout_lines = LineSplitter::new();
    let mut stderr_lines = LineSplitter::new();
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stdout_buf = vec![0u8; 8192];
    let mut stderr_buf = vec![0u8; 8192];
    let mut poll_tick = tokio::time::interval(CANCEL_POLL_INTERVAL);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !(stdout_done && stderr_done) {
        tokio::select! {
            read = stdout_pipe.read(&mut stdout_buf), if !stdout_done => {
                let n = read?;
                if n == 0 {
                    stdout_done = true;
                    if let (Some(tail), Some(hook)) =
                        (stdout_lines.flush(), opts.on_stdout_line.as_mut())
                    {
                        hook(tail).await;
                    }
                } else {
                    let chunk = String::from_utf8_lossy(&stdout_buf[..n]).into_owned();
                    stdout_acc.push_str(&chunk);
                    let lines = stdout_lines.push(&chunk);
                    if let Some(hook) = opts.on_stdout_line.as_mut() {
                        for line in lines {
                            hook(line).await;
                        }
                    }
                }
            }
            read = stderr_pipe.read(&mut stderr_buf), if !stderr_done => {
                let n = read?;
                if n == 0 {
                    stderr_done = true;
                    if let (Some(tail), Some(hook)) =
                        (stderr_lines.flush(), opts.on_stderr_line.as_mut())
                    {
                        hook(tail).await;
                    }
                } else {
                    let chunk = String::from_utf8_lossy(&stderr_buf[..n]).into_owned();
                    stderr_acc.push_str(&chunk);
                    let lines = stderr_lines.push(&chunk);
                    if let Some(hook) = opts.on_stderr_line.as_mut() {
                        for line in lines {
                            hook(line).await;
                        }
                    }
                }
            }
            _ = poll_tick.tick() => {}
        }

        if let Some(cancel) = opts.should_cancel.as_mut() {
            if cancel().await {
                let _ = child.kill().await;
                return Err(Error::Canceled(format!("Command canceled: {program}")));
            }
        }
    }

    let status = child.wait().await?;

    if !status.success() {
        let detail = if stderr_acc.trim().is_empty() {
            stdout_acc.trim()
        } else {
            stderr_acc.trim()
        };
        return Err(Error::Infrastructure(format!(
            "Command failed ({status}): {program} {}: {detail}",
            args.join(" "),
        )));
    }

    Ok(CommandOutput {
        stdout: stdout_acc,
        stderr: stderr_acc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_hook(sink: Arc<Mutex<Vec<String>>>) -> LineHook {
        Box::new(move |line| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(line);
            })
        })
    }

    #[test]
    fn splitter_handles_crlf_and_partial_tails() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push("a\r\nb\nc"), vec!["a", "b"]);
        assert_eq!(splitter.push("d\n"), vec!["cd"]);
        assert_eq!(splitter.flush(), None);

        let mut splitter = LineSplitter::new();
        assert!(splitter.push("tail").is_empty());
        assert_eq!(splitter.flush(), Some("tail".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_streams_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let opts = CommandOptions {
            on_stdout_line: Some(collecting_hook(lines.clone())),
            ..CommandOptions::default()
        };

        let output = run_command("sh", &["-c", "printf 'one\\ntwo\\ntail'"], None, opts)
            .await
            .unwrap();

        assert_eq!(output.stdout, "one\ntwo\ntail");
        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["one", "two", "tail"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let err = run_command(
            "sh",
            &["-c", "echo oops >&2; exit 3"],
            None,
            CommandOptions::default(),
        )
        .await
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("sh"), "{msg}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_surfaces_os_error() {
        let err = run_command(
            "definitely-not-a-binary-grillmaster",
            &[],
            None,
            CommandOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_a_silent_child() {
        let opts = CommandOptions {
            should_cancel: Some(Box::new(|| Box::pin(async { true }))),
            ..CommandOptions::default()
        };

        let started = std::time::Instant::now();
        let err = run_command("sh", &["-c", "sleep 30"], None, opts)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Canceled(_)), "{err}");
        assert!(err.to_string().contains("Command canceled: sh"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
