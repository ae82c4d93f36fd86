use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::app::error::AppError;
use crate::app::worker::CancelToken;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Both streams, for callers that scan for markers regardless of where adb printed them.
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

fn drain_pipe(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}

fn spawn_piped(program: &str, args: &[String], trace_id: &str) -> Result<Child, AppError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::transport(format!("Failed to spawn {program}: {err}"), trace_id))
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = spawn_piped(program, args, trace_id)?;

    // Both pipes must be drained while we wait, otherwise a chatty child blocks on a full pipe
    // and looks like a timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = std::thread::spawn(move || drain_pipe(stdout));
    let stderr_handle = std::thread::spawn(move || drain_pipe(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::transport(
                        format!("{program} timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::transport(
                    format!("Failed to poll {program}: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

/// Runs a long-lived command and hands every stdout/stderr line to `on_line` as it arrives.
/// Returns when the command exits; cancelling `cancel` kills the child and returns promptly.
pub fn stream_command_lines(
    program: &str,
    args: &[String],
    cancel: &CancelToken,
    on_line: &mut dyn FnMut(&str),
    trace_id: &str,
) -> Result<Option<i32>, AppError> {
    let mut child = spawn_piped(program, args, trace_id)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let (tx, rx) = mpsc::channel::<String>();
    let tx_err = tx.clone();
    let trace_out = trace_id.to_string();
    let trace_err = trace_id.to_string();
    let out_handle = std::thread::spawn(move || forward_lines(stdout, tx, &trace_out));
    let err_handle = std::thread::spawn(move || forward_lines(stderr, tx_err, &trace_err));

    let mut killed = false;
    let mut drained = false;
    loop {
        if cancel.is_cancelled() && !killed {
            let _ = child.kill();
            killed = true;
        }
        // A grandchild may still hold the pipes open after a kill; stop once our child is gone.
        if killed && matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                if !killed {
                    on_line(&line);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                drained = true;
                break;
            }
        }
    }

    if drained {
        let _ = out_handle.join();
        let _ = err_handle.join();
    }
    let status = child
        .wait()
        .map_err(|err| AppError::transport(format!("Failed to wait for {program}: {err}"), trace_id))?;
    Ok(status.code())
}

fn forward_lines(reader: impl Read, tx: mpsc::Sender<String>, trace_id: &str) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to read command output");
                break;
            }
        }
    }
}
