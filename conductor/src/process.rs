//! Supervised subprocess execution with streamed stdio.
//!
//! [`CommandRunner`] either captures a command's full output synchronously or
//! launches it in the background under a [`ProcessMonitor`]. A background
//! process gets three workers: one draining stdout, one draining stderr and
//! one waiting for termination. The monitor itself serializes all access
//! through a single mutex, so polling it from any thread is safe.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use thiserror::Error;
use tracing::{debug, warn};

/// Error type for subprocess supervision.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The child process could not be spawned.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A pipe to the child was not available.
    #[error("stdio pipe for `{command}` is unavailable")]
    MissingPipe {
        /// The command whose pipe was missing.
        command: String,
    },

    /// Writing to the child's stdin failed.
    #[error("failed to write to child stdin: {0}")]
    Stdin(String),
}

/// Captured output of a foreground command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Everything the child wrote to stdout.
    pub stdout: String,
    /// Everything the child wrote to stderr.
    pub stderr: String,
}

#[derive(Debug, Default)]
struct MonitorInner {
    stdout: Vec<String>,
    stderr: Vec<String>,
    stdout_cursor: usize,
    stderr_cursor: usize,
    finished: bool,
    exit_code: Option<i32>,
    stdin: Option<ChildStdin>,
}

/// Thread-safe handle over a background child process.
///
/// Every public method acquires the same mutex, so the handle behaves as a
/// classic monitor object. `drain_*` return everything accumulated since the
/// previous drain and advance a per-stream cursor that never rewinds; drains
/// stay valid after the process dies until fully consumed.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    inner: Arc<Mutex<MonitorInner>>,
}

impl ProcessMonitor {
    fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MonitorInner {
                stdin,
                ..MonitorInner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether stdout holds lines past the drain cursor.
    #[must_use]
    pub fn has_new_stdout(&self) -> bool {
        let inner = self.lock();
        inner.stdout_cursor != inner.stdout.len()
    }

    /// Whether stderr holds lines past the drain cursor.
    #[must_use]
    pub fn has_new_stderr(&self) -> bool {
        let inner = self.lock();
        inner.stderr_cursor != inner.stderr.len()
    }

    /// Return all stdout accumulated since the previous drain.
    #[must_use]
    pub fn drain_stdout(&self) -> String {
        let mut inner = self.lock();
        let out = inner.stdout[inner.stdout_cursor..].concat();
        inner.stdout_cursor = inner.stdout.len();
        out
    }

    /// Return all stderr accumulated since the previous drain.
    #[must_use]
    pub fn drain_stderr(&self) -> String {
        let mut inner = self.lock();
        let out = inner.stderr[inner.stderr_cursor..].concat();
        inner.stderr_cursor = inner.stderr.len();
        out
    }

    /// Write text to the child's stdin and flush it.
    pub fn write_stdin(&self, input: &str) -> Result<(), MonitorError> {
        let mut inner = self.lock();
        let stdin = inner
            .stdin
            .as_mut()
            .ok_or_else(|| MonitorError::Stdin("stdin already closed".into()))?;
        stdin
            .write_all(input.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| MonitorError::Stdin(e.to_string()))
    }

    /// Whether the child has terminated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// The child's exit code; `None` while it is still running.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    fn push_stdout(&self, line: String) {
        self.lock().stdout.push(line);
    }

    fn push_stderr(&self, line: String) {
        self.lock().stderr.push(line);
    }

    fn set_finished(&self, code: i32) {
        let mut inner = self.lock();
        inner.finished = true;
        inner.exit_code = Some(code);
        // Drop stdin so the child sees EOF once nobody will write again.
        inner.stdin = None;
    }
}

/// Launches commands in the foreground or under a [`ProcessMonitor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl CommandRunner {
    /// Create a runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run `cmd` to completion, capturing stdout and stderr fully.
    pub fn run_foreground(&self, cmd: &str, args: &[String]) -> Result<CommandOutput, MonitorError> {
        let output = Command::new(cmd)
            .args(args)
            .output()
            .map_err(|source| MonitorError::Spawn {
                command: cmd.to_owned(),
                source,
            })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Spawn `cmd` in the background and return a monitor over it.
    ///
    /// Three workers are started: a stdout reader, a stderr reader and a
    /// waiter that publishes the exit code. `bufsize` sizes the readers'
    /// line buffers. Spawn failures surface here synchronously.
    pub fn run_background(
        &self,
        cmd: &str,
        args: &[String],
        bufsize: usize,
    ) -> Result<ProcessMonitor, MonitorError> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| MonitorError::Spawn {
                command: cmd.to_owned(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| MonitorError::MissingPipe {
            command: cmd.to_owned(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| MonitorError::MissingPipe {
            command: cmd.to_owned(),
        })?;
        let stdin = child.stdin.take();

        let monitor = ProcessMonitor::new(stdin);
        debug!(command = %cmd, "background process started");

        let out_monitor = monitor.clone();
        thread::spawn(move || read_lines(stdout, bufsize, |line| out_monitor.push_stdout(line)));

        let err_monitor = monitor.clone();
        thread::spawn(move || read_lines(stderr, bufsize, |line| err_monitor.push_stderr(line)));

        let wait_monitor = monitor.clone();
        let command = cmd.to_owned();
        thread::spawn(move || wait_for_exit(child, &command, &wait_monitor));

        Ok(monitor)
    }
}

fn read_lines<R: Read>(stream: R, bufsize: usize, mut sink: impl FnMut(String)) {
    let mut reader = BufReader::with_capacity(bufsize.max(64), stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => sink(line.clone()),
            Err(e) => {
                warn!(error = %e, "stream reader stopped");
                break;
            }
        }
    }
}

fn wait_for_exit(mut child: Child, command: &str, monitor: &ProcessMonitor) {
    match child.wait() {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            debug!(command = %command, code, "background process finished");
            monitor.set_finished(code);
        }
        Err(e) => {
            warn!(command = %command, error = %e, "waiting for child failed");
            monitor.set_finished(-1);
        }
    }
}
