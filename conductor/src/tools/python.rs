//! Python workspace tool provider.
//!
//! Exposes a sandboxed directory of Python scripts to an agent: create or
//! overwrite scripts, run them in the foreground or as a supervised
//! background process, poll that process for output and feed its stdin.
//! At most one background process runs per workspace.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::process::{CommandRunner, ProcessMonitor};
use crate::tool::{
    SharedTool, Tool, ToolArgs, ToolMeta, ToolProvider, ToolResult, optional_bool, optional_f64,
    optional_str, optional_str_list, parameters_object, require_str, schema,
};
use crate::tools::workdir::WorkDir;

const PROVIDER_NAME: &str = "PythonWorkspace";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct WorkspaceInner {
    workdir: WorkDir,
    python_path: String,
    read_only: bool,
    runner: CommandRunner,
    monitor: Mutex<Option<ProcessMonitor>>,
}

impl WorkspaceInner {
    fn take_monitor(&self) -> Option<ProcessMonitor> {
        self.monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A Python workspace rooted in one directory.
#[derive(Debug, Clone)]
pub struct PythonWorkspace {
    inner: Arc<WorkspaceInner>,
}

impl PythonWorkspace {
    /// Open a workspace at `path`.
    ///
    /// With `create_venv`, a virtualenv is created inside the workspace and
    /// its interpreter used for every run. With `read_only`, the
    /// script-writing tools refuse to act.
    pub fn new(
        path: impl AsRef<std::path::Path>,
        python_path: impl Into<String>,
        create_venv: bool,
        read_only: bool,
    ) -> std::io::Result<Self> {
        let workdir = WorkDir::new(path)?;
        let runner = CommandRunner::new();
        let mut python_path = python_path.into();

        if create_venv {
            let venv = workdir.root().join("venv");
            runner
                .run_foreground(
                    &python_path,
                    &["-m".to_owned(), "venv".to_owned(), venv.display().to_string()],
                )
                .map_err(std::io::Error::other)?;
            python_path = venv.join("bin/python").display().to_string();
        }

        Ok(Self {
            inner: Arc::new(WorkspaceInner {
                workdir,
                python_path,
                read_only,
                runner,
                monitor: Mutex::new(None),
            }),
        })
    }

    /// The workspace root directory.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        self.inner.workdir.root()
    }
}

impl ToolProvider for PythonWorkspace {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn tools(&self) -> Vec<SharedTool> {
        vec![
            Arc::new(CreateScript {
                meta: ToolMeta::new(
                    ToolMeta::qualified(PROVIDER_NAME, "create_script"),
                    "Creates a Python script. Returns an error message or a confirmation message.",
                ),
                inner: Arc::clone(&self.inner),
                overwrite: false,
            }),
            Arc::new(CreateScript {
                meta: ToolMeta::new(
                    ToolMeta::qualified(PROVIDER_NAME, "overwrite_script"),
                    "Overwrites a Python script. Returns an error message or a confirmation message.",
                ),
                inner: Arc::clone(&self.inner),
                overwrite: true,
            }),
            Arc::new(RunScript {
                meta: ToolMeta::new(
                    ToolMeta::qualified(PROVIDER_NAME, "run_script"),
                    "Runs a Python script. Returns its output, or a confirmation that the \
                     process started in background mode; monitor it with monitor_process.",
                ),
                inner: Arc::clone(&self.inner),
            }),
            Arc::new(MonitorProcess {
                meta: ToolMeta::new(
                    ToolMeta::qualified(PROVIDER_NAME, "monitor_process"),
                    "Monitors the background script for output or termination. Returns the \
                     drained stdout and stderr, plus the exit code once finished.",
                ),
                inner: Arc::clone(&self.inner),
            }),
            Arc::new(WriteStdin {
                meta: ToolMeta::new(
                    ToolMeta::qualified(PROVIDER_NAME, "write_to_stdin"),
                    "Writes to the stdin of the background process.",
                ),
                inner: Arc::clone(&self.inner),
            }),
        ]
    }
}

struct CreateScript {
    meta: ToolMeta,
    inner: Arc<WorkspaceInner>,
    overwrite: bool,
}

#[async_trait]
impl Tool for CreateScript {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn arg_names(&self) -> Vec<String> {
        vec!["relative_path".into(), "content".into()]
    }

    fn parameters(&self) -> Value {
        parameters_object(&[
            ("relative_path", schema::string(), true),
            (
                "content",
                schema::with_default(schema::string(), json!("")),
                false,
            ),
        ])
    }

    async fn call(&self, args: &ToolArgs) -> ToolResult<String> {
        if self.inner.read_only {
            return Ok("Error: Read only mode is enabled.".to_owned());
        }
        let relative_path = require_str(args, "relative_path", &self.meta.name)?;
        let content = optional_str(args, "content", "");
        match self
            .inner
            .workdir
            .create_file(&relative_path, &content, self.overwrite)
        {
            Ok(()) => Ok(if self.overwrite {
                format!("{relative_path} overwritten")
            } else {
                format!("{relative_path} created")
            }),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }
}

struct RunScript {
    meta: ToolMeta,
    inner: Arc<WorkspaceInner>,
}

#[async_trait]
impl Tool for RunScript {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn arg_names(&self) -> Vec<String> {
        vec!["script_path".into(), "args".into(), "run_background".into()]
    }

    fn parameters(&self) -> Value {
        parameters_object(&[
            ("script_path", schema::string(), true),
            ("args", schema::array(schema::string()), true),
            (
                "run_background",
                schema::with_default(schema::boolean(), json!(false)),
                false,
            ),
        ])
    }

    async fn call(&self, args: &ToolArgs) -> ToolResult<String> {
        let script_path = require_str(args, "script_path", &self.meta.name)?;
        let script_args = optional_str_list(args, "args");
        let run_background = optional_bool(args, "run_background", false);

        let path = self
            .inner
            .workdir
            .resolve(&script_path)
            .map_err(|e| crate::tool::ToolError::execution(&self.meta.name, e.to_string()))?;
        let mut command_args = vec![path.display().to_string()];
        command_args.extend(script_args);

        if run_background {
            let mut slot = self
                .inner
                .monitor
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(monitor) = slot.as_ref()
                && !monitor.is_finished()
            {
                return Ok("Error: A process is already running in background. Please stop it \
                           or wait for it to finish."
                    .to_owned());
            }
            let monitor = self
                .inner
                .runner
                .run_background(&self.inner.python_path, &command_args, 1)
                .map_err(|e| crate::tool::ToolError::execution(&self.meta.name, e.to_string()))?;
            *slot = Some(monitor);
            return Ok("Process started in background mode.".to_owned());
        }

        let output = self
            .inner
            .runner
            .run_foreground(&self.inner.python_path, &command_args)
            .map_err(|e| crate::tool::ToolError::execution(&self.meta.name, e.to_string()))?;
        Ok(format!("Stdout: {}\nStderr: {}", output.stdout, output.stderr))
    }
}

struct MonitorProcess {
    meta: ToolMeta,
    inner: Arc<WorkspaceInner>,
}

#[async_trait]
impl Tool for MonitorProcess {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn arg_names(&self) -> Vec<String> {
        vec!["timeout".into(), "min_time".into()]
    }

    fn parameters(&self) -> Value {
        parameters_object(&[
            ("timeout", schema::optional(schema::number()), false),
            (
                "min_time",
                schema::with_default(schema::number(), json!(0.0)),
                false,
            ),
        ])
    }

    /// Poll the background process at a fixed cadence until it produces
    /// output (after `min_time`), finishes, or `timeout` elapses.
    async fn call(&self, args: &ToolArgs) -> ToolResult<String> {
        let Some(monitor) = self.inner.take_monitor() else {
            return Ok("Error: No attached process found.".to_owned());
        };
        let timeout = optional_f64(args, "timeout");
        let min_time = optional_f64(args, "min_time").unwrap_or(0.0);

        let started = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();

        loop {
            if monitor.has_new_stdout() {
                stdout.push_str(&monitor.drain_stdout());
            }
            if monitor.has_new_stderr() {
                stderr.push_str(&monitor.drain_stderr());
            }

            if monitor.is_finished() {
                let code = monitor.exit_code().unwrap_or(-1);
                return Ok(format!(
                    "Process finished with code {code}\nstdout: {stdout}\nstderr: {stderr}"
                ));
            }

            let elapsed = started.elapsed().as_secs_f64();
            if elapsed >= min_time {
                if !stdout.is_empty() || !stderr.is_empty() {
                    break;
                }
                if let Some(timeout) = timeout
                    && elapsed > timeout
                {
                    break;
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(format!("stdout: {stdout}\nstderr: {stderr}"))
    }
}

struct WriteStdin {
    meta: ToolMeta,
    inner: Arc<WorkspaceInner>,
}

#[async_trait]
impl Tool for WriteStdin {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn arg_names(&self) -> Vec<String> {
        vec!["content".into()]
    }

    fn parameters(&self) -> Value {
        parameters_object(&[("content", schema::string(), true)])
    }

    async fn call(&self, args: &ToolArgs) -> ToolResult<String> {
        let content = require_str(args, "content", &self.meta.name)?;
        let Some(monitor) = self.inner.take_monitor() else {
            return Ok("Error: No attached process found.".to_owned());
        };
        monitor
            .write_stdin(&content)
            .map_err(|e| crate::tool::ToolError::execution(&self.meta.name, e.to_string()))?;
        Ok("OK".to_owned())
    }
}
