//! Command execution for test steps
//!
//! A [`CommandSpec`] is either an inline command line or a script body.
//! [`CommandRunner`] starts it with the harness environment, wires its output
//! into the step logger and either waits for it (foreground, time-boxed) or
//! hands it back running (background).
//!
//! A foreground command that outlives its timeout is not killed: the runner
//! stops waiting and reports the timeout, the process itself keeps running.

pub mod args;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Error;
use crate::config::{HarnessEnv, OsEnv};
use crate::context::Context;
use crate::error::ContextError;
use crate::logging::{Logger, OutputSink};

/// Environment variable carrying the test namespace
pub const NAMESPACE_ENV: &str = "NAMESPACE";
/// Environment variable pointing at the step kubeconfig
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// One command of a test step
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    /// Inline command line, split shell-style
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Script body run with `sh -c`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Append `--namespace <ns>` unless the command sets one
    #[serde(default)]
    pub namespaced: bool,

    /// A non-zero exit is not an error
    #[serde(default)]
    pub ignore_failure: bool,

    /// Start and hand back without waiting
    #[serde(default)]
    pub background: bool,

    /// Discard stdout and stderr
    #[serde(default)]
    pub skip_log_output: bool,

    /// Seconds; 0 inherits the runner default, negative disables the timeout
    #[serde(default)]
    pub timeout: i64,
}

impl CommandSpec {
    /// Spec for an inline command line
    pub fn command(line: impl Into<String>) -> Self {
        Self {
            command: Some(line.into()),
            ..Default::default()
        }
    }

    /// Spec for a script body
    pub fn script(body: impl Into<String>) -> Self {
        Self {
            script: Some(body.into()),
            ..Default::default()
        }
    }

    /// Request namespace injection
    pub fn namespaced(mut self) -> Self {
        self.namespaced = true;
        self
    }

    /// Tolerate a non-zero exit
    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    /// Run in the background
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Discard output
    pub fn skip_log_output(mut self) -> Self {
        self.skip_log_output = true;
        self
    }

    /// Set the timeout override in seconds
    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = seconds;
        self
    }

    /// The command line, if set and non-empty
    pub fn command_line(&self) -> Option<&str> {
        self.command.as_deref().filter(|c| !c.is_empty())
    }

    /// The script body, if set and non-empty
    pub fn script_body(&self) -> Option<&str> {
        self.script.as_deref().filter(|s| !s.is_empty())
    }

    /// Text identifying this command in errors and logs
    pub fn description(&self) -> &str {
        self.command_line().or(self.script_body()).unwrap_or_default()
    }

    /// Check that exactly one form is set and the options fit it
    pub fn validate(&self) -> Result<(), Error> {
        match (self.command_line(), self.script_body()) {
            (Some(_), Some(_)) => Err(Error::validation(
                "command and script can not be set in the same configuration",
            )),
            (None, None) => Err(Error::validation("command or script must be set")),
            (None, Some(_)) if self.namespaced => Err(Error::validation(
                "script can not used 'namespaced', use the $NAMESPACE environment variable instead",
            )),
            _ => Ok(()),
        }
    }
}

/// Effective timeout of a foreground command
///
/// A negative spec timeout disables it, a positive one overrides
/// `default_secs`, zero inherits `default_secs`. A result of zero means no
/// timeout.
pub fn resolve_timeout(spec_timeout: i64, default_secs: u64) -> Option<Duration> {
    let secs = match spec_timeout {
        t if t < 0 => 0,
        0 => default_secs,
        t => t.unsigned_abs(),
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// A started process handed to the caller
///
/// Nothing reaps it implicitly; call [`RunningCommand::wait`] or
/// [`RunningCommand::kill`].
#[derive(Debug)]
pub struct RunningCommand {
    command: String,
    child: Child,
    output: Vec<JoinHandle<()>>,
}

impl RunningCommand {
    /// OS process id, `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// The command line or script this process runs
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status if the process has finished, without blocking
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, Error> {
        self.child
            .try_wait()
            .map_err(|e| self.wait_error(e))
    }

    /// Wait for exit and for its output to be fully copied
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        let status = self.child.wait().await.map_err(|e| self.wait_error(e))?;
        for task in self.output.drain(..) {
            // Copy tasks only end on EOF or read errors
            let _ = task.await;
        }
        Ok(status)
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> Result<(), Error> {
        self.child.kill().await.map_err(|e| self.wait_error(e))
    }

    fn wait_error(&self, e: std::io::Error) -> Error {
        Error::internal_with_context(
            "command",
            format!("failed waiting for {:?}: {}", self.command, e),
        )
    }
}

/// Outcome of [`CommandRunner::run_all`]
#[derive(Debug, Default)]
pub struct CommandBatch {
    /// Background processes, in start order, for the caller to reap
    pub background: Vec<RunningCommand>,
    /// Errors of the commands that failed, in order
    pub errors: Vec<Error>,
}

impl CommandBatch {
    /// Whether every command succeeded or was tolerated
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Starts commands for one test step
#[derive(Clone)]
pub struct CommandRunner {
    namespace: String,
    workdir: Option<PathBuf>,
    stdout: Arc<dyn OutputSink>,
    stderr: Arc<dyn OutputSink>,
    logger: Arc<dyn Logger>,
    default_timeout: u64,
    env: Arc<dyn HarnessEnv>,
}

impl CommandRunner {
    /// Runner for `namespace` whose process output goes to `logger`
    pub fn new<L: Logger + 'static>(namespace: impl Into<String>, logger: Arc<L>) -> Self {
        Self {
            namespace: namespace.into(),
            workdir: None,
            stdout: logger.clone(),
            stderr: logger.clone(),
            logger,
            default_timeout: 0,
            env: Arc::new(OsEnv),
        }
    }

    /// Start commands in `dir` instead of the current directory
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Send process output to separate sinks instead of the logger
    pub fn with_output(mut self, stdout: Arc<dyn OutputSink>, stderr: Arc<dyn OutputSink>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Timeout in seconds for specs that don't set one; 0 means none
    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout = seconds;
        self
    }

    /// Read the parent environment through `env`
    pub fn with_env(mut self, env: Arc<dyn HarnessEnv>) -> Self {
        self.env = env;
        self
    }

    /// Variables injected on top of the parent environment
    ///
    /// KUBECONFIG and the PATH prefix are derived from the process working
    /// directory, not the command's.
    pub fn injected_env(&self) -> Result<BTreeMap<String, String>, Error> {
        let cwd = self.env.current_dir()?;
        let path = self.env.var("PATH").unwrap_or_default();

        Ok(BTreeMap::from([
            (NAMESPACE_ENV.to_string(), self.namespace.clone()),
            (
                KUBECONFIG_ENV.to_string(),
                cwd.join("kubeconfig").display().to_string(),
            ),
            ("PATH".to_string(), format!("{}/bin/:{}", cwd.display(), path)),
        ]))
    }

    /// Run one command
    ///
    /// * Background: returns the running process immediately, never time-boxed.
    /// * Foreground: waits for exit under the effective timeout and returns
    ///   `None`. A non-zero exit is [`Error::CommandFailed`] unless
    ///   `ignore_failure` is set; running past the timeout is
    ///   [`Error::CommandTimeout`].
    ///
    /// Invalid specs fail before anything is spawned. A process that cannot be
    /// started is always an error.
    pub async fn run(
        &self,
        ctx: &Context,
        spec: &CommandSpec,
    ) -> Result<Option<RunningCommand>, Error> {
        spec.validate()?;

        let env = self.injected_env()?;
        let argv = args::build_argv(spec, &self.namespace, |name| {
            env.get(name).cloned().or_else(|| self.env.var(name))
        })?;
        let description = spec.description().to_string();

        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| Error::validation("command or script must be set"))?;
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        if spec.skip_log_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        self.logger.log(&format!("running command: {:?}", argv));
        let mut child = cmd.spawn().map_err(|source| Error::CommandStart {
            command: description.clone(),
            source,
        })?;

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(copy_output(stdout, self.stdout.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(copy_output(stderr, self.stderr.clone()));
        }
        let mut running = RunningCommand {
            command: description.clone(),
            child,
            output,
        };

        if spec.background {
            info!(command = %description, pid = ?running.id(), "started background command");
            return Ok(Some(running));
        }

        let timeout = resolve_timeout(spec.timeout, self.default_timeout);
        let cmd_ctx = match timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.with_cancel(),
        };

        let status = tokio::select! {
            biased;
            status = running.wait() => status?,
            _ = cmd_ctx.done() => {
                // Only the wait is abandoned; dropping the handle leaves the process running
                return Err(match cmd_ctx.err() {
                    Some(ContextError::Canceled) => Error::Context(ContextError::Canceled),
                    _ => {
                        warn!(
                            command = %description,
                            pid = ?running.id(),
                            "command exceeded timeout, abandoning wait"
                        );
                        Error::CommandTimeout {
                            command: description,
                            timeout_secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
                        }
                    }
                });
            }
        };

        if status.success() {
            debug!(command = %description, "command succeeded");
            return Ok(None);
        }
        if spec.ignore_failure {
            self.logger
                .log(&format!("ignoring failure of {:?}: {}", description, status));
            return Ok(None);
        }
        Err(Error::CommandFailed {
            command: description,
            status,
        })
    }

    /// Run `specs` one after another
    ///
    /// A failing command doesn't stop the sequence. The logger is flushed after
    /// every foreground command.
    pub async fn run_all(&self, ctx: &Context, specs: &[CommandSpec]) -> CommandBatch {
        let mut batch = CommandBatch::default();

        for spec in specs {
            match self.run(ctx, spec).await {
                Ok(Some(running)) => batch.background.push(running),
                Ok(None) => {}
                Err(e) => {
                    warn!(command = %spec.description(), error = %e, "command failed");
                    batch.errors.push(e);
                }
            }
            if !spec.background {
                self.logger.flush();
            }
        }

        if !batch.background.is_empty() {
            let pids: Vec<_> = batch.background.iter().filter_map(RunningCommand::id).collect();
            self.logger.log(&format!("background processes: {:?}", pids));
        }
        batch
    }

    /// Working directory commands start in, if overridden
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }
}

fn copy_output<R>(mut reader: R, sink: Arc<dyn OutputSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => sink.write_output(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "stopped copying command output");
                    break;
                }
            }
        }
    })
}
