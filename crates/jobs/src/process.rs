// crates/jobs/src/process.rs
//! External step processes: spawn, capture or stream output, cancel.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, JobResult};

/// Lines buffered between the pipe readers and the consumer.
const LINE_BUFFER: usize = 256;

/// An external program run as one pipeline step.
///
/// The child inherits the current environment plus any `env` overrides,
/// and gets a null stdin so it can never block waiting for input.
#[derive(Debug, Clone)]
pub struct StepCommand {
    program: PathBuf,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl StepCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Environment overrides applied on top of the inherited environment.
    pub fn envs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn spawn(&self) -> JobResult<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.spawn().map_err(|source| {
            tracing::error!(program = %self.program.display(), error = %source, "failed to spawn step");
            JobError::Spawn {
                program: self.program.display().to_string(),
                source,
            }
        })
    }
}

/// Result of a step run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `cmd` to completion, capturing stdout and stderr separately.
///
/// Completion means the process has exited and both pipes have closed, so a
/// background child that keeps the pipes open holds the step. If `cancel`
/// fires first the child is killed and reaped, the pipe readers are dropped
/// and `JobError::Cancelled` is returned.
pub async fn run_captured(cmd: &StepCommand, cancel: &CancellationToken) -> JobResult<CapturedOutput> {
    let mut child = cmd.spawn()?;
    let stdout = tokio::spawn(read_to_string(child.stdout.take()));
    let stderr = tokio::spawn(read_to_string(child.stderr.take()));
    let readers = [stdout.abort_handle(), stderr.abort_handle()];

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child, cmd.program()).await;
            readers.iter().for_each(AbortHandle::abort);
            Err(JobError::Cancelled)
        }
        (status, stdout, stderr) = async { tokio::join!(child.wait(), stdout, stderr) } => {
            Ok(CapturedOutput {
                exit_code: status?.code(),
                stdout: stdout.unwrap_or_default(),
                stderr: stderr.unwrap_or_default(),
            })
        }
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::warn!(error = %e, "failed reading step output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn terminate(child: &mut Child, program: &Path) {
    // `kill` also waits, so the exit status is collected and no zombie is left.
    if let Err(e) = child.kill().await {
        tracing::warn!(program = %program.display(), error = %e, "failed to kill step process");
    } else {
        tracing::debug!(program = %program.display(), "step process killed");
    }
}

/// A running step whose stdout and stderr are merged into one line stream.
///
/// Lines arrive as the process writes them. Interleaving between the two
/// pipes follows arrival order at the readers.
pub struct OutputStream {
    child: Child,
    program: PathBuf,
    lines: mpsc::Receiver<String>,
}

impl OutputStream {
    pub fn spawn(cmd: &StepCommand) -> JobResult<Self> {
        let mut child = cmd.spawn()?;
        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }
        Ok(Self {
            child,
            program: cmd.program().to_path_buf(),
            lines,
        })
    }

    /// Next output line without its line terminator. `None` once both pipes
    /// have closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for the process to exit. `None` means it died from a signal.
    pub async fn wait(&mut self) -> JobResult<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    /// Kill and reap the process.
    pub async fn kill(&mut self) {
        terminate(&mut self.child, &self.program).await;
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(pipe: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed reading step output");
                break;
            }
        }
    }
}
