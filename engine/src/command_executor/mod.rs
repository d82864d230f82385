//! Secure subprocess execution
//!
//! Every external tool runs through a [`ProcessRunner`]. The production runner,
//! [`CommandExecutor`], validates the program against an allowlist, spawns it
//! execve-style from an argument vector (never through a shell), caps captured
//! output, and enforces the timeout and cancellation paths with a
//! SIGTERM, grace period, SIGKILL sequence.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Programs that would hand their arguments to a command interpreter
const SHELLS: &[&str] = &[
    "sh", "bash", "zsh", "fish", "dash", "ksh", "csh", "tcsh", "pwsh", "powershell", "cmd",
    "env",
];

const READ_CHUNK: usize = 8 * 1024;

/// A fully built command: program plus one argv element per flag or value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub output_limit: usize,
}

impl CommandSpec {
    /// The exact vector handed to the spawn call, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.to_string_lossy().into_owned());
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn program_name(&self) -> String {
        program_name(&self.program)
    }
}

/// Captured result of a process that exited on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

impl CapturedOutput {
    /// Successful output with the given stdout, mostly useful for in-process tools.
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("Shell invocation attempt detected")]
    ShellInjectionAttempt,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Program not found: {0}")]
    NotFound(String),

    #[error("Process timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("Process cancelled")]
    Cancelled,

    #[error("Command execution failed: {0}")]
    ExecutionFailed(#[from] std::io::Error),
}

/// Runs one external process to completion, timeout, or cancellation.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CapturedOutput, CommandError>;
}

/// CommandExecutor provides secure command execution with allowlist validation
/// and shell injection prevention.
///
/// # Security Features
/// - Allowlist-based program validation (by file name)
/// - Shell interpreter rejection
/// - NUL byte rejection in arguments
/// - execve-style execution (no shell)
/// - stdin set to null, stdout/stderr piped and size-capped
/// - The child leads its own process group so termination reaches helpers it forks
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    allowlist: HashSet<String>,
    kill_grace: Duration,
}

enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl CommandExecutor {
    /// Creates a CommandExecutor allowing exactly the given program names.
    pub fn with_allowlist<I, S>(programs: I, kill_grace: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowlist: programs.into_iter().map(Into::into).collect(),
            kill_grace,
        }
    }

    /// Adds a program to the allowlist.
    pub fn allow_command(&mut self, command: impl Into<String>) {
        self.allowlist.insert(command.into());
    }

    pub fn is_allowed(&self, program: &Path) -> bool {
        self.allowlist.contains(&program_name(program))
    }

    /// Validates a command through all security gates without executing it.
    pub fn validate(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        let name = spec.program_name();

        // Gate 1: Reject shell interpreters even if someone allowlisted them
        if SHELLS.contains(&name.as_str()) {
            return Err(CommandError::ShellInjectionAttempt);
        }

        // Gate 2: Program must be allowlisted
        if !self.allowlist.contains(&name) {
            return Err(CommandError::CommandNotAllowed(name));
        }

        // Gate 3: Arguments must be representable as C strings
        if let Some(arg) = spec.args.iter().find(|a| a.contains('\0')) {
            return Err(CommandError::InvalidArgument(arg.replace('\0', "\\0")));
        }

        Ok(())
    }

    /// Stop a running child: SIGTERM to its process group, wait out the grace
    /// period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                debug!("SIGTERM to process group {} failed: {}", pid, e);
            }
            if tokio::time::timeout(self.kill_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
            let _ = killpg(pgid, Signal::SIGKILL);
        }

        if let Err(e) = child.kill().await {
            debug!("Kill after termination returned: {}", e);
        }
    }
}

#[async_trait]
impl ProcessRunner for CommandExecutor {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CapturedOutput, CommandError> {
        self.validate(spec)?;

        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotFound(spec.program_name())
            } else {
                CommandError::ExecutionFailed(e)
            }
        })?;
        debug!(program = %spec.program_name(), pid = ?child.id(), "Spawned tool process");

        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), spec.output_limit));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), spec.output_limit));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status?),
            _ = tokio::time::sleep(spec.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        let status = match ending {
            Ending::Exited(status) => status,
            Ending::TimedOut => {
                self.terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::TimedOut {
                    elapsed: started.elapsed(),
                });
            }
            Ending::Cancelled => {
                self.terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::Cancelled);
            }
        };

        // Pipes close at exit unless an orphaned grandchild keeps them open
        let (stdout, stdout_truncated) = join_reader(stdout_task, self.kill_grace).await;
        let (stderr, stderr_truncated) = join_reader(stderr_task, self.kill_grace).await;

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            stdout_truncated,
            stderr_truncated,
            duration: started.elapsed(),
        })
    }
}

async fn join_reader(
    mut task: tokio::task::JoinHandle<(Vec<u8>, bool)>,
    wait: Duration,
) -> (Vec<u8>, bool) {
    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            (Vec::new(), true)
        }
        Err(_) => {
            task.abort();
            (Vec::new(), true)
        }
    }
}

/// Read a stream to EOF keeping at most `limit` bytes; the rest is drained and
/// dropped so the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Stopped reading tool output: {}", e);
                break;
            }
        }
    }
    (kept, truncated)
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Scripted stand-in for a real process runner.
///
/// Records the exact argv of every call and replies with canned output keyed
/// by program name. A configured delay is honoured against the command timeout
/// and the cancellation token, so dispatcher behaviour can be exercised
/// without spawning anything.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    inner: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: Vec<Vec<String>>,
    replies: HashMap<String, CapturedOutput>,
    delays: HashMap<String, Duration>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `program` with the given stdout and exit code.
    pub fn respond(&self, program: &str, stdout: &str, exit_code: i32) -> &Self {
        let mut state = self.lock();
        state.replies.insert(
            program.to_string(),
            CapturedOutput {
                stdout: stdout.to_string(),
                exit_code: Some(exit_code),
                ..CapturedOutput::default()
            },
        );
        self
    }

    /// Make `program` take `delay` before replying.
    pub fn delay(&self, program: &str, delay: Duration) -> &Self {
        self.lock().delays.insert(program.to_string(), delay);
        self
    }

    /// Every argv handed to `run`, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CapturedOutput, CommandError> {
        let name = spec.program_name();
        let (reply, delay) = {
            let mut state = self.lock();
            state.calls.push(spec.argv());
            (
                state.replies.get(&name).cloned().unwrap_or_else(|| CapturedOutput {
                    exit_code: Some(0),
                    ..CapturedOutput::default()
                }),
                state.delays.get(&name).copied().unwrap_or_default(),
            )
        };

        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(delay.min(spec.timeout)) => {}
            _ = cancel.cancelled() => return Err(CommandError::Cancelled),
        }
        if delay >= spec.timeout {
            return Err(CommandError::TimedOut {
                elapsed: started.elapsed(),
            });
        }

        let mut reply = reply;
        if reply.stdout.len() > spec.output_limit {
            let mut end = spec.output_limit;
            while !reply.stdout.is_char_boundary(end) {
                end -= 1;
            }
            reply.stdout.truncate(end);
            reply.stdout_truncated = true;
        }
        reply.duration = started.elapsed();
        Ok(reply)
    }
}
