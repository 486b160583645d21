/// Supervised execution of external commands (nvd, nix).
///
/// The child runs in its own process group with its output captured through
/// a non-blocking socket. Each poll cycle drains the signal registry first,
/// so a termination request is seen within one poll interval and escalated
/// to the whole group: SIGTERM, a grace period, then SIGKILL.
use crate::config::SupervisorConfig;
use crate::signals::{SignalRegistry, Termination, EXIT_SIGNAL_SHIFT};
use crate::term;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{ErrorKind, Read};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

pub const SIG_TERMINATE: Signal = Signal::SIGTERM;
pub const SIG_KILL: Signal = Signal::SIGKILL;

/// Lifecycle of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    /// SIGTERM path entered, waiting out the grace period.
    Terminating,
    /// Had to be SIGKILLed.
    Killed,
    Exited(i32),
}

impl ChildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChildState::Killed | ChildState::Exited(_))
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Leave the child's stderr on ours instead of merging it into the capture.
    pub separate_stderr: bool,
    /// Strip colour sequences from captured output and set `NO_COLOR=1`.
    pub no_color: bool,
    /// Copy captured lines to our stderr as they arrive.
    pub echo: bool,
    /// Turn a non-zero exit into an error instead of just reporting it.
    pub exit_on_error: bool,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

/// Timing of the SIGTERM to SIGKILL escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// Wait after SIGTERM before SIGKILL.
    pub grace: Duration,
    /// Exit checks during the grace period.
    pub poll_interval: Duration,
}

/// Result of a completed command.
#[derive(Debug)]
pub struct RunOutput {
    pub code: i32,
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Errors that can occur while supervising a command.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to spawn the command.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to read output or wait on the child.
    Io { source: std::io::Error },
    /// Failed to signal the process group.
    Signal { signal: Signal, source: Errno },
    /// The command exited unsuccessfully and the caller asked to abort.
    Failed { command: String, code: i32 },
    /// A termination request arrived while the command was running.
    Terminated {
        termination: Termination,
        outcome: ChildState,
    },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { command, source } => {
                write!(f, "failed to spawn `{command}`: {source}")
            }
            SupervisorError::Io { source } => {
                write!(f, "I/O error while supervising subprocess: {source}")
            }
            SupervisorError::Signal { signal, source } => {
                write!(f, "failed to send {} to subprocess: {source}", signal.as_str())
            }
            SupervisorError::Failed { command, code } => {
                write!(f, "`{command}` subprocess error (exit code {code})")
            }
            SupervisorError::Terminated { termination, .. } => write!(f, "{termination}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Io { source } => Some(source),
            SupervisorError::Signal { source, .. } => Some(source),
            SupervisorError::Failed { .. } => None,
            SupervisorError::Terminated { termination, .. } => Some(termination),
        }
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(source: std::io::Error) -> Self {
        SupervisorError::Io { source }
    }
}

/// Exit code of a finished child; death by signal maps to 128 + n.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|n| EXIT_SIGNAL_SHIFT + n))
        .unwrap_or(1)
}

/// Accumulates captured output line by line.
///
/// Partial lines are held back so a colour sequence split across two reads
/// is still stripped.
struct OutputBuffer {
    text: String,
    partial: Vec<u8>,
    no_color: bool,
    echo: bool,
}

impl OutputBuffer {
    fn new(no_color: bool, echo: bool) -> Self {
        Self {
            text: String::new(),
            partial: Vec::new(),
            no_color,
            echo,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.append(&String::from_utf8_lossy(&line));
        }
    }

    fn finish(mut self) -> String {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.append(&String::from_utf8_lossy(&rest));
        }
        self.text
    }

    fn append(&mut self, line: &str) {
        let line = if self.no_color {
            term::strip_color(line)
        } else {
            line.into()
        };
        if self.echo {
            eprint!("{line}");
        }
        self.text.push_str(&line);
    }
}

/// A running child and its process group.
///
/// Dropping a handle whose child hasn't been seen to finish stops the whole
/// group first.
pub struct Subprocess {
    child: Child,
    pgid: Pid,
    output: UnixStream,
    state: ChildState,
    escalation: Escalation,
}

impl Subprocess {
    /// Spawn `argv` as the leader of a new process group.
    pub fn spawn(
        argv: &[String],
        options: &RunOptions,
        escalation: Escalation,
    ) -> Result<Self, SupervisorError> {
        let command_line = argv.join(" ");
        let spawn_err = |source| SupervisorError::Spawn {
            command: command_line.clone(),
            source,
        };
        let (program, args) = argv.split_first().ok_or_else(|| {
            spawn_err(std::io::Error::new(ErrorKind::InvalidInput, "empty command"))
        })?;

        let (ours, theirs) = UnixStream::pair().map_err(spawn_err)?;
        ours.set_nonblocking(true).map_err(spawn_err)?;

        // The command (and with it our copies of the child's ends) is
        // dropped at the end of this block so EOF follows child exit.
        let child = {
            let mut cmd = Command::new(program);
            cmd.args(args).stdin(Stdio::null()).process_group(0);
            if !options.separate_stderr {
                let stderr = theirs.try_clone().map_err(spawn_err)?;
                cmd.stderr(Stdio::from(OwnedFd::from(stderr)));
            }
            cmd.stdout(Stdio::from(OwnedFd::from(theirs)));
            if options.no_color {
                cmd.env(term::NO_COLOR_ENV, "1");
            }
            for (key, value) in &options.env {
                cmd.env(key, value);
            }
            cmd.spawn().map_err(spawn_err)?
        };

        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(pid = pid.as_raw(), command = %command_line, "subprocess started");

        Ok(Self {
            child,
            // process_group(0) makes the child its own group leader.
            pgid: pid,
            output: ours,
            state: ChildState::Running,
            escalation,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Read whatever output is available without blocking.
    fn read_available(&mut self, out: &mut OutputBuffer) -> Result<(), SupervisorError> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.output.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => out.push(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Non-blocking exit check; records the exit code once seen.
    fn poll_exit(&mut self) -> Result<Option<i32>, SupervisorError> {
        if let ChildState::Exited(code) = self.state {
            return Ok(Some(code));
        }
        match self.child.try_wait()? {
            Some(status) => {
                let code = exit_code(status);
                if self.state == ChildState::Running {
                    self.state = ChildState::Exited(code);
                }
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    fn signal_group(&self, signal: Signal) -> Result<(), SupervisorError> {
        match killpg(self.pgid(), signal) {
            // Group already gone.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal { signal, source }),
        }
    }

    /// Stop the child: SIGTERM to the group, wait out the grace period,
    /// then SIGKILL and wait for good.
    ///
    /// Output produced meanwhile is read and discarded so a child flushing
    /// on its way out can't block on a full socket.
    pub fn terminate(&mut self) -> Result<ChildState, SupervisorError> {
        let Escalation {
            grace,
            poll_interval,
        } = self.escalation;
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        self.state = ChildState::Terminating;

        let mut sink = OutputBuffer::new(false, false);
        if self.child.try_wait()?.is_none() {
            tracing::warn!(pid = self.pid().as_raw(), "terminating running subprocess...");
            self.signal_group(SIG_TERMINATE)?;
        }

        let deadline = Instant::now() + grace;
        loop {
            self.read_available(&mut sink)?;
            if let Some(status) = self.child.try_wait()? {
                self.state = ChildState::Exited(exit_code(status));
                tracing::warn!("ok");
                return Ok(self.state);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(poll_interval.min(deadline - now));
        }

        self.signal_group(SIG_KILL)?;
        tracing::warn!("  SIGKILL has been sent to the subprocess as a last resort");
        self.child.wait()?;
        self.state = ChildState::Killed;
        tracing::warn!("ok");
        Ok(self.state)
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Err(e) = self.terminate() {
            tracing::error!(pid = self.pid().as_raw(), error = %e, "failed to stop abandoned subprocess");
        }
    }
}

/// Runs external commands under supervision.
#[derive(Debug, Clone)]
pub struct Supervisor {
    poll_interval: Duration,
    escalation: Escalation,
}

impl Supervisor {
    pub fn new(poll_interval: Duration, term_grace: Duration) -> Self {
        Self {
            poll_interval,
            escalation: Escalation {
                grace: term_grace,
                poll_interval,
            },
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(config.term_grace_secs),
        )
    }

    /// Run `argv` to completion, capturing its output.
    ///
    /// A non-zero exit is always logged; it is an error only when
    /// `options.exit_on_error` is set. A termination request seen at a poll
    /// stops the child and comes back as [`SupervisorError::Terminated`].
    pub fn run(
        &self,
        argv: &[String],
        options: &RunOptions,
        signals: &mut SignalRegistry,
    ) -> Result<RunOutput, SupervisorError> {
        let command = argv.join(" ");
        tracing::debug!("> {command}");

        let mut proc = Subprocess::spawn(argv, options, self.escalation)?;
        let mut out = OutputBuffer::new(options.no_color, options.echo);

        let code = loop {
            if let Err(termination) = signals.drain() {
                // The termination decides the exit code even if stopping the
                // child went wrong.
                if let Err(e) = proc.terminate() {
                    tracing::error!(pid = proc.pid().as_raw(), error = %e, "failed to stop subprocess");
                }
                tracing::debug!(pid = proc.pid().as_raw(), state = ?proc.state(), "subprocess stopped");
                return Err(SupervisorError::Terminated {
                    termination,
                    outcome: proc.state(),
                });
            }
            proc.read_available(&mut out)?;
            if let Some(code) = proc.poll_exit()? {
                break code;
            }
            std::thread::sleep(self.poll_interval);
        };

        proc.read_available(&mut out)?;
        let result = RunOutput {
            code,
            output: out.finish(),
        };

        if !result.success() {
            tracing::error!(code, "`{command}` subprocess error");
            if options.exit_on_error {
                return Err(SupervisorError::Failed { command, code });
            }
        }
        tracing::debug!("> done");

        Ok(result)
    }
}
