//! Line protocol to the privileged worker.
//!
//! The worker was started by our launcher and talks to us over two
//! inherited descriptors. A request is one line of separator-joined fields.
//! For each request the worker first answers with the liveness token, then
//! with exactly one result line.

use crate::config::ChannelConfig;
use crate::signals::{SignalRegistry, Termination};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub const TERMINATOR: char = '\n';

/// Errors talking to the worker.
#[derive(Debug)]
pub enum ChannelError {
    /// A field would break the line framing.
    InvalidField { field: String },
    Io {
        op: &'static str,
        source: std::io::Error,
    },
    /// Inbound stream hit EOF.
    Closed,
    /// No line within the liveness window.
    Unresponsive { attempts: u32 },
    /// Something other than the liveness token came back.
    UnexpectedReply { expected: String, got: String },
    /// A termination request arrived while waiting on the worker.
    Terminated(Termination),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::InvalidField { field } => {
                write!(f, "request field {field:?} contains a separator or newline")
            }
            ChannelError::Io { op, source } => write!(f, "privileged channel {op} failed: {source}"),
            ChannelError::Closed => write!(f, "privileged process closed the channel"),
            ChannelError::Unresponsive { attempts } => {
                write!(f, "privileged process is not responding ({attempts} attempts)")
            }
            ChannelError::UnexpectedReply { expected, got } => write!(
                f,
                "privileged process is not responding (expected {expected:?}, got {got:?})"
            ),
            ChannelError::Terminated(t) => write!(f, "{t}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io { source, .. } => Some(source),
            ChannelError::Terminated(t) => Some(t),
            _ => None,
        }
    }
}

impl ChannelError {
    fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| ChannelError::Io { op, source }
    }
}

/// Source of result lines.
pub trait Inbound {
    fn set_nonblocking(&mut self, nonblocking: bool) -> std::io::Result<()>;

    /// Next complete line without its terminator. `Ok(None)` means nothing
    /// complete is available yet (non-blocking mode only); EOF is
    /// `UnexpectedEof`.
    fn read_line(&mut self) -> std::io::Result<Option<String>>;
}

/// Buffered line reader over an inherited descriptor.
///
/// Keeps its own buffer so bytes read past the liveness token while
/// non-blocking are still there for the blocking result read.
pub struct PipeReader {
    file: File,
    buf: Vec<u8>,
}

impl PipeReader {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            buf: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == TERMINATOR as u8)?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        // Trailing whitespace (`\r` included) is not part of the reply.
        Some(String::from_utf8_lossy(&line[..pos]).trim_end().to_string())
    }
}

impl Inbound for PipeReader {
    fn set_nonblocking(&mut self, nonblocking: bool) -> std::io::Result<()> {
        let fd = self.file.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        let flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags & !OFlag::O_NONBLOCK
        };
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            match self.file.read(&mut chunk) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Liveness handshake settings.
#[derive(Debug, Clone)]
pub struct Liveness {
    pub token: String,
    pub attempts: u32,
    pub interval: Duration,
}

impl From<&ChannelConfig> for Liveness {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            token: config.liveness_token.clone(),
            attempts: config.liveness_attempts,
            interval: Duration::from_millis(config.liveness_interval_ms),
        }
    }
}

/// Request/response endpoint to the privileged worker. Requests must not
/// overlap; `&mut self` everywhere enforces that.
pub struct PrivilegedChannel<W = File, R = PipeReader> {
    outbound: W,
    inbound: R,
    separator: char,
    liveness: Liveness,
}

impl PrivilegedChannel {
    /// Take ownership of the two inherited descriptors.
    ///
    /// # Safety
    /// Both descriptors must be open, distinct, and not owned by anything
    /// else in this process.
    pub unsafe fn from_raw_fds(
        request_fd: RawFd,
        result_fd: RawFd,
        separator: char,
        liveness: Liveness,
    ) -> Self {
        Self::new(
            File::from_raw_fd(request_fd),
            PipeReader::new(OwnedFd::from_raw_fd(result_fd)),
            separator,
            liveness,
        )
    }
}

impl<W: Write, R: Inbound> PrivilegedChannel<W, R> {
    pub fn new(outbound: W, inbound: R, separator: char, liveness: Liveness) -> Self {
        Self {
            outbound,
            inbound,
            separator,
            liveness,
        }
    }

    /// Encode `fields` as one request line.
    pub fn encode<S: AsRef<str>>(&self, fields: &[S]) -> Result<String, ChannelError> {
        let mut line = String::new();
        for (i, field) in fields.iter().enumerate() {
            let field = field.as_ref();
            if field.contains(self.separator) || field.contains(TERMINATOR) {
                return Err(ChannelError::InvalidField {
                    field: field.to_string(),
                });
            }
            if i > 0 {
                line.push(self.separator);
            }
            line.push_str(field);
        }
        line.push(TERMINATOR);
        Ok(line)
    }

    /// Write one request line in a single write.
    pub fn write_request<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), ChannelError> {
        let line = self.encode(fields)?;
        self.outbound
            .write_all(line.as_bytes())
            .map_err(ChannelError::io("write"))?;
        self.outbound.flush().map_err(ChannelError::io("flush"))?;
        Ok(())
    }

    /// Blocking read of one result line.
    pub fn read_line(&mut self) -> Result<String, ChannelError> {
        loop {
            match self.inbound.read_line() {
                Ok(Some(line)) => return Ok(line),
                // Spurious: the stream is in blocking mode here.
                Ok(None) => continue,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(ChannelError::Closed),
                Err(e) => return Err(ChannelError::io("read")(e)),
            }
        }
    }

    /// Write a request and wait for the liveness token.
    ///
    /// Polls non-blocking up to `liveness.attempts` times, one interval
    /// apart, draining `signals` before each wait.
    pub fn request_checked<S: AsRef<str>>(
        &mut self,
        fields: &[S],
        signals: &mut SignalRegistry,
    ) -> Result<(), ChannelError> {
        self.write_request(fields)?;

        self.inbound
            .set_nonblocking(true)
            .map_err(ChannelError::io("fcntl"))?;
        let reply = self.await_liveness(signals);
        self.inbound
            .set_nonblocking(false)
            .map_err(ChannelError::io("fcntl"))?;

        match reply? {
            Some(line) if line == self.liveness.token => Ok(()),
            Some(line) => Err(ChannelError::UnexpectedReply {
                expected: self.liveness.token.clone(),
                got: line,
            }),
            None => Err(ChannelError::Unresponsive {
                attempts: self.liveness.attempts,
            }),
        }
    }

    fn await_liveness(
        &mut self,
        signals: &mut SignalRegistry,
    ) -> Result<Option<String>, ChannelError> {
        for _ in 0..self.liveness.attempts {
            signals.drain().map_err(ChannelError::Terminated)?;
            std::thread::sleep(self.liveness.interval);
            match self.inbound.read_line() {
                // A blank line is not an answer; keep polling.
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => return Ok(Some(line)),
                Ok(None) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(ChannelError::Closed),
                Err(e) => return Err(ChannelError::io("read")(e)),
            }
        }
        Ok(None)
    }

    /// Run a named task on the worker and return its result line verbatim.
    pub fn run_task(
        &mut self,
        name: &str,
        args: &[&str],
        signals: &mut SignalRegistry,
    ) -> Result<String, ChannelError> {
        let mut fields = Vec::with_capacity(args.len() + 1);
        fields.push(name);
        fields.extend_from_slice(args);

        tracing::debug!(task = name, ?args, "privileged task");
        self.request_checked(&fields, signals)?;
        let result = self.read_line()?;
        tracing::debug!(task = name, %result, "privileged task result");
        Ok(result)
    }
}
