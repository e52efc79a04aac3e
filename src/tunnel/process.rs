//! Launching tunnel executables and reading their output line by line.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use bytes::BytesMut;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use tokio::process::Child;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::debug;

use super::{TunnelError, TunnelResult};

/// A command that launches a tunnel.
///
/// # Example
///
/// ```
/// use gauntlet::tunnel::Command;
///
/// let cmd = Command::new("BrowserStackLocal")
///     .secret_arg("abc123")
///     .arg("-onlyAutomate")
///     .working_dir("/opt/tunnel");
///
/// assert_eq!(cmd.args.len(), 2);
/// assert_eq!(cmd.display(), "BrowserStackLocal '<redacted>' -onlyAutomate");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    /// Indices into `args` that must never be logged.
    secret_args: Vec<usize>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an argument that is redacted from [`display`](Self::display).
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted command line with secrets redacted, for logs.
    pub fn display(&self) -> String {
        let args = self.args.iter().enumerate().map(|(index, arg)| {
            if self.secret_args.contains(&index) {
                "<redacted>"
            } else {
                arg.as_str()
            }
        });
        std::iter::once(self.program.as_str())
            .chain(args)
            .map(|part| shell_words::quote(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A line printed by the tunnel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }
}

/// Longest line yielded before it is split.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Newline-delimited output, decoded lossily.
///
/// Invalid UTF-8 is replaced rather than rejected, and a line longer than
/// `max_length` bytes is yielded in pieces, so the stream only ends at EOF.
#[derive(Debug, Clone, Copy)]
pub struct OutputLines {
    max_length: usize,
}

impl OutputLines {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
        }
    }
}

impl Default for OutputLines {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl Decoder for OutputLines {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        let end = match buf.iter().position(|b| *b == b'\n') {
            Some(newline) if newline < self.max_length => newline + 1,
            _ if buf.len() >= self.max_length => self.max_length,
            _ => return Ok(None),
        };
        Ok(Some(lossy_line(&buf.split_to(end))))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(lossy_line(&rest)))
    }
}

fn lossy_line(frame: &[u8]) -> String {
    let line = frame.strip_suffix(b"\n").unwrap_or(frame);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Merged stdout/stderr lines of a process.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// A spawned tunnel process with its merged output.
pub struct TunnelProcess {
    pub child: Child,
    pub lines: OutputStream,
}

/// Spawns `command` with piped output.
///
/// Output is split on newlines by [`OutputLines`]; partial chunks are
/// buffered until their newline arrives, and a trailing partial line is
/// yielded at EOF.
pub fn spawn(command: &Command) -> TunnelResult<TunnelProcess> {
    let mut process = tokio::process::Command::new(&command.program);
    process.args(&command.args);
    for (key, value) in &command.env {
        process.env(key, value);
    }
    if let Some(dir) = &command.working_dir {
        process.current_dir(dir);
    }
    process
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = process.spawn().map_err(|e| TunnelError::Spawn {
        program: command.program.clone(),
        message: e.to_string(),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TunnelError::Internal("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TunnelError::Internal("stderr was not captured".to_string()))?;

    // Read errors end the pipe; decoding itself never fails.
    let stdout = FramedRead::new(stdout, OutputLines::default())
        .take_while(|line| future::ready(line.is_ok()))
        .filter_map(|line| future::ready(line.ok().map(OutputLine::Stdout)));
    let stderr = FramedRead::new(stderr, OutputLines::default())
        .take_while(|line| future::ready(line.is_ok()))
        .filter_map(|line| future::ready(line.ok().map(OutputLine::Stderr)));

    debug!("Spawned {} (pid {:?})", command.program, child.id());

    Ok(TunnelProcess {
        child,
        lines: Box::pin(stream::select(stdout, stderr)),
    })
}

/// Stops a child: SIGTERM, wait up to `grace`, then kill.
///
/// Returns the exit code, or `None` when the process died from a signal.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id()
            && kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
        {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                return status.code();
            }
            debug!("pid {} ignored SIGTERM for {:?}, killing", pid, grace);
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!("kill failed: {}", e);
    }
    child.wait().await.ok().and_then(|status| status.code())
}
