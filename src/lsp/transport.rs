//! Byte-stream transport to the language server process.
//!
//! The client never spawns anything itself. It is handed a [`Transport`]
//! that yields the server's stdout (to read) and stdin (to write), and that
//! can report when the server process has exited. [`ChildTransport`] is the
//! implementation backed by a real child process.

use std::fmt;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::config::ServerConfig;

/// How the server process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, or `None` if the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitReport {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signaled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// The process side of the connection, as seen by the client.
///
/// Implementations own whatever sits behind the streams and must release it
/// when dropped.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Hand out the server's stdout and stdin. Called once per transport.
    fn take_streams(&mut self) -> io::Result<(Self::Reader, Self::Writer)>;

    /// Non-blocking exit query: `Some` once the process has terminated.
    fn try_exit(&mut self) -> io::Result<Option<ExitReport>>;

    /// Wait for the process to terminate.
    fn wait_for_exit(&mut self) -> impl Future<Output = io::Result<ExitReport>> + Send;
}

/// A language server running as a child process.
///
/// The child is spawned with `kill_on_drop`, so it never outlives the
/// transport, whichever path drops it.
pub struct ChildTransport {
    child: Child,
    program: String,
}

impl ChildTransport {
    /// Spawn the server described by `config` with piped stdin/stdout.
    ///
    /// stderr is discarded: it is not part of the protocol channel.
    pub fn spawn(config: &ServerConfig) -> io::Result<Self> {
        info!("Starting LSP server: {}", config.command);

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            debug!("LSP server working directory: {}", dir.display());
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        debug!("LSP server pid: {:?}", child.id());

        Ok(Self {
            child,
            program: config.command.clone(),
        })
    }

    /// OS process id, while the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

impl Transport for ChildTransport {
    type Reader = ChildStdout;
    type Writer = ChildStdin;

    fn take_streams(&mut self) -> io::Result<(ChildStdout, ChildStdin)> {
        let stdout = self.child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "LSP server stdout already taken")
        })?;
        let stdin = self.child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "LSP server stdin already taken")
        })?;
        Ok((stdout, stdin))
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitReport>> {
        Ok(self.child.try_wait()?.map(ExitReport::from))
    }

    async fn wait_for_exit(&mut self) -> io::Result<ExitReport> {
        let status = self.child.wait().await?;
        debug!("LSP server exited with {}", ExitReport::from(status));
        Ok(status.into())
    }
}
