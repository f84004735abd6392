//! The client façade: lifecycle, requests and the two delivery queues.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::lsp::dispatch::{Correlator, Dispatcher, UnknownIdPolicy};
use crate::lsp::framing::{write_message, FrameError};
use crate::lsp::message::{Message, Notification, RequestId, Response};
use crate::lsp::reader::{spawn_reader, ReaderError, ReaderStatus};
use crate::lsp::transport::{ExitReport, Transport};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_EXIT: &str = "exit";

/// Default timeout for the waits inside `initialize` and `shutdown`.
const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 30;

/// Default time the server gets to terminate after `exit`.
const DEFAULT_EXIT_TIMEOUT_SECS: u64 = 10;

/// Client-specific error types.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The method is not on the client's allow-list. Nothing was sent.
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("Cannot {operation} while client is {state}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },

    /// The server's output is closed and every queued message was consumed.
    #[error("Transport closed{}", .cause.as_ref().map(|c| format!(": {}", c)).unwrap_or_default())]
    TransportClosed { cause: Option<Arc<ReaderError>> },

    /// The server did not exit cleanly after `exit`.
    #[error("LSP server exited with unexpected status: {0}")]
    UnexpectedExitStatus(ExitReport),

    /// The server answered a lifecycle request with an error response.
    #[error("Server error {code}: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    fn closed(status: &ReaderStatus) -> Self {
        ClientError::TransportClosed {
            cause: status.failure(),
        }
    }
}

/// Lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Created => "created",
            ClientState::Initializing => "initializing",
            ClientState::Ready => "ready",
            ClientState::ShuttingDown => "shutting down",
            ClientState::Closed => "closed",
            ClientState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tunables for a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Methods `request` accepts. Everything else is `UnsupportedMethod`.
    pub allowed_methods: HashSet<String>,
    pub unknown_id_policy: UnknownIdPolicy,
    /// Bound on the response waits inside `initialize` and `shutdown`.
    /// `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// Bound on the wait for process exit inside `shutdown`.
    pub exit_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            allowed_methods: [METHOD_INITIALIZE, METHOD_SHUTDOWN, METHOD_EXIT]
                .into_iter()
                .map(String::from)
                .collect(),
            unknown_id_policy: UnknownIdPolicy::default(),
            response_timeout: Some(Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS)),
            exit_timeout: Some(Duration::from_secs(DEFAULT_EXIT_TIMEOUT_SECS)),
        }
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: u32,
    pub root_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,
    pub capabilities: Value,
}

impl InitializeParams {
    /// Params for the calling process, rooted at `root`, with no capabilities.
    pub fn for_root(root: Option<&Path>) -> Self {
        Self {
            process_id: std::process::id(),
            root_path: root.map(|p| p.to_string_lossy().into_owned()),
            root_uri: root.and_then(path_to_uri),
            capabilities: json!({}),
        }
    }
}

/// Convert a file path to a `file://` URI with proper percent-encoding.
///
/// Relative paths are resolved against the current directory first.
pub fn path_to_uri(path: &Path) -> Option<String> {
    let abs_path = if path.is_absolute() {
        PathBuf::from(path)
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Url::from_file_path(&abs_path).ok().map(|url| url.to_string())
}

/// JSON-RPC client for a language server behind a [`Transport`].
///
/// A background task reads the server's output and sorts it into a
/// response queue and a notification queue; the methods here drain them.
/// Dropping the client stops that task and drops the transport, which for
/// [`ChildTransport`](crate::lsp::transport::ChildTransport) kills the server.
pub struct LspClient<T: Transport> {
    transport: T,
    writer: T::Writer,
    correlator: Arc<Correlator>,
    responses: UnboundedReceiver<Response>,
    notifications: UnboundedReceiver<Notification>,
    /// Responses pulled off the queue while `initialize` or `shutdown` waited
    /// for their own id.
    set_aside: VecDeque<Response>,
    reader_status: watch::Receiver<ReaderStatus>,
    reader_task: JoinHandle<()>,
    lifecycle: ClientState,
    initialize_id: Option<RequestId>,
    exit_sent: bool,
    options: ClientOptions,
}

impl<T: Transport> LspClient<T> {
    /// Take the transport's streams and start the reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(mut transport: T, options: ClientOptions) -> Result<Self, ClientError> {
        let (stdout, stdin) = transport.take_streams()?;

        let correlator = Arc::new(Correlator::new());
        let (response_tx, responses) = unbounded_channel();
        let (notification_tx, notifications) = unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&correlator),
            response_tx,
            notification_tx,
            options.unknown_id_policy,
        );
        let (status_tx, reader_status) = watch::channel(ReaderStatus::Running);
        let reader_task = spawn_reader(stdout, dispatcher, status_tx);

        Ok(Self {
            transport,
            writer: stdin,
            correlator,
            responses,
            notifications,
            set_aside: VecDeque::new(),
            reader_status,
            reader_task,
            lifecycle: ClientState::Created,
            initialize_id: None,
            exit_sent: false,
            options,
        })
    }

    /// Current lifecycle state, taking the reader task into account.
    ///
    /// A reader failure, or the server closing its output before `exit` was
    /// sent, puts the client in `Failed`.
    pub fn state(&self) -> ClientState {
        match self.lifecycle {
            ClientState::Closed | ClientState::Failed => self.lifecycle,
            lifecycle => match &*self.reader_status.borrow() {
                ReaderStatus::Running => lifecycle,
                ReaderStatus::Failed(_) => ClientState::Failed,
                ReaderStatus::Finished if self.exit_sent => lifecycle,
                ReaderStatus::Finished => ClientState::Failed,
            },
        }
    }

    pub fn reader_status(&self) -> ReaderStatus {
        self.reader_status.borrow().clone()
    }

    /// Ids of requests still waiting for a response.
    pub fn outstanding(&self) -> Vec<RequestId> {
        self.correlator.outstanding()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a request and return its id without waiting for the response.
    ///
    /// The id is registered as outstanding before any byte is written, so a
    /// fast response can never arrive for an id we are not tracking yet.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<RequestId, ClientError> {
        if !self.options.allowed_methods.contains(method) {
            return Err(ClientError::UnsupportedMethod(method.to_string()));
        }
        let state = self.state();
        if matches!(state, ClientState::Closed | ClientState::Failed) {
            return Err(ClientError::InvalidState {
                operation: "send a request",
                state,
            });
        }

        let id = self.correlator.allocate();
        let message = Message::request(id, method, params);
        debug!("LSP request {} -> {}", id, method);

        if let Err(e) = write_message(&mut self.writer, &message).await {
            warn!("Failed to send LSP request {}: {}", id, e);
            self.correlator.release(id);
            return Err(e.into());
        }

        if method == METHOD_INITIALIZE && self.lifecycle == ClientState::Created {
            self.initialize_id = Some(id);
            self.lifecycle = ClientState::Initializing;
        }
        if method == METHOD_EXIT {
            self.exit_sent = true;
        }

        Ok(id)
    }

    /// Wait for the next response.
    ///
    /// Fails with `TransportClosed` once the server's output has ended and
    /// every queued response was consumed. Cancel-safe.
    pub async fn next_response(&mut self) -> Result<Response, ClientError> {
        if let Some(response) = self.set_aside.pop_front() {
            return Ok(self.observe(response));
        }
        match self.responses.recv().await {
            Some(response) => Ok(self.observe(response)),
            None => Err(ClientError::closed(&self.reader_status.borrow())),
        }
    }

    /// Next response if one is queued, without waiting.
    pub fn try_next_response(&mut self) -> Result<Option<Response>, ClientError> {
        if let Some(response) = self.set_aside.pop_front() {
            return Ok(Some(self.observe(response)));
        }
        match self.responses.try_recv() {
            Ok(response) => Ok(Some(self.observe(response))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(ClientError::closed(&self.reader_status.borrow()))
            }
        }
    }

    /// `next_response` bounded by `limit`.
    pub async fn next_response_timeout(&mut self, limit: Duration) -> Result<Response, ClientError> {
        timeout(limit, self.next_response())
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    /// Wait for the next notification. Cancel-safe.
    pub async fn next_notification(&mut self) -> Result<Notification, ClientError> {
        match self.notifications.recv().await {
            Some(notification) => Ok(notification),
            None => Err(ClientError::closed(&self.reader_status.borrow())),
        }
    }

    /// Next notification if one is queued, without waiting.
    pub fn try_next_notification(&mut self) -> Result<Option<Notification>, ClientError> {
        match self.notifications.try_recv() {
            Ok(notification) => Ok(Some(notification)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(ClientError::closed(&self.reader_status.borrow()))
            }
        }
    }

    /// `next_notification` bounded by `limit`.
    pub async fn next_notification_timeout(
        &mut self,
        limit: Duration,
    ) -> Result<Notification, ClientError> {
        timeout(limit, self.next_notification())
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    /// Send `initialize` and wait for its response.
    ///
    /// On success the client is `Ready`. An error response is returned as
    /// `ServerError` and leaves the client `Initializing`.
    pub async fn initialize(&mut self, params: InitializeParams) -> Result<Response, ClientError> {
        if self.lifecycle != ClientState::Created {
            return Err(ClientError::InvalidState {
                operation: "initialize",
                state: self.state(),
            });
        }

        let params = serde_json::to_value(&params).map_err(FrameError::Encode)?;
        let id = self.request(METHOD_INITIALIZE, params).await?;
        let response = self.wait_for(id).await?;

        match &response.payload {
            Ok(_) => {
                info!("LSP server initialized (id: {})", id);
                Ok(response)
            }
            Err(error) => {
                warn!("LSP initialize failed: {} (code: {})", error.message, error.code);
                Err(ClientError::ServerError {
                    code: error.code,
                    message: error.message.clone(),
                    data: error.data.clone(),
                })
            }
        }
    }

    /// Two-phase shutdown: `shutdown`, wait for its response, `exit`, then
    /// wait for the server process to terminate cleanly.
    ///
    /// Unlike `initialize`, an error reply to `shutdown` is not raised as
    /// `ServerError`: the server still gets `exit`, and the reply is returned
    /// as `Ok` with an error payload once the process has exited cleanly.
    ///
    /// Only valid from `Ready`; calling it twice fails with `InvalidState`.
    pub async fn shutdown(&mut self) -> Result<Response, ClientError> {
        let state = self.state();
        if state != ClientState::Ready {
            return Err(ClientError::InvalidState {
                operation: "shut down",
                state,
            });
        }

        info!("Shutting down LSP server");
        self.lifecycle = ClientState::ShuttingDown;

        let id = self.request(METHOD_SHUTDOWN, Value::Null).await?;
        let response = self.wait_for(id).await?;
        if let Err(error) = &response.payload {
            // The server still expects `exit` after a failed shutdown.
            warn!("LSP shutdown returned error: {} (code: {})", error.message, error.code);
        }

        self.request(METHOD_EXIT, Value::Null).await?;

        let report = match self.options.exit_timeout {
            Some(limit) => timeout(limit, self.transport.wait_for_exit())
                .await
                .map_err(|_| ClientError::Timeout(limit))??,
            None => self.transport.wait_for_exit().await?,
        };

        self.lifecycle = ClientState::Closed;
        if !report.success() {
            warn!("LSP server exited with {}", report);
            return Err(ClientError::UnexpectedExitStatus(report));
        }

        debug!("LSP server process exited cleanly");
        Ok(response)
    }

    /// Wait for the response to `id`, setting aside any other responses
    /// that arrive first so `next_response` still sees them in order.
    async fn wait_for(&mut self, id: RequestId) -> Result<Response, ClientError> {
        let limit = self.options.response_timeout;
        let wait = async {
            loop {
                let response = match self.responses.recv().await {
                    Some(response) => response,
                    None => return Err(ClientError::closed(&self.reader_status.borrow())),
                };
                if response.id == id {
                    return Ok(self.observe(response));
                }
                debug!("Setting aside response {} while waiting for {}", response.id, id);
                self.set_aside.push_back(response);
            }
        };

        match limit {
            Some(limit) => timeout(limit, wait)
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Track lifecycle transitions driven by responses.
    fn observe(&mut self, response: Response) -> Response {
        if self.lifecycle == ClientState::Initializing
            && Some(response.id) == self.initialize_id
            && !response.is_error()
        {
            debug!("LSP server ready (initialize id: {})", response.id);
            self.lifecycle = ClientState::Ready;
        }
        response
    }
}

impl<T: Transport> Drop for LspClient<T> {
    fn drop(&mut self) {
        // The transport is dropped right after this, which releases the
        // server process.
        self.reader_task.abort();
    }
}
