//! JSON-RPC client for language servers spoken over child process stdio.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   request()    ┌──────────┐  stdin   ┌──────────────┐
//! │  LspClient   │ ─────────────► │ framing  │ ───────► │              │
//! │              │                └──────────┘          │  language    │
//! │  responses ◄─┼── Dispatcher ◄── reader task ◄────── │  server      │
//! │  notifs    ◄─┘                                stdout└──────────────┘
//! ```
//!
//! Writing happens on the caller's task, reading on a dedicated reader task.
//! The two directions share no lock; the only shared state is the two
//! delivery queues and the [`Correlator`](dispatch::Correlator).
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"shutdown","params":null}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lsp_probe::config::ServerConfig;
//! use lsp_probe::lsp::{ChildTransport, ClientOptions, InitializeParams, LspClient};
//!
//! let config = ServerConfig::load()?;
//! let transport = ChildTransport::spawn(&config)?;
//! let mut client = LspClient::connect(transport, ClientOptions::default())?;
//! client.initialize(InitializeParams::for_root(config.root_path.as_deref())).await?;
//! client.shutdown().await?;
//! ```

pub mod client;
pub mod dispatch;
pub mod framing;
pub mod message;
pub mod reader;
pub mod transport;

pub use client::{
    path_to_uri, ClientError, ClientOptions, ClientState, InitializeParams, LspClient,
    METHOD_EXIT, METHOD_INITIALIZE, METHOD_SHUTDOWN,
};
pub use dispatch::{Correlator, Dispatcher, RouteError, UnknownIdPolicy};
pub use framing::{
    encode, read_frame, write_message, FrameError, MAX_HEADER_LINE, MAX_MESSAGE_SIZE,
};
pub use message::{
    Incoming, Message, MessageId, Notification, RequestId, Response, ResponseError,
    JSONRPC_VERSION,
};
pub use reader::{ReaderError, ReaderStatus};
pub use transport::{ChildTransport, ExitReport, Transport};
