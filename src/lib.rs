//! lsp-probe Library
//!
//! A minimal client for JSON-RPC language servers running as child
//! processes:
//!
//! - `lsp` - framing, reader task, dispatcher and the `LspClient` façade
//! - `config` - how to launch the server (file or environment)
//!
//! ```ignore
//! use lsp_probe::lsp::{ChildTransport, ClientOptions, LspClient};
//!
//! let transport = ChildTransport::spawn(&config)?;
//! let mut client = LspClient::connect(transport, ClientOptions::default())?;
//! let id = client.request("initialize", params).await?;
//! let response = client.next_response().await?;
//! ```

pub mod config;
pub mod lsp;
