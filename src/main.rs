//! lsp-probe - start a language server, run its lifecycle, print the traffic.
//!
//! Spawns the configured server, sends `initialize`, prints the response and
//! the first notification, shuts the server down and prints whatever else
//! was still queued.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lsp_probe::config::ServerConfig;
use lsp_probe::lsp::{
    ChildTransport, ClientError, ClientOptions, InitializeParams, LspClient, Transport,
};

/// How long to wait for the first notification after initialize.
const NOTIFICATION_WAIT: Duration = Duration::from_secs(5);

fn print_json(label: &str, value: &impl Serialize) -> Result<()> {
    println!("{}:", label);
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to format message")?
    );
    Ok(())
}

/// Print everything still sitting in either queue.
fn drain<T: Transport>(client: &mut LspClient<T>) -> Result<()> {
    loop {
        let mut any_non_empty = false;

        if let Ok(Some(response)) = client.try_next_response() {
            print_json("Response", &response.to_message())?;
            any_non_empty = true;
        }
        if let Ok(Some(notification)) = client.try_next_notification() {
            print_json("Notification", &notification.to_message())?;
            any_non_empty = true;
        }

        if !any_non_empty {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the printed messages
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lsp_probe=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting lsp-probe v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load().context("Failed to load server configuration")?;
    let transport = ChildTransport::spawn(&config)
        .with_context(|| format!("Failed to spawn LSP server process: {}", config.command))?;
    let mut client = LspClient::connect(transport, ClientOptions::default())
        .context("Failed to connect to LSP server")?;

    let params = InitializeParams::for_root(config.root_path.as_deref());
    let response = client
        .initialize(params)
        .await
        .context("LSP initialize failed")?;
    print_json("Response", &response.to_message())?;

    match client.next_notification_timeout(NOTIFICATION_WAIT).await {
        Ok(notification) => print_json("Notification", &notification.to_message())?,
        Err(ClientError::Timeout(_)) => warn!("No notification within {:?}", NOTIFICATION_WAIT),
        Err(e) => return Err(e).context("Failed to read notification"),
    }

    let response = client.shutdown().await.context("LSP shutdown failed")?;
    print_json("Response", &response.to_message())?;

    drain(&mut client)?;

    println!("Done");
    Ok(())
}
