//! Background task that reads frames from the server and routes them.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::lsp::dispatch::{Dispatcher, RouteError};
use crate::lsp::framing::{read_frame, FrameError};

/// Why the reader loop stopped processing input.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Observable state of the reader task.
#[derive(Debug, Clone, Default)]
pub enum ReaderStatus {
    #[default]
    Running,
    /// The server closed its output cleanly between frames.
    Finished,
    /// Reading stopped on a framing or routing error.
    Failed(Arc<ReaderError>),
}

impl ReaderStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ReaderStatus::Running)
    }

    pub fn failure(&self) -> Option<Arc<ReaderError>> {
        match self {
            ReaderStatus::Failed(cause) => Some(Arc::clone(cause)),
            _ => None,
        }
    }
}

/// Spawn the reader loop on the current Tokio runtime.
///
/// The dispatcher (and with it the queue senders) is dropped only after the
/// final status has been published, so a consumer that observes a closed
/// queue always observes the terminal status too.
pub fn spawn_reader<R>(
    stdout: R,
    dispatcher: Dispatcher,
    status: watch::Sender<ReaderStatus>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = read_loop(stdout, &dispatcher).await;

        let final_status = match outcome {
            Ok(()) => {
                debug!("LSP server stdout closed");
                ReaderStatus::Finished
            }
            Err(ReaderError::Route(RouteError::ConsumerGone)) => {
                debug!("LSP client dropped, stopping reader");
                ReaderStatus::Finished
            }
            Err(e) => {
                error!("LSP reader stopped: {}", e);
                ReaderStatus::Failed(Arc::new(e))
            }
        };

        status.send_replace(final_status);
        drop(dispatcher);
    })
}

async fn read_loop<R>(stdout: R, dispatcher: &Dispatcher) -> Result<(), ReaderError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);

    loop {
        let message = match read_frame(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Failed to read LSP frame: {}", e);
                return Err(e.into());
            }
        };

        trace!(
            "Received LSP message (id: {:?}, method: {:?})",
            message.id,
            message.method
        );
        dispatcher.route(message)?;
    }
}
