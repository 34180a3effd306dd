//! Newline-delimited JSON over a byte stream.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use varsync_core::{SessionManager, WatchStream};

use crate::error::ServerError;
use crate::handler::Handler;
use crate::protocol::WatchMessage;

/// Lines queued for the writer before producers wait.
const OUTPUT_BUFFER: usize = 256;

/// Serve one connection until `input` ends.
///
/// Responses and watch events share `output`; a single writer task owns it
/// so lines never interleave. When `input` closes, the connection's watch
/// streams are cancelled and its optimizer locks become reclaimable.
pub async fn serve<R, W>(manager: Arc<SessionManager>, input: R, output: W) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(OUTPUT_BUFFER);
    let writer = tokio::spawn(write_lines(output, rx));

    let handler = Handler::new(manager);
    let mut watches = JoinSet::new();
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let (response, stream) = handler.handle_line(&line);
        let encoded = serde_json::to_string(&response)?;
        if tx.send(encoded).await.is_err() {
            warn!("output closed, dropping connection");
            break;
        }
        if let Some(stream) = stream {
            watches.spawn(forward(stream, tx.clone()));
        }
    }

    info!(watches = watches.len(), "input closed");
    watches.shutdown().await;
    drop(handler);
    drop(tx);
    writer.await??;
    Ok(())
}

async fn write_lines<W>(mut output: W, mut rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

/// Relay a watch stream until it ends, then send a closing message.
async fn forward(mut stream: WatchStream, tx: mpsc::Sender<String>) {
    let watch = stream.id();
    let session_id = stream.session().clone();

    while let Some(event) = stream.recv().await {
        let message = WatchMessage {
            watch,
            session_id: session_id.clone(),
            event: Some(event),
            closed: false,
        };
        if !send(&tx, &message).await {
            return;
        }
    }

    debug!(subscription = %watch, session = %session_id, "watch ended");
    let closing = WatchMessage {
        watch,
        session_id,
        event: None,
        closed: true,
    };
    send(&tx, &closing).await;
}

async fn send(tx: &mpsc::Sender<String>, message: &WatchMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(line) => tx.send(line).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode watch event");
            true
        }
    }
}
