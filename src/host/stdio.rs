//! Stdin/stdout JSON bridge for a single locally spawned client.
//!
//! Reads newline-delimited inbound messages from stdin, runs each through
//! the pipeline, and writes outbound messages as newline-delimited JSON to
//! stdout.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

use crate::error::{PetError, Result};
use crate::host::connection::AgentServer;

/// Run the bridge over the process's stdin and stdout until stdin closes.
pub async fn run_stdio_bridge(server: Arc<AgentServer>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_bridge(server, stdin, stdout).await
}

/// Run the bridge over arbitrary line-oriented streams.
///
/// Two tasks operate concurrently:
///
/// 1. **Reader** -- reads newline-delimited JSON from `input` and starts a
///    pipeline execution for each message.
/// 2. **Writer** -- drains the connection's outbound queue to `output`.
///
/// When `input` reaches EOF the connection is detached; the writer keeps
/// going until every in-flight execution has delivered its replies.
pub async fn run_bridge<R, W>(server: Arc<AgentServer>, input: R, output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (handle, mut outbound_rx) = server.open_connection(None).await?;
    let writer = Arc::new(Mutex::new(BufWriter::new(output)));

    let out_writer = Arc::clone(&writer);
    let writer_handle = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message.to_json() {
                Ok(json) => {
                    let mut w = out_writer.lock().await;
                    if let Err(e) = write_line(&mut w, &json).await {
                        tracing::warn!(
                            error = %e,
                            "failed to write outbound message; stopping writer"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize outbound message; skipping");
                }
            }
        }
    });

    let mut reader = input;
    let mut line = String::new();
    let result = loop {
        line.clear();
        let bytes_read = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => break Err(PetError::Channel(format!("failed to read from stdin: {e}"))),
        };

        // EOF
        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down stdio bridge");
            break Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Execution runs detached; replies reach the writer through the outbound queue.
        let _ = handle.handle_text(trimmed);
    };

    // Detach and release this task's sender; the writer finishes once the
    // last in-flight execution drops its clone.
    drop(handle);
    if let Err(e) = writer_handle.await {
        tracing::warn!(error = %e, "stdio writer task ended abnormally");
    }
    result
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| PetError::Channel(format!("failed to write to stdout: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| PetError::Channel(format!("failed to write newline to stdout: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| PetError::Channel(format!("failed to flush stdout: {e}")))?;
    Ok(())
}
