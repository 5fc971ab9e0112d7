//! WebSocket transport.
//!
//! Clients connect to `/ws?session=<key>`; every text frame is one inbound
//! message and every outbound message is sent as one text frame. Omitting
//! `session` attaches to the configured default session.

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::host::connection::AgentServer;

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub session: Option<String>,
}

/// Router exposing the `/ws` endpoint.
pub fn router(server: Arc<AgentServer>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(server)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(server): State<Arc<AgentServer>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(server, socket, params.session))
}

async fn serve_socket(server: Arc<AgentServer>, socket: WebSocket, session: Option<String>) {
    let (handle, mut outbound_rx) = match server.open_connection(session.as_deref()).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "failed to open websocket connection");
            return;
        }
    };
    let connection = handle.connection();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound message; skipping");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                debug!(error = %e, "websocket send failed; stopping writer");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let _ = handle.handle_text(text.as_str());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%connection, error = %e, "websocket receive failed");
                break;
            }
        }
    }

    drop(handle);
    // The peer is gone; replies still in flight have nowhere to go.
    writer.abort();
    debug!(%connection, "websocket closed");
}

/// Bind `bind_addr` and serve until the listener fails.
pub async fn serve(server: Arc<AgentServer>, bind_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve_with_listener(server, listener).await
}

/// Serve on an already-bound listener.
pub async fn serve_with_listener(server: Arc<AgentServer>, listener: TcpListener) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "websocket server listening");
    axum::serve(listener, router(server)).await?;
    Ok(())
}
