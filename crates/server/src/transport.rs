use crate::commands::handle_command;
use crate::state::{AppState, ServerError};
use crate::util::generate_id;
use flock_proto as proto;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Accept loop. Each connection runs in its own task until the socket closes.
pub async fn serve(state: Arc<AppState>) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&state.config.bind)
        .await
        .map_err(|_| ServerError::Io)?;
    info!(address = %state.config.bind, "flock listening");
    loop {
        let (stream, peer) = listener.accept().await.map_err(|_| ServerError::Io)?;
        let state = state.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "connection accepted");
            handle_connection(state, stream).await;
        });
    }
}

/// Serves the Prometheus counters as a plain HTTP/1.1 response. One request
/// per connection, no routing.
pub async fn serve_metrics(state: Arc<AppState>, bind: String) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&bind).await.map_err(|_| ServerError::Io)?;
    info!(address = %bind, "metrics listening");
    loop {
        let (mut stream, _) = listener.accept().await.map_err(|_| ServerError::Io)?;
        let body = state.metrics.encode_prometheus();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        if let Err(err) = stream.write_all(response.as_bytes()).await {
            debug!(error = %err, "metrics write failed");
        }
    }
}

async fn handle_connection(state: Arc<AppState>, stream: TcpStream) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut writer, mut reader) = socket.split();
    let (tx, mut rx) = mpsc::channel::<serde_json::Value>(state.config.connection_buffer);
    let connection_id = generate_id("connection");
    state.registry.attach(&connection_id, tx.clone()).await;
    state.metrics.incr_connections();

    let writer_task = tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            if writer.send(Message::Text(value.to_string())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = reader.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "socket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let response = match proto::decode_command(text.as_bytes()) {
                    Ok(command) => handle_command(&state, &connection_id, command).await,
                    Err(err) => proto::fail(&err.to_string()),
                };
                if tx.send(response).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; binary frames carry
            // nothing in this protocol.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
        }
    }

    state.registry.unregister(&connection_id).await;
    state.metrics.decr_connections();
    drop(tx);
    let _ = writer_task.await;
    debug!(connection = %connection_id, "connection closed");
}
