//! Device-facing WebSocket listener.
//!
//! Any path upgrades: the path names the charge point. The subprotocol is
//! chosen from the device's offer intersected with `supported_subprotocols`
//! and offered unchanged to the backend.

pub mod backend;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        OriginalUri, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sessions::relay::{Endpoint, Inbound, Outbound};
use crate::state::AppState;

/// Fallback handler on the device listener.
pub async fn device_upgrade(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    ws: WebSocketUpgrade,
) -> Response {
    let proxy = &state.config.proxy;
    let path = uri.path().to_string();
    ws.protocols(proxy.supported_subprotocols.clone())
        .max_message_size(proxy.max_message_size)
        .on_upgrade(move |socket| handle_device(socket, path, state))
}

async fn handle_device(socket: WebSocket, path: String, state: AppState) {
    let subprotocol = socket
        .protocol()
        .and_then(|p| p.to_str().ok())
        .map(String::from);
    debug!(path = %path, subprotocol = ?subprotocol, "device upgraded");

    let device = into_endpoint(socket, state.config.proxy.channel_capacity);
    if let Err(e) = state
        .sessions
        .on_device_connect(&path, device, subprotocol)
        .await
    {
        warn!(path = %path, error = %e, "device rejected");
    }
}

/// Split an axum socket into an inbound stream and a writer task fed by an
/// mpsc channel.
fn into_endpoint(socket: WebSocket, capacity: usize) -> Endpoint {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(capacity.max(1));
    let writer = CancellationToken::new();
    let stop = writer.clone();

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                () = stop.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let (message, last) = match msg {
                Outbound::Text(text) => (Message::Text(text.into()), false),
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    (Message::Close(Some(frame)), true)
                }
            };
            tokio::select! {
                () = stop.cancelled() => return,
                sent = sink.send(message) => {
                    if sent.is_err() || last {
                        break;
                    }
                }
            }
        }
        tokio::select! {
            () = stop.cancelled() => {}
            _ = sink.close() => {}
        }
    });

    let inbound = stream
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
                Ok(Message::Close(_)) => Some(Inbound::Closed),
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "ignoring binary frame from device");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Inbound::Error(e.to_string())),
            }
        })
        .boxed();

    Endpoint {
        inbound,
        outbound: tx,
        writer,
    }
}
