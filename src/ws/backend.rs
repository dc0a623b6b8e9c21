//! Backend-facing connector: one tokio-tungstenite client per device.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use crate::error::ConnectError;
use crate::sessions::relay::{Endpoint, Inbound, Outbound};

/// Whether an I/O error means the process ran out of descriptors.
pub fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::EMFILE || code == libc::ENFILE)
}

fn map_error(e: WsError) -> ConnectError {
    match e {
        WsError::Io(io) if is_descriptor_exhaustion(&io) => {
            ConnectError::ResourceExhausted(io.to_string())
        }
        other => ConnectError::BackendUnavailable(other.to_string()),
    }
}

/// Open `url`, offering `subprotocol`, and wrap the socket as an [`Endpoint`].
pub async fn connect(
    url: &str,
    subprotocol: &str,
    timeout_ms: u64,
    capacity: usize,
) -> Result<Endpoint, ConnectError> {
    let mut request = url.into_client_request().map_err(map_error)?;
    let protocol = HeaderValue::from_str(subprotocol)
        .map_err(|e| ConnectError::BackendUnavailable(format!("bad subprotocol: {e}")))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

    let (stream, response) = tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| ConnectError::Timeout(timeout_ms))?
    .map_err(map_error)?;
    info!(
        url,
        status = %response.status(),
        subprotocol = ?response.headers().get(SEC_WEBSOCKET_PROTOCOL),
        "backend connected"
    );

    let (mut sink, stream) = stream.split();
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
                        code: CloseCode::from(code),
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
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "backend sent close");
                    Some(Inbound::Closed)
                }
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "ignoring binary frame from backend");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Inbound::Error(e.to_string())),
            }
        })
        .boxed();

    Ok(Endpoint {
        inbound,
        outbound: tx,
        writer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_exhaustion_is_recognised() {
        assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_descriptor_exhaustion(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
    }

    #[tokio::test]
    async fn refused_connection_is_backend_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&format!("ws://{addr}/CP1"), "ocpp1.6", 2000, 8).await;
        assert!(matches!(result, Err(ConnectError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        // Accepts TCP but never answers the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = connect(&format!("ws://{addr}/CP1"), "ocpp1.6", 100, 8).await;
        assert!(matches!(result, Err(ConnectError::Timeout(100))));
    }
}
