//! Listener setup, background tasks and graceful shutdown.
//!
//! Two routers: the device listener, whose fallback upgrades every path to a
//! WebSocket, and the optional dashboard API behind bearer auth.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{self, ApiKey};
use crate::config::Config;
use crate::error::ServerError;
use crate::journal::MessageJournal;
use crate::routes;
use crate::sessions::SessionManager;
use crate::state::AppState;
use crate::ws;

const IDENTITY_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub fn device_router(state: AppState) -> Router {
    Router::new()
        .fallback(ws::device_upgrade)
        .with_state(state)
}

pub fn dashboard_router(state: AppState, api_key: &str) -> Router {
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route(
            "/api/sessions/{id}",
            get(routes::sessions::get_session).delete(routes::sessions::close_session),
        )
        .route("/api/sessions/{id}/frames", get(routes::sessions::get_frames))
        .route("/api/sessions/{id}/commands", post(routes::sessions::post_command))
        .route("/api/identity/{id}", delete(routes::sessions::forget_identity))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(api_key.to_string())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Bound listeners plus everything they serve.
pub struct Server {
    state: AppState,
    device: TcpListener,
    dashboard: Option<TcpListener>,
    journal: Option<MessageJournal>,
}

impl Server {
    /// Open the message log and bind both listeners.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let journal = match &config.logging.message_log {
            Some(path) => Some(
                MessageJournal::open(Path::new(path), config.logging.message_log_capacity)
                    .await
                    .map_err(ServerError::Journal)?,
            ),
            None => None,
        };

        let device = bind(&config.proxy.listen).await?;
        let dashboard = match &config.dashboard {
            Some(dash) => {
                if dash.api_key == "change-me" {
                    warn!("Using default dashboard API key; set OCPP_BRIDGE_API_KEY or update config");
                }
                Some(bind(&dash.listen).await?)
            }
            None => None,
        };

        let sessions = SessionManager::new(&config, journal.as_ref().map(MessageJournal::sender));
        Ok(Self {
            state: AppState::new(config, sessions),
            device,
            dashboard,
            journal,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn device_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.device.local_addr()?)
    }

    pub fn dashboard_addr(&self) -> Option<SocketAddr> {
        self.dashboard.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until `shutdown` resolves or a fatal error is raised, then close
    /// every session and flush the message log.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), ServerError> {
        let Self {
            state,
            device,
            dashboard,
            journal,
        } = self;
        let stop = CancellationToken::new();

        info!(
            listen = %device.local_addr()?,
            backend = %state.config.proxy.backend_url("/"),
            "device listener ready"
        );
        let device_task = tokio::spawn(
            axum::serve(device, device_router(state.clone()))
                .with_graceful_shutdown(stop.clone().cancelled_owned())
                .into_future(),
        );

        let dashboard_task = dashboard.map(|listener| {
            if let Ok(addr) = listener.local_addr() {
                info!(listen = %addr, "dashboard API ready");
            }
            let api_key = state
                .config
                .dashboard
                .as_ref()
                .map(|d| d.api_key.clone())
                .unwrap_or_default();
            tokio::spawn(
                axum::serve(listener, dashboard_router(state.clone(), &api_key))
                    .with_graceful_shutdown(stop.clone().cancelled_owned())
                    .into_future(),
            )
        });

        // Expired identity entries are dropped on read; this keeps idle ones
        // from accumulating.
        let identity = state.sessions.identity().clone();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDENTITY_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = identity.sweep().await;
                if removed > 0 {
                    info!(removed, "expired identity entries dropped");
                }
            }
        });

        let mut fatal = state.sessions.fatal();
        let fatal_reason = tokio::select! {
            () = shutdown => None,
            reason = fatal.wait_for(Option::is_some) => {
                reason.ok().and_then(|r| r.clone())
            }
        };
        if let Some(reason) = &fatal_reason {
            error!(reason = %reason, "fatal error, shutting down");
        }

        info!("Shutting down...");
        stop.cancel();
        sweep_task.abort();
        state.sessions.close_all().await;

        for task in std::iter::once(device_task).chain(dashboard_task) {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("listener error: {e}"),
                Ok(Err(e)) => error!("listener task failed: {e}"),
                Err(_) => warn!("listener did not stop in time"),
            }
        }

        if let Some(journal) = journal {
            if !journal.is_alive() {
                warn!("message log writer stopped early; some records were not written");
            }
            journal.close().await;
        }
        info!("Goodbye");

        match fatal_reason {
            Some(reason) => Err(ServerError::Fatal(reason)),
            None => Ok(()),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DashboardConfig;
    use crate::error::CommandError;
    use crate::ocpp::{Action, Frame};
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type BackendSocket = WebSocketStream<TcpStream>;
    type DeviceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Accepts backend connections, echoing the offered subprotocol, and
    /// hands each socket to the test with the path it was opened on.
    async fn fake_backend() -> (u16, mpsc::Receiver<(String, BackendSocket)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::new(Mutex::new(String::new()));
                let seen_cb = Arc::clone(&seen);
                let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                    *seen_cb.lock().unwrap() = req.uri().path().to_string();
                    if let Some(proto) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                        resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, proto.clone());
                    }
                    Ok(resp)
                };
                let socket = tokio_tungstenite::accept_hdr_async(stream, callback)
                    .await
                    .unwrap();
                let path = seen.lock().unwrap().clone();
                if tx.send((path, socket)).await.is_err() {
                    break;
                }
            }
        });
        (port, rx)
    }

    struct Harness {
        device_addr: SocketAddr,
        dashboard_addr: Option<SocketAddr>,
        sessions: SessionManager,
        backends: mpsc::Receiver<(String, BackendSocket)>,
        stop: Option<oneshot::Sender<()>>,
        server: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    async fn start(toml: &str) -> Harness {
        let (port, backends) = fake_backend().await;
        let mut config = Config::from_toml(toml).unwrap();
        config.proxy.listen = "127.0.0.1:0".into();
        config.proxy.backend_host = "127.0.0.1".into();
        config.proxy.backend_port = port;
        config.proxy.connect_timeout_ms = 2000;
        config.dashboard = Some(DashboardConfig {
            listen: "127.0.0.1:0".into(),
            api_key: "secret".into(),
        });

        let server = Server::bind(config).await.unwrap();
        let device_addr = server.device_addr().unwrap();
        let dashboard_addr = server.dashboard_addr();
        let sessions = server.state().sessions.clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));
        Harness {
            device_addr,
            dashboard_addr,
            sessions,
            backends,
            stop: Some(stop_tx),
            server,
        }
    }

    impl Harness {
        async fn connect_device(&mut self, path: &str) -> (DeviceSocket, String, BackendSocket) {
            let mut request = format!("ws://{}{path}", self.device_addr)
                .into_client_request()
                .unwrap();
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp1.6"));
            let (device, response) = tokio_tungstenite::connect_async(request).await.unwrap();
            assert_eq!(
                response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap().to_str().unwrap(),
                "ocpp1.6"
            );
            let (backend_path, backend) = tokio::time::timeout(Duration::from_secs(2), self.backends.recv())
                .await
                .unwrap()
                .unwrap();
            (device, backend_path, backend)
        }

        async fn shutdown(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            let result = tokio::time::timeout(Duration::from_secs(10), self.server)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_ok(), "server exited with {result:?}");
        }
    }

    async fn next_text<S>(socket: &mut S) -> String
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("socket error");
            match msg {
                Message::Text(text) => return text.as_str().to_owned(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text, got {other:?}"),
            }
        }
    }

    async fn wait_until_gone(sessions: &SessionManager, id: &str) {
        for _ in 0..200 {
            if !sessions.contains(id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} still registered");
    }

    #[tokio::test]
    async fn double_slash_path_is_normalized_and_frames_relay_unchanged() {
        let mut h = start("").await;
        let (mut device, backend_path, mut backend) = h.connect_device("//X").await;
        assert_eq!(backend_path, "/X");

        device.send(Message::Text(r#"[2,"1","Foo",{}]"#.into())).await.unwrap();
        assert_eq!(next_text(&mut backend).await, r#"[2,"1","Foo",{}]"#);

        backend.send(Message::Text(r#"[3,"1",{}]"#.into())).await.unwrap();
        assert_eq!(next_text(&mut device).await, r#"[3,"1",{}]"#);

        let sessions = h.sessions.list().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "X");
        assert_eq!(sessions[0].subprotocol.as_deref(), Some("ocpp1.6"));

        h.shutdown().await;
    }

    #[tokio::test]
    async fn set_limit_is_converted_and_standardized() {
        let mut h = start(
            r#"
            [[rules]]
            kind = "rate_unit_conversion"
            direction = "device_to_backend"
            actions = ["SetLimit"]
            factor = 100
            unit_field = "unit"

            [[rules]]
            kind = "schedule_standardize"
            direction = "device_to_backend"
            actions = ["SetLimit"]
            profile_id = 231
            unit_field = "unit"
            "#,
        )
        .await;
        let (mut device, _, mut backend) = h.connect_device("/CP1").await;

        device
            .send(Message::Text(r#"[2,"7","SetLimit",{"unit":"A","limit":6}]"#.into()))
            .await
            .unwrap();
        let seen = Frame::decode(&next_text(&mut backend).await).unwrap();
        assert_eq!(seen.id().to_string(), "7");
        let profile = &seen.payload().unwrap()["csChargingProfiles"];
        assert_eq!(profile["chargingProfileId"], 231);
        let schedule = &profile["chargingSchedule"];
        assert_eq!(schedule["chargingRateUnit"], "W");
        assert_eq!(schedule["chargingSchedulePeriod"][0]["limit"], 600);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn backend_error_closes_device_and_rejects_commands() {
        let mut h = start("").await;
        let (mut device, _, backend) = h.connect_device("/CP1").await;

        // Drop without a closing handshake.
        drop(backend);

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match device.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, Some(1011));

        wait_until_gone(&h.sessions, "CP1").await;
        let err = h
            .sessions
            .send_command("CP1", Frame::call("c1", Action::Reset, json!({"type": "Soft"})))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::SessionNotFound("CP1".into()));

        h.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_backend_closes_device_with_internal_error() {
        let mut config = Config::from_toml("").unwrap();
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);
        config.proxy.listen = "127.0.0.1:0".into();
        config.proxy.backend_host = "127.0.0.1".into();
        config.proxy.backend_port = port;
        config.dashboard = None;

        let server = Server::bind(config).await.unwrap();
        let addr = server.device_addr().unwrap();
        let sessions = server.state().sessions.clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));

        let (mut device, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/CP1"))
            .await
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match device.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(code, Some(1011));
        assert!(sessions.list().await.is_empty());

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();
    }

    async fn http(addr: SocketAddr, method: &str, path: &str, token: Option<&str>, body: Option<&Value>) -> (u16, Value) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let body = body.map(Value::to_string).unwrap_or_default();
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
        if let Some(token) = token {
            request.push_str(&format!("Authorization: Bearer {token}\r\n"));
        }
        if !body.is_empty() {
            request.push_str("Content-Type: application/json\r\n");
        }
        request.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        let status: u16 = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
        let payload = raw
            .split_once("\r\n\r\n")
            .map(|(_, b)| b)
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(Value::Null);
        (status, payload)
    }

    #[tokio::test]
    async fn dashboard_api_requires_bearer_key_and_delivers_commands() {
        let mut h = start("").await;
        let dash = h.dashboard_addr.unwrap();

        let (status, body) = http(dash, "GET", "/api/health", None, None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");

        assert_eq!(http(dash, "GET", "/api/sessions", None, None).await.0, 401);
        assert_eq!(http(dash, "GET", "/api/sessions", Some("wrong"), None).await.0, 403);

        let (mut device, _, mut backend) = h.connect_device("/CP7").await;
        device
            .send(Message::Text(
                r#"[2,"b","StatusNotification",{"connectorId":1,"status":"Charging","errorCode":"NoError"}]"#.into(),
            ))
            .await
            .unwrap();
        next_text(&mut backend).await;

        let (status, body) = http(dash, "GET", "/api/sessions", Some("secret"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["sessions"][0]["session_id"], "CP7");

        let (status, body) = http(dash, "GET", "/api/sessions/CP7", Some("secret"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["connectors"]["1"]["status"], "Charging");

        let (status, body) = http(dash, "GET", "/api/sessions/CP7/frames?since=0", Some("secret"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["frames"][0]["action"], "StatusNotification");

        let command = json!({"command": "reset", "kind": "Hard"});
        let (status, body) = http(dash, "POST", "/api/sessions/CP7/commands", Some("secret"), Some(&command)).await;
        assert_eq!(status, 202);
        let request_id = body["request_id"].as_str().unwrap().to_string();
        let delivered = Frame::decode(&next_text(&mut device).await).unwrap();
        assert_eq!(delivered.id().to_string(), request_id);
        assert_eq!(delivered.action(), Some(&Action::Reset));

        let (status, body) = http(dash, "POST", "/api/sessions/NOPE/commands", Some("secret"), Some(&command)).await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");

        h.shutdown().await;
    }

    #[tokio::test]
    async fn message_log_receives_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages.jsonl");
        let mut h = start(&format!(
            "[logging]\nmessage_log = {:?}\n",
            log.to_string_lossy()
        ))
        .await;
        let (mut device, _, mut backend) = h.connect_device("/CP1").await;
        device
            .send(Message::Text(r#"[2,"1","Heartbeat",{}]"#.into()))
            .await
            .unwrap();
        next_text(&mut backend).await;
        backend
            .send(Message::Text(r#"[3,"1",{"currentTime":"2025-01-01T00:00:00Z"}]"#.into()))
            .await
            .unwrap();
        next_text(&mut device).await;

        h.shutdown().await;

        let content = tokio::fs::read_to_string(&log).await.unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["direction"], "device_to_backend");
        assert_eq!(lines[1]["action"], "Heartbeat");
        assert_eq!(lines[1]["outcome"], "unmodified");
    }
}
