//! Session lifecycle.
//!
//! [`SessionManager`] is the single authority for creating, finding and
//! tearing down device sessions. A session pairs one device socket with one
//! backend socket and runs the two relay loops in [`relay`].
//!
//! ## Identifier collisions
//!
//! A device reconnecting under an id that is still registered evicts the old
//! session: the old handle is cancelled and replaced under one write lock, so
//! there is never a window with two live sessions for one id. The old
//! session's teardown sees a different instance token in the registry and
//! leaves the new entry (and its status snapshot) alone.
//!
//! ## Concurrency
//!
//! The registry is an `Arc<RwLock<HashMap>>`. Lookups (commands, frame reads)
//! take the read lock; registration and teardown take the write lock.

pub mod buffer;
pub mod identity;
pub mod relay;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CommandError, ConnectError};
use crate::ocpp::Frame;
use crate::pipeline::Pipeline;
use crate::status::StatusExtractor;
use crate::util::{normalize_path, now_ms, session_id_from_path};
use crate::workaround::Engine;
use buffer::{FrameBuffer, FrameRecord};
use identity::IdentityStore;
use relay::{close_code, Endpoint, Outbound, RelayContext, Shared};
use session::SessionState;

/// Registry entry for a live session.
pub struct SessionHandle {
    pub id: String,
    /// Distinguishes this connection from earlier ones with the same id.
    pub instance: Uuid,
    pub created_at: u64,
    pub subprotocol: Option<String>,
    cancel: CancellationToken,
    commands: mpsc::Sender<Frame>,
    buffer: Arc<Mutex<FrameBuffer>>,
}

/// Summary returned by [`SessionManager::list`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: u64,
    pub subprotocol: Option<String>,
}

/// Frames read from a session's ring buffer.
#[derive(Debug, Serialize)]
pub struct FramePage {
    pub frames: Vec<FrameRecord>,
    /// Records evicted before they could be read.
    pub dropped: u64,
    /// Pass as `since` to continue.
    pub next: u64,
    /// Records the message log never received.
    pub journal_dropped: u64,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    ctx: Arc<RelayContext>,
    fatal: Arc<watch::Sender<Option<String>>>,
    tasks: TaskTracker,
}

impl SessionManager {
    /// Build the shared relay context from configuration.
    pub fn new(config: &Config, journal: Option<mpsc::Sender<FrameRecord>>) -> Self {
        let ctx = RelayContext {
            proxy: config.proxy.clone(),
            pipeline: Pipeline::from_config(&config.rules),
            engine: Engine::new(&config.workarounds, config.identity.cache_actions.clone()),
            status: StatusExtractor::new(),
            identity: IdentityStore::new(Duration::from_secs(config.identity.ttl_secs)),
            journal,
        };
        Self::with_context(Arc::new(ctx))
    }

    pub fn with_context(ctx: Arc<RelayContext>) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ctx,
            fatal: Arc::new(fatal),
            tasks: TaskTracker::new(),
        }
    }

    pub fn status(&self) -> &StatusExtractor {
        &self.ctx.status
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.ctx.identity
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.ctx.pipeline
    }

    /// Fires with a reason when the process can no longer accept devices.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    /// Pair a freshly upgraded device socket with a backend connection.
    ///
    /// On failure the device socket is closed with a diagnostic and no session
    /// is created.
    pub async fn on_device_connect(
        &self,
        path: &str,
        device: Endpoint,
        subprotocol: Option<String>,
    ) -> Result<String, ConnectError> {
        let normalized = normalize_path(path);
        let Some(id) = session_id_from_path(&normalized) else {
            warn!(path, "connection without a charge point id");
            let _ = device
                .outbound
                .send(Outbound::Close {
                    code: close_code::POLICY,
                    reason: "path must name a charge point".into(),
                })
                .await;
            return Err(ConnectError::InvalidPath(path.to_string()));
        };

        let proxy = &self.ctx.proxy;
        let url = proxy.backend_url(&normalized);
        let offered = subprotocol
            .clone()
            .unwrap_or_else(|| proxy.default_subprotocol.clone());
        let backend = match crate::ws::backend::connect(
            &url,
            &offered,
            proxy.connect_timeout_ms,
            proxy.channel_capacity,
        )
        .await
        {
            Ok(backend) => backend,
            Err(e) => {
                warn!(session = %id, url = %url, error = %e, "backend connection failed");
                let _ = device
                    .outbound
                    .send(Outbound::Close {
                        code: close_code::INTERNAL_ERROR,
                        reason: truncate_reason(&e.to_string()),
                    })
                    .await;
                if e.is_fatal() {
                    self.fatal.send_replace(Some(e.to_string()));
                }
                return Err(e);
            }
        };

        self.start_session(id, device, backend, subprotocol).await;
        Ok(id.to_string())
    }

    /// Register a session over two connected endpoints and spawn its loops.
    pub async fn start_session(
        &self,
        id: &str,
        device: Endpoint,
        backend: Endpoint,
        subprotocol: Option<String>,
    ) {
        let cache = self.ctx.identity.load(id).await;
        let state = SessionState::new(id, cache)
            .with_in_flight_ttl(Duration::from_secs(self.ctx.proxy.in_flight_ttl_secs));
        let shared = Arc::new(Shared::new(
            id,
            state,
            (device.outbound, device.writer),
            (backend.outbound, backend.writer),
            Arc::clone(&self.ctx),
        ));
        let (commands_tx, commands_rx) = mpsc::channel(self.ctx.proxy.channel_capacity.max(1));

        let handle = SessionHandle {
            id: id.to_string(),
            instance: shared.instance,
            created_at: now_ms(),
            subprotocol: subprotocol.clone(),
            cancel: shared.cancel.clone(),
            commands: commands_tx,
            buffer: Arc::clone(&shared.buffer),
        };

        {
            let mut sessions = self.sessions.write().await;
            if let Some(old) = sessions.insert(id.to_string(), handle) {
                info!(session = %id, old = %old.instance, "charge point reconnected, evicting previous session");
                old.cancel.cancel();
            }
            self.ctx.status.begin(id).await;
        }

        info!(session = %id, subprotocol = ?subprotocol, "session started");
        let span = info_span!("session", id = %id);
        self.tasks.spawn(
            relay::run_session(
                shared,
                device.inbound,
                backend.inbound,
                commands_rx,
                Arc::clone(&self.sessions),
            )
            .instrument(span),
        );
    }

    /// Queue a Call for the device as if the backend had sent it.
    pub async fn send_command(&self, id: &str, frame: Frame) -> Result<(), CommandError> {
        if !frame.is_call() {
            return Err(CommandError::NotACall);
        }
        let commands = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(handle) if !handle.cancel.is_cancelled() => handle.commands.clone(),
                _ => return Err(CommandError::SessionNotFound(id.to_string())),
            }
        };
        commands
            .send(frame)
            .await
            .map_err(|_| CommandError::SessionNotFound(id.to_string()))
    }

    /// Stop a session. Returns `false` if it was not registered.
    pub async fn close(&self, id: &str) -> bool {
        match self.sessions.read().await.get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every session and wait for their teardown.
    pub async fn close_all(&self) {
        let count = {
            let sessions = self.sessions.read().await;
            for handle in sessions.values() {
                handle.cancel.cancel();
            }
            sessions.len()
        };
        if count > 0 {
            info!(count, "closing sessions");
        }
        self.tasks.close();
        if tokio::time::timeout(Duration::from_secs(5), self.tasks.wait())
            .await
            .is_err()
        {
            warn!("sessions did not finish closing in time");
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .map(|h| SessionSummary {
                session_id: h.id.clone(),
                created_at: h.created_at,
                subprotocol: h.subprotocol.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    /// Ring-buffer records after `since`. With `wait`, an empty read blocks
    /// until a record arrives or the wait elapses.
    pub async fn frames(&self, id: &str, since: u64, wait: Option<Duration>) -> Option<FramePage> {
        let buffer = {
            let sessions = self.sessions.read().await;
            Arc::clone(&sessions.get(id)?.buffer)
        };
        if let Some(wait) = wait {
            let notify = {
                let buf = buffer.lock().await;
                (!buf.has_entries_since(since)).then(|| buf.notifier())
            };
            if let Some(notify) = notify {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !buffer.lock().await.has_entries_since(since) {
                    let _ = tokio::time::timeout(wait, notified).await;
                }
            }
        }
        let buffer = buffer.lock().await;
        let (frames, dropped) = buffer.read_since(since);
        let next = frames.last().map_or(since, |r| r.seq);
        Some(FramePage {
            frames,
            dropped,
            next,
            journal_dropped: buffer.journal_dropped(),
        })
    }
}

/// Close reasons must fit a control frame (123 bytes).
fn truncate_reason(reason: &str) -> String {
    let mut end = reason.len().min(120);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
