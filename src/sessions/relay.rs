//! The two relay loops of a session and their shared teardown.
//!
//! A session owns two [`Endpoint`]s. Each endpoint is an inbound event stream
//! plus an outbound channel drained by a writer task that owns the socket
//! sink, so the relay itself never touches a WebSocket type and can be driven
//! from plain channels in tests.
//!
//! Per frame, the loop:
//!
//! 1. decodes the text (undecodable text is forwarded raw),
//! 2. locks the session state and runs pipeline and engine synchronously,
//!    producing a [`Plan`],
//! 3. releases the lock and executes the plan: socket sends, frame records,
//!    status observations, identity write-back, injections.
//!
//! When either loop ends, the supervisor cancels the other, closes both
//! sockets, clears in-flight state and deregisters the session exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::buffer::{FrameBuffer, FrameRecord, Outcome};
use super::session::{InFlight, RequestOrigin, SessionState};
use super::SessionHandle;
use crate::config::ProxyConfig;
use crate::error::RelayError;
use crate::ocpp::{Action, Direction, Frame, Side};
use crate::pipeline::{Pipeline, PipelineResult, RuleContext};
use crate::sessions::identity::IdentityStore;
use crate::status::StatusExtractor;
use crate::workaround::{Engine, Injection, ResponseDecision};

/// Something read from a socket.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Closed,
    Error(String),
}

/// Something to write to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame and stop the writer.
    Close { code: u16, reason: String },
}

/// One side of a session.
pub struct Endpoint {
    pub inbound: BoxStream<'static, Inbound>,
    pub outbound: mpsc::Sender<Outbound>,
    /// Stops the writer task, dropping the socket sink without waiting for
    /// queued frames.
    pub writer: CancellationToken,
}

/// How long a queued close frame may wait behind a stalled socket before its
/// writer is stopped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Everything sessions share: configuration, rules, workarounds and the
/// process-wide stores.
pub struct RelayContext {
    pub proxy: ProxyConfig,
    pub pipeline: Pipeline,
    pub engine: Engine,
    pub status: StatusExtractor,
    pub identity: IdentityStore,
    pub journal: Option<mpsc::Sender<FrameRecord>>,
}

/// Side effects of one frame, executed after the state lock is released.
#[derive(Default)]
struct Plan {
    sends: Vec<(Side, String)>,
    records: Vec<FrameRecord>,
    observations: Vec<(Direction, Frame, Option<Action>)>,
    injections: Vec<Injection>,
    cache_update: Option<(Action, Value)>,
}

/// Per-session data shared by both loops, injection tasks and the supervisor.
pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) instance: Uuid,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) buffer: Arc<Mutex<FrameBuffer>>,
    device_tx: mpsc::Sender<Outbound>,
    backend_tx: mpsc::Sender<Outbound>,
    device_writer: CancellationToken,
    backend_writer: CancellationToken,
    pub(crate) cancel: CancellationToken,
    ctx: Arc<RelayContext>,
}

impl Shared {
    pub(crate) fn new(
        id: &str,
        state: SessionState,
        device: (mpsc::Sender<Outbound>, CancellationToken),
        backend: (mpsc::Sender<Outbound>, CancellationToken),
        ctx: Arc<RelayContext>,
    ) -> Self {
        let mut buffer = FrameBuffer::new(ctx.proxy.frame_buffer_size);
        if let Some(tx) = &ctx.journal {
            buffer.set_journal(tx.clone());
        }
        Self {
            id: id.to_string(),
            instance: Uuid::new_v4(),
            state: Mutex::new(state),
            buffer: Arc::new(Mutex::new(buffer)),
            device_tx: device.0,
            backend_tx: backend.0,
            device_writer: device.1,
            backend_writer: backend.1,
            cancel: CancellationToken::new(),
            ctx,
        }
    }

    fn sender(&self, side: Side) -> &mpsc::Sender<Outbound> {
        match side {
            Side::Device => &self.device_tx,
            Side::Backend => &self.backend_tx,
        }
    }

    fn writer(&self, side: Side) -> &CancellationToken {
        match side {
            Side::Device => &self.device_writer,
            Side::Backend => &self.backend_writer,
        }
    }

    /// Queue `text` for `side`. Gives up when the session is cancelled, so a
    /// peer that stopped reading cannot hold the other loop.
    async fn send(&self, side: Side, text: String) -> Result<(), RelayError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(RelayError::Cancelled),
            sent = self.sender(side).send(Outbound::Text(text)) => sent.map_err(|_| match side {
                Side::Device => RelayError::DeviceDisconnect,
                Side::Backend => RelayError::BackendUnavailable("writer stopped".into()),
            }),
        }
    }

    /// Queue a close frame without waiting. The writer is stopped at once if
    /// its queue is full, otherwise after [`CLOSE_GRACE`].
    fn close_side(&self, side: Side, code: u16, reason: String) {
        let writer = self.writer(side).clone();
        if let Err(e) = self.sender(side).try_send(Outbound::Close { code, reason }) {
            debug!(session = %self.id, side = side.as_str(), "close frame not queued ({e}), dropping socket");
            writer.cancel();
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            writer.cancel();
        });
    }

    fn record(&self, direction: Direction, outcome: Outcome) -> FrameRecord {
        FrameRecord::new(&self.id, direction, outcome)
    }

    /// Pipeline and engine for one decoded frame. Runs under the state lock.
    fn step(&self, state: &mut SessionState, direction: Direction, text: &str, frame: Frame) -> Plan {
        let ctx = &self.ctx;
        let now = Utc::now();
        let mut plan = Plan::default();
        state.reset_decode_failures(direction);

        let request_action = if frame.is_call() {
            None
        } else {
            state
                .pending_request(direction, frame.id())
                .map(|r| r.action.clone())
        };
        let action = frame.action().cloned().or_else(|| request_action.clone());
        let rule_ctx = RuleContext {
            direction,
            request_action: request_action.as_ref(),
            now,
        };

        let (frame, fired) = match ctx.pipeline.apply(frame, &rule_ctx) {
            PipelineResult::Blocked {
                rule,
                reply,
                mut fired,
            } => {
                info!(session = %self.id, %direction, rule = %rule, action = ?action, "frame blocked");
                fired.push(rule.clone());
                plan.records.push(
                    self.record(direction, Outcome::Blocked)
                        .action(action.clone())
                        .raw(text)
                        .rules(fired),
                );
                if let Some(reply) = reply {
                    let encoded = reply.encode();
                    plan.sends.push((direction.source(), encoded.clone()));
                    plan.records.push(
                        self.record(direction.reverse(), Outcome::Synthesized)
                            .action(action.clone())
                            .transformed(encoded)
                            .rules(vec![rule]),
                    );
                    plan.observations.push((direction.reverse(), reply, action));
                }
                return plan;
            }
            PipelineResult::Passed { frame, fired } => (frame, fired),
        };

        match frame {
            Frame::Call(call) => {
                let decision = ctx.engine.on_call(direction, &call, state, now);
                plan.cache_update = decision.cache_update;
                plan.injections = decision.injections;

                if let Some(reply) = decision.reply {
                    let encoded = reply.encode();
                    plan.sends.push((direction.source(), encoded.clone()));
                    plan.records.push(
                        self.record(direction.reverse(), Outcome::Synthesized)
                            .action(action.clone())
                            .transformed(encoded)
                            .rules(decision.fired.clone()),
                    );
                    plan.observations
                        .push((direction.reverse(), reply, action.clone()));
                }

                let mut rules = fired.clone();
                rules.extend(decision.fired);
                if !decision.forward {
                    plan.records.push(
                        self.record(direction, Outcome::Intercepted)
                            .action(action)
                            .raw(text)
                            .rules(rules),
                    );
                    return plan;
                }

                let mut entry = InFlight::new(call.action.clone(), RequestOrigin::Peer);
                if let Some(by) = decision.absorbed_by {
                    entry = entry.absorbed_by(by);
                }
                state.track_request(direction, call.id.clone(), entry);

                let frame = Frame::Call(call);
                self.forward(&mut plan, direction, text, frame, fired.is_empty(), rules, action);
            }
            response => match ctx.engine.on_response(direction, response, state) {
                ResponseDecision::Absorb { frame, by, origin } => {
                    debug!(session = %self.id, %direction, by = %by, ?origin, "reply absorbed");
                    let mut rules = fired;
                    rules.push(by);
                    plan.records.push(
                        self.record(direction, Outcome::Absorbed)
                            .action(action.clone())
                            .raw(text)
                            .rules(rules),
                    );
                    plan.observations.push((direction, frame, action));
                }
                ResponseDecision::Forward {
                    frame,
                    fired: overrides,
                } => {
                    let untouched = fired.is_empty() && overrides.is_empty();
                    let mut rules = fired;
                    rules.extend(overrides);
                    self.forward(&mut plan, direction, text, frame, untouched, rules, action);
                }
            },
        }
        plan
    }

    /// Queue `frame` for its destination: the original text when nothing
    /// changed it, the re-encoded frame otherwise.
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        plan: &mut Plan,
        direction: Direction,
        text: &str,
        frame: Frame,
        untouched: bool,
        rules: Vec<String>,
        action: Option<Action>,
    ) {
        let record = self
            .record(
                direction,
                if untouched {
                    Outcome::Unmodified
                } else {
                    Outcome::Rewritten
                },
            )
            .action(action.clone())
            .raw(text)
            .rules(rules);
        if untouched {
            plan.sends.push((direction.destination(), text.to_string()));
            plan.records.push(record);
        } else {
            let encoded = frame.encode();
            plan.sends.push((direction.destination(), encoded.clone()));
            plan.records.push(record.transformed(encoded));
        }
        plan.observations.push((direction, frame, action));
    }

    async fn execute(self: &Arc<Self>, plan: Plan) -> Result<(), RelayError> {
        for (side, text) in plan.sends {
            self.send(side, text).await?;
        }
        self.push_records(plan.records).await;
        for (direction, frame, action) in &plan.observations {
            self.ctx
                .status
                .observe(&self.id, *direction, frame, action.as_ref())
                .await;
        }
        if let Some((action, payload)) = plan.cache_update {
            self.ctx.identity.store(&self.id, action, payload).await;
        }
        for injection in plan.injections {
            self.schedule(injection);
        }
        Ok(())
    }

    async fn push_records(&self, records: Vec<FrameRecord>) {
        if records.is_empty() {
            return;
        }
        let mut buffer = self.buffer.lock().await;
        for record in records {
            buffer.push(record);
        }
    }

    /// Handle one text message read from `direction.source()`.
    async fn handle_text(self: &Arc<Self>, direction: Direction, text: String) -> Result<(), RelayError> {
        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let failures = self.state.lock().await.note_decode_failure(direction);
                warn!(session = %self.id, %direction, error = %e, failures, "undecodable frame, forwarding raw");
                self.send(direction.destination(), text.clone()).await?;
                self.push_records(vec![self.record(direction, Outcome::Passthrough).raw(text)])
                    .await;
                let limit = self.ctx.proxy.max_decode_failures;
                if limit > 0 && failures > limit {
                    return Err(RelayError::DecodeLoop(failures));
                }
                return Ok(());
            }
        };

        let plan = {
            let mut state = self.state.lock().await;
            self.step(&mut state, direction, &text, frame)
        };
        self.execute(plan).await
    }

    /// Deliver a dashboard command to the device as if the backend sent it.
    async fn handle_command(self: &Arc<Self>, frame: Frame) -> Result<(), RelayError> {
        let Frame::Call(mut call) = frame else {
            return Ok(());
        };
        let direction = Direction::BackendToDevice;
        let plan = {
            let mut state = self.state.lock().await;
            if state.is_in_flight(direction, &call.id) || state.was_issued(&call.id) {
                let fresh = self.ctx.engine.mint_id(&mut state);
                debug!(session = %self.id, from = %call.id, to = %fresh, "command id in use, reissued");
                call.id = fresh;
            }
            let action = Some(call.action.clone());
            let rule_ctx = RuleContext {
                direction,
                request_action: None,
                now: Utc::now(),
            };
            let mut plan = Plan::default();
            match self.ctx.pipeline.apply(Frame::Call(call), &rule_ctx) {
                PipelineResult::Blocked {
                    rule, mut fired, ..
                } => {
                    info!(session = %self.id, rule = %rule, "command blocked");
                    fired.push(rule);
                    plan.records.push(
                        self.record(direction, Outcome::Blocked)
                            .action(action)
                            .rules(fired),
                    );
                }
                PipelineResult::Passed { frame, fired } => {
                    if let Frame::Call(call) = &frame {
                        let mut entry = InFlight::new(call.action.clone(), RequestOrigin::Command);
                        entry.absorb_reply = true;
                        state.track_request(direction, call.id.clone(), entry);
                    }
                    let encoded = frame.encode();
                    plan.sends.push((Side::Device, encoded.clone()));
                    plan.records.push(
                        self.record(direction, Outcome::Synthesized)
                            .action(action.clone())
                            .transformed(encoded)
                            .rules(fired),
                    );
                    plan.observations.push((direction, frame, action));
                }
            }
            plan
        };
        self.execute(plan).await
    }

    /// Deliver an injected Call after its delay unless the session ends first.
    fn schedule(self: &Arc<Self>, injection: Injection) {
        let shared = Arc::clone(self);
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                tokio::select! {
                    () = shared.cancel.cancelled() => {
                        debug!(workaround = %injection.workaround, "injection cancelled with session");
                        return;
                    }
                    () = tokio::time::sleep(injection.delay) => {}
                }
                let direction = Direction::towards(injection.target);
                let encoded = injection.frame.encode();
                if let Err(e) = shared.send(injection.target, encoded.clone()).await {
                    debug!(workaround = %injection.workaround, error = %e, "injection not delivered");
                    return;
                }
                info!(
                    workaround = %injection.workaround,
                    target = injection.target.as_str(),
                    id = %injection.frame.id(),
                    "injected frame"
                );
                Engine::injection_delivered(&mut *shared.state.lock().await, &injection.workaround);
                let action = injection.frame.action().cloned();
                shared
                    .push_records(vec![shared
                        .record(direction, Outcome::Synthesized)
                        .action(action.clone())
                        .transformed(encoded)
                        .rules(vec![injection.workaround.clone()])])
                    .await;
                shared
                    .ctx
                    .status
                    .observe(&shared.id, direction, &injection.frame, action.as_ref())
                    .await;
            }
            .instrument(span),
        );
    }
}

/// Wait for the next dashboard command. Pends forever without a receiver.
async fn next_command(commands: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Relay frames read from `direction.source()` until something ends the session.
async fn relay_loop(
    shared: Arc<Shared>,
    direction: Direction,
    mut inbound: BoxStream<'static, Inbound>,
    mut commands: Option<mpsc::Receiver<Frame>>,
) -> RelayError {
    loop {
        let event = tokio::select! {
            () = shared.cancel.cancelled() => return RelayError::Cancelled,
            event = inbound.next() => event.unwrap_or(Inbound::Closed),
            command = next_command(&mut commands) => {
                match command {
                    Some(frame) => {
                        if let Err(e) = shared.handle_command(frame).await {
                            return e;
                        }
                    }
                    None => commands = None,
                }
                continue;
            }
        };
        let result = match event {
            Inbound::Text(text) => shared.handle_text(direction, text).await,
            Inbound::Closed => Err(match direction.source() {
                Side::Device => RelayError::DeviceDisconnect,
                Side::Backend => RelayError::BackendDisconnect,
            }),
            Inbound::Error(e) => Err(match direction.source() {
                Side::Device => RelayError::DeviceSocket(e),
                Side::Backend => RelayError::BackendUnavailable(e),
            }),
        };
        if let Err(e) = result {
            return e;
        }
    }
}

/// Close codes and reason for (device, backend) when a session ends.
fn close_frames(reason: &RelayError) -> ((u16, String), (u16, String)) {
    match reason {
        RelayError::DeviceDisconnect | RelayError::DeviceSocket(_) => (
            (close_code::NORMAL, String::new()),
            (close_code::NORMAL, "charge point disconnected".into()),
        ),
        RelayError::BackendDisconnect => (
            (close_code::NORMAL, "backend closed the connection".into()),
            (close_code::NORMAL, String::new()),
        ),
        RelayError::BackendUnavailable(e) => (
            (close_code::INTERNAL_ERROR, format!("backend unavailable: {e}")),
            (close_code::NORMAL, String::new()),
        ),
        RelayError::DecodeLoop(n) => {
            let reason = format!("{n} consecutive undecodable frames");
            ((close_code::POLICY, reason.clone()), (close_code::POLICY, reason))
        }
        RelayError::Cancelled => (
            (close_code::GOING_AWAY, "session closed by bridge".into()),
            (close_code::GOING_AWAY, "session closed by bridge".into()),
        ),
    }
}

/// Run both loops of a session and tear it down when either ends.
pub(crate) async fn run_session(
    shared: Arc<Shared>,
    device_in: BoxStream<'static, Inbound>,
    backend_in: BoxStream<'static, Inbound>,
    commands: mpsc::Receiver<Frame>,
    registry: Arc<RwLock<HashMap<String, SessionHandle>>>,
) {
    let span = tracing::Span::current();
    let mut loops = JoinSet::new();
    loops.spawn(
        relay_loop(Arc::clone(&shared), Direction::DeviceToBackend, device_in, None)
            .instrument(span.clone()),
    );
    loops.spawn(
        relay_loop(
            Arc::clone(&shared),
            Direction::BackendToDevice,
            backend_in,
            Some(commands),
        )
        .instrument(span),
    );

    let reason = match loops.join_next().await {
        Some(Ok(reason)) => reason,
        Some(Err(e)) => {
            warn!(session = %shared.id, "relay task failed: {e}");
            RelayError::Cancelled
        }
        None => RelayError::Cancelled,
    };
    shared.cancel.cancel();
    while loops.join_next().await.is_some() {}

    let ((device_code, device_reason), (backend_code, backend_reason)) = close_frames(&reason);
    shared.close_side(Side::Device, device_code, device_reason);
    shared.close_side(Side::Backend, backend_code, backend_reason);

    shared.state.lock().await.clear();

    {
        let mut sessions = registry.write().await;
        match sessions.get(&shared.id) {
            Some(handle) if handle.instance != shared.instance => {
                debug!(session = %shared.id, "replaced by a newer connection, leaving it registered");
            }
            _ => {
                sessions.remove(&shared.id);
                shared.ctx.status.remove(&shared.id).await;
            }
        }
    }

    info!(session = %shared.id, reason = %reason, "session closed");
}
