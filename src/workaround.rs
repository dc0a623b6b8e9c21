//! Auto-response engine.
//!
//! Workarounds answer requests on a peer's behalf, rewrite response codes and
//! schedule synthetic Calls. The engine is stateless; everything that changes
//! per message lives in [`SessionState`], and the relay acts on the returned
//! decisions.
//!
//! Each workaround walks `Idle → Armed → Fired → Idle`: armed when its
//! triggering request is seen, fired when it acts, idle again once the reply
//! it cares about has been absorbed or forwarded (or its injection delivered).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{WorkaroundEntry, WorkaroundKind};
use crate::ocpp::{Action, Call, CorrelationId, Direction, Frame, Side};
use crate::sessions::session::{InFlight, Phase, RequestOrigin, SessionState};
use crate::util::format_ocpp_time;

/// Placeholder replaced with the current time in canned payloads.
const NOW_PLACEHOLDER: &str = "{{now}}";

/// Source of correlation ids for bridge-minted Calls.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// `proxy-<uuid v4>` ids.
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self) -> String {
        format!("proxy-{}", Uuid::new_v4())
    }
}

/// A Call to deliver later.
#[derive(Debug, Clone)]
pub struct Injection {
    pub workaround: String,
    pub delay: Duration,
    pub target: Side,
    pub frame: Frame,
}

/// What to do with a request after the pipeline.
#[derive(Debug)]
pub struct RequestDecision {
    /// Sent back to whoever sent the request.
    pub reply: Option<Frame>,
    pub forward: bool,
    /// Recorded on the forwarded request's in-flight entry.
    pub absorbed_by: Option<String>,
    pub injections: Vec<Injection>,
    /// Payload to write back to the identity store.
    pub cache_update: Option<(Action, Value)>,
    pub fired: Vec<String>,
}

impl Default for RequestDecision {
    fn default() -> Self {
        Self {
            reply: None,
            forward: true,
            absorbed_by: None,
            injections: Vec::new(),
            cache_update: None,
            fired: Vec::new(),
        }
    }
}

/// What to do with a response after the pipeline.
#[derive(Debug)]
pub enum ResponseDecision {
    Forward {
        frame: Frame,
        fired: Vec<String>,
    },
    /// Swallow the response; `by` names the workaround (or `injection`/`command`).
    Absorb {
        frame: Frame,
        by: String,
        origin: RequestOrigin,
    },
}

struct Workaround {
    name: String,
    enabled: bool,
    kind: WorkaroundKind,
}

/// Workarounds shared by all sessions.
pub struct Engine {
    workarounds: Vec<Workaround>,
    cache_actions: Vec<Action>,
    ids: Arc<dyn IdGenerator>,
}

fn render_template(template: &Value, now: &str) -> Value {
    match template {
        Value::String(s) if s == NOW_PLACEHOLDER => Value::String(now.to_string()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_template(v, now)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_template(v, now)).collect()),
        other => other.clone(),
    }
}

impl Engine {
    pub fn new(entries: &[WorkaroundEntry], cache_actions: Vec<Action>) -> Self {
        Self::with_ids(entries, cache_actions, Arc::new(UuidIds))
    }

    pub fn with_ids(
        entries: &[WorkaroundEntry],
        cache_actions: Vec<Action>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let workarounds = entries
            .iter()
            .map(|e| Workaround {
                name: e.name.clone().unwrap_or_else(|| e.kind.as_str().to_string()),
                enabled: e.enabled,
                kind: e.kind.clone(),
            })
            .collect();
        Self {
            workarounds,
            cache_actions,
            ids,
        }
    }

    /// Mint a fresh id for a bridge-originated Call.
    pub fn mint_id(&self, state: &mut SessionState) -> CorrelationId {
        state.issue_id(|| self.ids.next_id())
    }

    fn enabled(&self) -> impl Iterator<Item = &Workaround> {
        self.workarounds.iter().filter(|w| w.enabled)
    }

    /// Decide on a Call travelling `direction` that passed the pipeline.
    pub fn on_call(
        &self,
        direction: Direction,
        call: &Call,
        state: &mut SessionState,
        now: DateTime<Utc>,
    ) -> RequestDecision {
        let mut decision = RequestDecision::default();

        if direction == Direction::DeviceToBackend && self.cache_actions.contains(&call.action) {
            state.cache_payload(call.action.clone(), call.payload.clone());
            decision.cache_update = Some((call.action.clone(), call.payload.clone()));
        }

        for w in self.enabled() {
            match &w.kind {
                WorkaroundKind::CannedResponse {
                    action,
                    direction: trigger,
                    payload,
                    forward,
                } if *action == call.action && *trigger == direction => {
                    if decision.reply.is_some() {
                        debug!(workaround = %w.name, "request already answered");
                        continue;
                    }
                    state.set_phase(&w.name, Phase::Armed);
                    let body = render_template(payload, &format_ocpp_time(now));
                    decision.reply = Some(Frame::result(call.id.clone(), body));
                    if *forward {
                        decision.absorbed_by = Some(w.name.clone());
                        state.set_phase(&w.name, Phase::Fired);
                    } else {
                        decision.forward = false;
                        state.set_phase(&w.name, Phase::Idle);
                    }
                    decision.fired.push(w.name.clone());
                }
                WorkaroundKind::StatusOverride {
                    action,
                    direction: trigger,
                    ..
                } if *action == call.action && *trigger == direction => {
                    state.set_phase(&w.name, Phase::Armed);
                }
                WorkaroundKind::Inject {
                    trigger_action,
                    trigger_direction,
                    delay_ms,
                    target,
                    action,
                    from_cache,
                } if *trigger_action == call.action && *trigger_direction == direction => {
                    state.set_phase(&w.name, Phase::Armed);
                    let source = from_cache.as_ref().unwrap_or(action);
                    let Some(payload) = state.cached(source).cloned() else {
                        info!(
                            session = %state.session_id,
                            workaround = %w.name,
                            cache = %source,
                            "nothing cached to inject"
                        );
                        state.set_phase(&w.name, Phase::Idle);
                        continue;
                    };
                    let id = self.mint_id(state);
                    state.track_request(
                        Direction::towards(*target),
                        id.clone(),
                        InFlight::new(action.clone(), RequestOrigin::Injected).absorbed_by(&w.name),
                    );
                    state.set_phase(&w.name, Phase::Fired);
                    decision.injections.push(Injection {
                        workaround: w.name.clone(),
                        delay: Duration::from_millis(*delay_ms),
                        target: *target,
                        frame: Frame::call(id, action.clone(), payload),
                    });
                    decision.fired.push(w.name.clone());
                }
                _ => {}
            }
        }
        decision
    }

    /// Decide on a response travelling `direction` that passed the pipeline.
    pub fn on_response(
        &self,
        direction: Direction,
        frame: Frame,
        state: &mut SessionState,
    ) -> ResponseDecision {
        let Some(request) = state.complete_request(direction, frame.id()) else {
            return ResponseDecision::Forward {
                frame,
                fired: Vec::new(),
            };
        };

        if request.absorb_reply {
            let by = request.absorbed_by.clone().unwrap_or_else(|| match request.origin {
                RequestOrigin::Command => "command".to_string(),
                _ => "injection".to_string(),
            });
            if self.workarounds.iter().any(|w| w.name == by) {
                state.set_phase(&by, Phase::Idle);
            }
            return ResponseDecision::Absorb {
                frame,
                by,
                origin: request.origin,
            };
        }

        let request_direction = direction.reverse();
        let mut frame = frame;
        let mut fired = Vec::new();
        for w in self.enabled() {
            let WorkaroundKind::StatusOverride {
                action,
                direction: trigger,
                match_status,
                match_error_code,
                replace_status,
            } = &w.kind
            else {
                continue;
            };
            if *action != request.action || *trigger != request_direction {
                continue;
            }
            let rewritten = match &frame {
                Frame::CallResult(result) => match_status
                    .as_deref()
                    .filter(|wanted| result.payload.get("status").and_then(Value::as_str) == Some(*wanted))
                    .map(|_| {
                        let mut result = result.clone();
                        result.payload["status"] = Value::String(replace_status.clone());
                        Frame::CallResult(result)
                    }),
                Frame::CallError(err) => match_error_code
                    .as_deref()
                    .filter(|code| err.code == *code)
                    .map(|_| Frame::result(err.id.clone(), json!({ "status": replace_status }))),
                Frame::Call(_) => None,
            };
            if let Some(rewritten) = rewritten {
                state.set_phase(&w.name, Phase::Fired);
                frame = rewritten;
                fired.push(w.name.clone());
            }
            // Response forwarded either way.
            state.set_phase(&w.name, Phase::Idle);
        }
        ResponseDecision::Forward { frame, fired }
    }

    /// An injection reached its target socket.
    pub fn injection_delivered(state: &mut SessionState, workaround: &str) {
        if state.phase(workaround) == Phase::Fired {
            state.set_phase(workaround, Phase::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<&'static str>>);

    impl IdGenerator for Scripted {
        fn next_id(&self) -> String {
            self.0.lock().unwrap().remove(0).to_string()
        }
    }

    fn engine(toml: &str) -> Engine {
        let config = Config::from_toml(toml).unwrap();
        Engine::new(&config.workarounds, config.identity.cache_actions)
    }

    fn call(id: &str, action: Action, payload: Value) -> Call {
        Call {
            id: CorrelationId::from(id),
            action,
            payload,
        }
    }

    const CANNED: &str = r#"
        [[workarounds]]
        name = "trigger-ack"
        kind = "canned_response"
        action = "TriggerMessage"
        direction = "backend_to_device"
        payload = { status = "Accepted", at = "{{now}}" }
    "#;

    #[test]
    fn canned_response_replies_and_absorbs_real_reply() {
        let engine = engine(CANNED);
        let mut state = SessionState::new("CP1", HashMap::new());
        let now = Utc::now();
        let request = call("5", Action::TriggerMessage, json!({"requestedMessage": "BootNotification"}));

        let decision = engine.on_call(Direction::BackendToDevice, &request, &mut state, now);
        let reply = decision.reply.expect("canned reply");
        assert_eq!(reply.id(), &CorrelationId::from("5"));
        assert_eq!(reply.payload().unwrap()["status"], "Accepted");
        assert_eq!(reply.payload().unwrap()["at"], format_ocpp_time(now));
        assert!(decision.forward);
        assert_eq!(decision.absorbed_by.as_deref(), Some("trigger-ack"));
        assert_eq!(state.phase("trigger-ack"), Phase::Fired);

        // The relay tracks the forwarded request with the absorb marker.
        state.track_request(
            Direction::BackendToDevice,
            request.id.clone(),
            InFlight::new(request.action.clone(), RequestOrigin::Peer).absorbed_by("trigger-ack"),
        );
        let real = Frame::result(CorrelationId::from("5"), json!({"status": "Rejected"}));
        match engine.on_response(Direction::DeviceToBackend, real, &mut state) {
            ResponseDecision::Absorb { by, .. } => assert_eq!(by, "trigger-ack"),
            other => panic!("expected Absorb, got {other:?}"),
        }
        assert_eq!(state.phase("trigger-ack"), Phase::Idle);

        // A duplicate reply is no longer in flight and passes through.
        let dup = Frame::result(CorrelationId::from("5"), json!({}));
        assert!(matches!(
            engine.on_response(Direction::DeviceToBackend, dup, &mut state),
            ResponseDecision::Forward { .. }
        ));
    }

    #[test]
    fn canned_response_without_forwarding_intercepts() {
        let engine = engine(
            r#"
            [[workarounds]]
            kind = "canned_response"
            action = "DataTransfer"
            direction = "device_to_backend"
            forward = false
            "#,
        );
        let mut state = SessionState::new("CP1", HashMap::new());
        let decision = engine.on_call(
            Direction::DeviceToBackend,
            &call("1", Action::DataTransfer, json!({"vendorId": "x"})),
            &mut state,
            Utc::now(),
        );
        assert!(!decision.forward);
        assert_eq!(decision.reply.unwrap().encode(), r#"[3,"1",{}]"#);
        assert_eq!(state.phase("canned_response"), Phase::Idle);
    }

    #[test]
    fn other_directions_do_not_trigger() {
        let engine = engine(CANNED);
        let mut state = SessionState::new("CP1", HashMap::new());
        let decision = engine.on_call(
            Direction::DeviceToBackend,
            &call("5", Action::TriggerMessage, json!({})),
            &mut state,
            Utc::now(),
        );
        assert!(decision.reply.is_none());
        assert!(decision.fired.is_empty());
    }

    const OVERRIDE: &str = r#"
        [[workarounds]]
        kind = "status_override"
        action = "RemoteStopTransaction"
        direction = "backend_to_device"
        match_status = "Rejected"
        match_error_code = "NotImplemented"
        replace_status = "Accepted"
    "#;

    #[test]
    fn status_override_applies_only_to_tracked_ids() {
        let engine = engine(OVERRIDE);
        let mut state = SessionState::new("CP1", HashMap::new());

        let untracked = Frame::result(CorrelationId::from("9"), json!({"status": "Rejected"}));
        match engine.on_response(Direction::DeviceToBackend, untracked.clone(), &mut state) {
            ResponseDecision::Forward { frame, fired } => {
                assert_eq!(frame, untracked);
                assert!(fired.is_empty());
            }
            other => panic!("expected Forward, got {other:?}"),
        }

        let request = call("9", Action::RemoteStopTransaction, json!({"transactionId": 1}));
        engine.on_call(Direction::BackendToDevice, &request, &mut state, Utc::now());
        assert_eq!(state.phase("status_override"), Phase::Armed);
        state.track_request(
            Direction::BackendToDevice,
            request.id.clone(),
            InFlight::new(request.action.clone(), RequestOrigin::Peer),
        );
        match engine.on_response(Direction::DeviceToBackend, untracked, &mut state) {
            ResponseDecision::Forward { frame, fired } => {
                assert_eq!(frame.encode(), r#"[3,"9",{"status":"Accepted"}]"#);
                assert_eq!(fired, vec!["status_override"]);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
        assert_eq!(state.phase("status_override"), Phase::Idle);
    }

    #[test]
    fn status_override_converts_matching_call_error() {
        let engine = engine(OVERRIDE);
        let mut state = SessionState::new("CP1", HashMap::new());
        state.track_request(
            Direction::BackendToDevice,
            CorrelationId::from("3"),
            InFlight::new(Action::RemoteStopTransaction, RequestOrigin::Peer),
        );
        let error = Frame::decode(r#"[4,"3","NotImplemented","nope",{}]"#).unwrap();
        match engine.on_response(Direction::DeviceToBackend, error, &mut state) {
            ResponseDecision::Forward { frame, .. } => {
                assert_eq!(frame.encode(), r#"[3,"3",{"status":"Accepted"}]"#);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    const INJECT: &str = r#"
        [identity]
        cache_actions = ["BootNotification"]

        [[workarounds]]
        name = "replay-boot"
        kind = "inject"
        trigger_action = "TriggerMessage"
        trigger_direction = "backend_to_device"
        delay_ms = 1500
        target = "backend"
        action = "BootNotification"
    "#;

    #[test]
    fn inject_uses_cache_and_a_fresh_id() {
        let config = Config::from_toml(INJECT).unwrap();
        let ids = Arc::new(Scripted(Mutex::new(vec!["live", "proxy-1"])));
        let engine = Engine::with_ids(&config.workarounds, config.identity.cache_actions, ids);
        let mut state = SessionState::new("CP1", HashMap::new());

        let boot = call("live", Action::BootNotification, json!({"chargePointModel": "AC1"}));
        let decision = engine.on_call(Direction::DeviceToBackend, &boot, &mut state, Utc::now());
        assert_eq!(
            decision.cache_update,
            Some((Action::BootNotification, json!({"chargePointModel": "AC1"})))
        );
        // The boot request is still waiting for its answer.
        state.track_request(
            Direction::DeviceToBackend,
            boot.id.clone(),
            InFlight::new(Action::BootNotification, RequestOrigin::Peer),
        );

        let trigger = call("t1", Action::TriggerMessage, json!({"requestedMessage": "BootNotification"}));
        let decision = engine.on_call(Direction::BackendToDevice, &trigger, &mut state, Utc::now());
        assert_eq!(decision.injections.len(), 1);
        let injection = &decision.injections[0];
        assert_eq!(injection.target, Side::Backend);
        assert_eq!(injection.delay, Duration::from_millis(1500));
        assert_eq!(injection.frame.id(), &CorrelationId::from("proxy-1"));
        assert_eq!(injection.frame.payload().unwrap()["chargePointModel"], "AC1");
        assert_eq!(state.phase("replay-boot"), Phase::Fired);

        let reply = Frame::result(CorrelationId::from("proxy-1"), json!({"status": "Accepted"}));
        assert!(matches!(
            engine.on_response(Direction::BackendToDevice, reply, &mut state),
            ResponseDecision::Absorb { origin: RequestOrigin::Injected, .. }
        ));
        assert_eq!(state.phase("replay-boot"), Phase::Idle);
    }

    #[test]
    fn inject_without_cache_does_nothing() {
        let config = Config::from_toml(INJECT).unwrap();
        let engine = Engine::new(&config.workarounds, config.identity.cache_actions);
        let mut state = SessionState::new("CP1", HashMap::new());
        let trigger = call("t1", Action::TriggerMessage, json!({}));
        let decision = engine.on_call(Direction::BackendToDevice, &trigger, &mut state, Utc::now());
        assert!(decision.injections.is_empty());
        assert_eq!(state.phase("replay-boot"), Phase::Idle);
        assert_eq!(state.in_flight_count(), 0);
    }

    #[test]
    fn disabled_workarounds_are_ignored() {
        let engine = engine(
            r#"
            [[workarounds]]
            kind = "canned_response"
            enabled = false
            action = "Heartbeat"
            direction = "device_to_backend"
            "#,
        );
        let mut state = SessionState::new("CP1", HashMap::new());
        let decision = engine.on_call(
            Direction::DeviceToBackend,
            &call("1", Action::Heartbeat, json!({})),
            &mut state,
            Utc::now(),
        );
        assert!(decision.reply.is_none());
        assert!(decision.forward);
    }
}
