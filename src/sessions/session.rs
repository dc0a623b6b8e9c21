//! Mutable per-session state shared by the two relay loops.
//!
//! A [`SessionState`] lives behind the session's `tokio::sync::Mutex` and is
//! only touched for the synchronous pipeline/engine step of one frame, never
//! across a socket await.
//!
//! ## In-flight requests
//!
//! Requests are keyed by the direction they travelled plus their correlation
//! id, so a device Call `"7"` and a backend Call `"7"` never clash. A response
//! travelling `d` answers the request that travelled `d.reverse()`.
//!
//! Replies may never come (a peer drops a request, or a workaround answered
//! it already), so entries older than the in-flight TTL are pruned whenever a
//! new request is tracked. Minted ids are remembered for the same window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::ocpp::{Action, CorrelationId, Direction};

/// In-flight TTL when none is configured.
const DEFAULT_IN_FLIGHT_TTL: Duration = Duration::from_secs(300);

/// Who put a request on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Relayed from one of the two peers.
    Peer,
    /// Minted by an injection workaround.
    Injected,
    /// Sent from the dashboard.
    Command,
}

/// A request waiting for its response.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub action: Action,
    pub origin: RequestOrigin,
    /// Swallow the response instead of delivering it.
    pub absorb_reply: bool,
    /// Workaround that set `absorb_reply`, if any.
    pub absorbed_by: Option<String>,
    pub sent_at: Instant,
}

impl InFlight {
    pub fn new(action: Action, origin: RequestOrigin) -> Self {
        Self {
            action,
            origin,
            absorb_reply: false,
            absorbed_by: None,
            sent_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn absorbed_by(mut self, name: impl Into<String>) -> Self {
        self.absorb_reply = true;
        self.absorbed_by = Some(name.into());
        self
    }
}

/// Workaround progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// The triggering request has been seen.
    Armed,
    /// Response sent, override applied or injection scheduled.
    Fired,
}

/// State bag owned by one session.
pub struct SessionState {
    pub session_id: String,
    in_flight: HashMap<(Direction, CorrelationId), InFlight>,
    cache: HashMap<Action, Value>,
    phases: HashMap<String, Phase>,
    /// Minted ids and when they were minted.
    issued_ids: HashMap<CorrelationId, Instant>,
    /// `None` keeps entries until the session ends.
    in_flight_ttl: Option<Duration>,
    /// Consecutive undecodable frames, per direction.
    decode_failures: HashMap<Direction, u32>,
}

impl SessionState {
    /// Fresh state, seeded with identity payloads cached by earlier connections.
    pub fn new(session_id: &str, cache: HashMap<Action, Value>) -> Self {
        Self {
            session_id: session_id.to_string(),
            in_flight: HashMap::new(),
            cache,
            phases: HashMap::new(),
            issued_ids: HashMap::new(),
            in_flight_ttl: Some(DEFAULT_IN_FLIGHT_TTL),
            decode_failures: HashMap::new(),
        }
    }

    /// Expire unanswered requests after `ttl`; zero disables expiry.
    #[must_use]
    pub fn with_in_flight_ttl(mut self, ttl: Duration) -> Self {
        self.in_flight_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    // ── In-flight ──────────────────────────────────────────────────────────

    /// Remember a request that travelled `direction`.
    pub fn track_request(&mut self, direction: Direction, id: CorrelationId, entry: InFlight) {
        self.expire_in_flight(entry.sent_at);
        self.in_flight.insert((direction, id), entry);
    }

    /// Drop requests sent more than the TTL before `now`, and minted ids that
    /// are that old and no longer in flight. Returns how many requests went.
    pub fn expire_in_flight(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.in_flight_ttl else {
            return 0;
        };
        let fresh = |at: Instant| now.saturating_duration_since(at) < ttl;

        let before = self.in_flight.len();
        self.in_flight.retain(|_, entry| fresh(entry.sent_at));
        let expired = before - self.in_flight.len();
        if expired > 0 {
            tracing::debug!(session = %self.session_id, expired, "unanswered requests expired");
        }

        let in_flight = &self.in_flight;
        self.issued_ids
            .retain(|id, at| fresh(*at) || in_flight.keys().any(|(_, live)| live == id));
        expired
    }

    /// The request a response travelling `response_direction` answers.
    pub fn pending_request(
        &self,
        response_direction: Direction,
        id: &CorrelationId,
    ) -> Option<&InFlight> {
        self.in_flight
            .get(&(response_direction.reverse(), id.clone()))
    }

    /// Remove and return the request a response answers.
    pub fn complete_request(
        &mut self,
        response_direction: Direction,
        id: &CorrelationId,
    ) -> Option<InFlight> {
        self.in_flight
            .remove(&(response_direction.reverse(), id.clone()))
    }

    /// Whether `id` is outstanding for a request that travelled `direction`.
    pub fn is_in_flight(&self, direction: Direction, id: &CorrelationId) -> bool {
        self.in_flight.contains_key(&(direction, id.clone()))
    }

    /// Whether `id` is outstanding in either direction.
    pub fn id_in_use(&self, id: &CorrelationId) -> bool {
        self.in_flight.keys().any(|(_, live)| live == id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    // ── Minted ids ─────────────────────────────────────────────────────────

    /// Mint a correlation id that is neither in flight nor previously issued
    /// in this session. `generate` is called until it yields a fresh id.
    pub fn issue_id(&mut self, mut generate: impl FnMut() -> String) -> CorrelationId {
        loop {
            let candidate = CorrelationId::from(generate());
            if self.id_in_use(&candidate) || self.issued_ids.contains_key(&candidate) {
                tracing::debug!(session = %self.session_id, id = %candidate, "minted id collides, regenerating");
                continue;
            }
            self.issued_ids.insert(candidate.clone(), Instant::now());
            return candidate;
        }
    }

    pub fn was_issued(&self, id: &CorrelationId) -> bool {
        self.issued_ids.contains_key(id)
    }

    // ── Cache ──────────────────────────────────────────────────────────────

    pub fn cached(&self, action: &Action) -> Option<&Value> {
        self.cache.get(action)
    }

    pub fn cache_payload(&mut self, action: Action, payload: Value) {
        self.cache.insert(action, payload);
    }

    // ── Phases ─────────────────────────────────────────────────────────────

    pub fn phase(&self, workaround: &str) -> Phase {
        self.phases.get(workaround).copied().unwrap_or_default()
    }

    pub fn set_phase(&mut self, workaround: &str, phase: Phase) {
        self.phases.insert(workaround.to_string(), phase);
    }

    // ── Decode failures ────────────────────────────────────────────────────

    /// Count one more undecodable frame; returns the running count.
    pub fn note_decode_failure(&mut self, direction: Direction) -> u32 {
        let count = self.decode_failures.entry(direction).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_decode_failures(&mut self, direction: Direction) {
        self.decode_failures.remove(&direction);
    }

    /// Drop everything tied to live sockets. Cached identity survives.
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.phases.clear();
        self.decode_failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_find_requests_of_the_opposite_direction() {
        let mut state = SessionState::new("CP1", HashMap::new());
        let id = CorrelationId::from("7");
        state.track_request(
            Direction::BackendToDevice,
            id.clone(),
            InFlight::new(Action::Reset, RequestOrigin::Peer),
        );

        assert!(state.pending_request(Direction::BackendToDevice, &id).is_none());
        assert_eq!(
            state
                .pending_request(Direction::DeviceToBackend, &id)
                .map(|r| r.action.clone()),
            Some(Action::Reset)
        );
        assert!(state.complete_request(Direction::DeviceToBackend, &id).is_some());
        assert_eq!(state.in_flight_count(), 0);
    }

    #[test]
    fn same_id_in_both_directions_is_distinct() {
        let mut state = SessionState::new("CP1", HashMap::new());
        let id = CorrelationId::from("1");
        state.track_request(
            Direction::DeviceToBackend,
            id.clone(),
            InFlight::new(Action::Heartbeat, RequestOrigin::Peer),
        );
        state.track_request(
            Direction::BackendToDevice,
            id.clone(),
            InFlight::new(Action::Reset, RequestOrigin::Peer),
        );
        assert_eq!(state.in_flight_count(), 2);
        let answered = state.complete_request(Direction::BackendToDevice, &id).unwrap();
        assert_eq!(answered.action, Action::Heartbeat);
    }

    #[test]
    fn issue_id_skips_live_and_issued_ids() {
        let mut state = SessionState::new("CP1", HashMap::new());
        state.track_request(
            Direction::DeviceToBackend,
            CorrelationId::from("a"),
            InFlight::new(Action::Heartbeat, RequestOrigin::Peer),
        );
        let mut candidates = vec!["a", "b", "b", "c"].into_iter();
        let first = state.issue_id(|| candidates.next().unwrap().to_string());
        assert_eq!(first, CorrelationId::from("b"));
        let second = state.issue_id(|| candidates.next().unwrap().to_string());
        assert_eq!(second, CorrelationId::from("c"));
        assert!(state.was_issued(&first));
    }

    #[test]
    fn unanswered_requests_expire() {
        let mut state = SessionState::new("CP1", HashMap::new())
            .with_in_flight_ttl(Duration::from_secs(60));
        for i in 0..1000 {
            state.track_request(
                Direction::BackendToDevice,
                CorrelationId::from(format!("r{i}")),
                InFlight::new(Action::TriggerMessage, RequestOrigin::Peer),
            );
        }
        let minted = state.issue_id(|| "proxy-1".to_string());
        state.track_request(
            Direction::DeviceToBackend,
            minted.clone(),
            InFlight::new(Action::BootNotification, RequestOrigin::Injected),
        );
        assert_eq!(state.in_flight_count(), 1001);

        // Still live at the TTL boundary minus a second.
        assert_eq!(state.expire_in_flight(Instant::now() + Duration::from_secs(59)), 0);
        assert!(state.was_issued(&minted));

        assert_eq!(state.expire_in_flight(Instant::now() + Duration::from_secs(61)), 1001);
        assert_eq!(state.in_flight_count(), 0);
        assert!(!state.was_issued(&minted));
    }

    #[test]
    fn tracking_prunes_stale_requests() {
        let mut state = SessionState::new("CP1", HashMap::new())
            .with_in_flight_ttl(Duration::from_millis(20));
        for i in 0..100 {
            state.track_request(
                Direction::DeviceToBackend,
                CorrelationId::from(format!("{i}")),
                InFlight::new(Action::Heartbeat, RequestOrigin::Peer),
            );
        }
        std::thread::sleep(Duration::from_millis(30));
        state.track_request(
            Direction::DeviceToBackend,
            CorrelationId::from("late"),
            InFlight::new(Action::Heartbeat, RequestOrigin::Peer),
        );
        assert_eq!(state.in_flight_count(), 1);
    }

    #[test]
    fn zero_ttl_keeps_requests_until_cleared() {
        let mut state =
            SessionState::new("CP1", HashMap::new()).with_in_flight_ttl(Duration::ZERO);
        state.track_request(
            Direction::DeviceToBackend,
            CorrelationId::from("1"),
            InFlight::new(Action::Heartbeat, RequestOrigin::Peer),
        );
        assert_eq!(state.expire_in_flight(Instant::now() + Duration::from_secs(86_400)), 0);
        assert_eq!(state.in_flight_count(), 1);
    }

    #[test]
    fn clear_keeps_cache() {
        let mut state = SessionState::new("CP1", HashMap::new());
        state.cache_payload(Action::BootNotification, serde_json::json!({"a": 1}));
        state.set_phase("w", Phase::Armed);
        state.note_decode_failure(Direction::DeviceToBackend);
        state.clear();
        assert_eq!(state.phase("w"), Phase::Idle);
        assert!(state.cached(&Action::BootNotification).is_some());
        assert_eq!(state.note_decode_failure(Direction::DeviceToBackend), 1);
    }
}
