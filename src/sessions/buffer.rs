//! Per-session ring buffer of [`FrameRecord`]s.
//!
//! [`FrameBuffer`] keeps the last N records of a session for the dashboard and
//! forwards every pushed record to the message journal. When the buffer is
//! full, the oldest record is evicted. Long-poll readers wait on the shared
//! [`Notify`].

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::ocpp::{Action, Direction};
use crate::util::now_ms;

/// What the relay did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Forwarded byte-for-byte.
    Unmodified,
    /// Forwarded after at least one rule changed it.
    Rewritten,
    /// Dropped by a blocking rule.
    Blocked,
    /// Undecodable, forwarded raw.
    Passthrough,
    /// Created by the bridge (auto-reply, injection, dashboard command).
    Synthesized,
    /// A reply the bridge swallowed because it already answered on the peer's behalf.
    Absorbed,
    /// A request answered by the bridge and not forwarded.
    Intercepted,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unmodified => "unmodified",
            Self::Rewritten => "rewritten",
            Self::Blocked => "blocked",
            Self::Passthrough => "passthrough",
            Self::Synthesized => "synthesized",
            Self::Absorbed => "absorbed",
            Self::Intercepted => "intercepted",
        }
    }
}

/// One frame as seen by the relay, before and after transformation.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    /// Sequence number, unique within a session. Assigned by [`FrameBuffer::push`].
    pub seq: u64,
    pub timestamp_ms: u64,
    pub session_id: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Text as received. Absent for synthesized frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Text as sent, when it differs from `raw`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformed: Option<String>,
    pub outcome: Outcome,
    /// Rules and workarounds that fired, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
}

impl FrameRecord {
    pub fn new(session_id: &str, direction: Direction, outcome: Outcome) -> Self {
        Self {
            seq: 0,
            timestamp_ms: now_ms(),
            session_id: session_id.to_string(),
            direction,
            action: None,
            raw: None,
            transformed: None,
            outcome,
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn action(mut self, action: Option<Action>) -> Self {
        self.action = action;
        self
    }

    #[must_use]
    pub fn raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    #[must_use]
    pub fn transformed(mut self, text: impl Into<String>) -> Self {
        self.transformed = Some(text.into());
        self
    }

    #[must_use]
    pub fn rules(mut self, rules: Vec<String>) -> Self {
        self.rules = rules;
        self
    }
}

/// Ring buffer of [`FrameRecord`]s with reader notification.
pub struct FrameBuffer {
    entries: VecDeque<FrameRecord>,
    next_seq: u64,
    max_entries: usize,
    notify: Arc<Notify>,
    journal_tx: Option<mpsc::Sender<FrameRecord>>,
    journal_dropped: u64,
}

impl FrameBuffer {
    /// Create a buffer that holds at most `max_entries` records.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries: max_entries.max(1),
            notify: Arc::new(Notify::new()),
            journal_tx: None,
            journal_dropped: 0,
        }
    }

    /// Records pushed after this call are also sent to the journal.
    pub fn set_journal(&mut self, tx: mpsc::Sender<FrameRecord>) {
        self.journal_tx = Some(tx);
    }

    /// Assign the next sequence number, evict the oldest record if full and
    /// wake waiting readers. Returns the assigned sequence number.
    pub fn push(&mut self, mut record: FrameRecord) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        record.seq = seq;

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        // Non-blocking: the caller holds the buffer lock.
        if let Some(ref tx) = self.journal_tx {
            if tx.try_send(record.clone()).is_err() {
                self.journal_dropped += 1;
                tracing::warn!(
                    session = %record.session_id,
                    seq,
                    dropped = self.journal_dropped,
                    "message log channel full or closed, record not logged"
                );
            }
        }

        self.entries.push_back(record);
        self.notify.notify_waiters();
        seq
    }

    /// Records with `seq > since`, plus how many in that range were evicted.
    pub fn read_since(&self, since: u64) -> (Vec<FrameRecord>, u64) {
        let oldest_available = self.entries.front().map_or(self.next_seq, |e| e.seq);
        let dropped = if oldest_available > since.saturating_add(1) {
            oldest_available - since - 1
        } else {
            0
        };

        let entries = self
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();

        (entries, dropped)
    }

    pub fn has_entries_since(&self, since: u64) -> bool {
        self.entries.back().is_some_and(|e| e.seq > since)
    }

    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Records that could not be handed to the message log.
    pub fn journal_dropped(&self) -> u64 {
        self.journal_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: Outcome) -> FrameRecord {
        FrameRecord::new("CP1", Direction::DeviceToBackend, outcome).raw("[2,\"1\",\"Heartbeat\",{}]")
    }

    #[test]
    fn evicts_oldest_and_reports_dropped() {
        let mut buf = FrameBuffer::new(3);
        for _ in 0..5 {
            buf.push(record(Outcome::Unmodified));
        }
        let (entries, dropped) = buf.read_since(0);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(dropped, 2);

        let (entries, dropped) = buf.read_since(4);
        assert_eq!(entries.len(), 1);
        assert_eq!(dropped, 0);
        assert!(!buf.has_entries_since(5));
        assert_eq!(buf.next_seq(), 6);
    }

    #[tokio::test]
    async fn pushes_are_mirrored_to_journal() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut buf = FrameBuffer::new(2);
        buf.set_journal(tx);
        buf.push(record(Outcome::Blocked).rules(vec!["block_action".into()]));
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.seq, 1);
        assert_eq!(sent.outcome, Outcome::Blocked);
    }

    #[test]
    fn full_journal_channel_is_counted() {
        let (tx, _rx) = mpsc::channel(1);
        let mut buf = FrameBuffer::new(8);
        buf.set_journal(tx);
        for _ in 0..3 {
            buf.push(record(Outcome::Unmodified));
        }
        assert_eq!(buf.journal_dropped(), 2);
        // The ring itself keeps every record.
        assert_eq!(buf.read_since(0).0.len(), 3);
    }

    #[test]
    fn serializes_compactly() {
        let rec = FrameRecord::new("CP1", Direction::BackendToDevice, Outcome::Synthesized)
            .action(Some(Action::Reset))
            .transformed("[2,\"x\",\"Reset\",{}]");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["direction"], "backend_to_device");
        assert_eq!(json["outcome"], "synthesized");
        assert_eq!(json["action"], "Reset");
        assert!(json.get("raw").is_none());
        assert!(json.get("rules").is_none());
    }
}
