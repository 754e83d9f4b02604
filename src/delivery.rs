//! At-least-once delivery of a client's event queue.
//!
//! The queue itself lives in the [`EventStore`](crate::store::EventStore);
//! this module only tracks what is in flight on one connection. It holds no
//! timers and does no I/O, so the connection driver can feed it poll
//! results, retry ticks and acks and act on the decisions it returns.
//!
//! # Protocol
//!
//! ```text
//! Server                               Client
//!   │  poll: head = "ev1|1|1000"          │
//!   │  server-event { eventId: ev1 }      │
//!   │────────────────────────────────────>│
//!   │  (+1s retry 1, identical frame)     │
//!   │────────────────────────────────────>│
//!   │  ack { eventId: ev1 }               │
//!   │<────────────────────────────────────│
//!   │  pop head, clear in-flight event    │
//! ```
//!
//! Without an ack the event is resent on each retry tick until the counter
//! passes [`MAX_RETRY_ATTEMPTS`]; the event is then abandoned but stays at
//! the head of the queue, so the next poll adopts it again.

use std::collections::VecDeque;

use crate::constants::{MAX_INVALID_ACKS, MAX_RETRY_ATTEMPTS};
use crate::protocol::Message;

/// One queue entry, parsed from `eventId|eventNumber|timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Identity used to match acks.
    pub event_id: String,
    /// Sequence number, passed through as stored.
    pub event_number: Option<String>,
    /// Timestamp, passed through as stored.
    pub timestamp: Option<String>,
}

impl EventRecord {
    /// Parse a raw queue entry.
    ///
    /// Missing trailing fields become `None`; anything after the second `|`
    /// belongs to the timestamp.
    pub fn parse(entry: &str) -> Self {
        let mut fields = entry.splitn(3, '|');
        let event_id = fields.next().unwrap_or_default().to_string();
        Self {
            event_id,
            event_number: fields.next().map(str::to_string),
            timestamp: fields.next().map(str::to_string),
        }
    }

    /// The `server-event` that carries this record.
    pub fn to_message(&self) -> Message {
        Message::ServerEvent {
            event_id: self.event_id.clone(),
            event_number: self.event_number.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

/// What the driver should do when the retry timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing is in flight; stop the timer.
    Idle,
    /// Resend the in-flight frame.
    Retransmit {
        /// Retry number, starting at 1.
        attempt: u32,
    },
    /// Give up on the in-flight event and stop the timer. The queue entry
    /// is left in place.
    Abandon {
        /// Id of the abandoned event.
        event_id: String,
        /// Retry counter at the moment of abandonment.
        attempts: u32,
    },
}

/// What the driver should do with an incoming ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDecision {
    /// The ack names the in-flight event: pop the head and stop retrying.
    Matched {
        /// Id of the acknowledged event.
        event_id: String,
    },
    /// The ack names something else; keep retrying.
    Mismatched {
        /// Invalid acks seen so far.
        invalid_acks: u32,
    },
    /// Too many invalid acks: pop the head anyway and stop retrying.
    ForceDrop {
        /// Invalid acks seen so far.
        invalid_acks: u32,
        /// The in-flight event at the time, if any.
        dropped: Option<String>,
    },
}

impl AckDecision {
    /// Whether the driver must pop the queue head.
    pub fn pops_head(&self) -> bool {
        !matches!(self, Self::Mismatched { .. })
    }
}

/// In-flight delivery state for one connection.
#[derive(Debug)]
pub struct DeliveryState {
    current: Option<EventRecord>,
    retry_attempts: u32,
    invalid_acks: u32,
    max_retries: u32,
    max_invalid_acks: u32,
    /// Serialized client payloads waiting for an empty queue.
    payloads: VecDeque<String>,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryState {
    /// Create state with the protocol's retry and invalid-ack limits.
    pub fn new() -> Self {
        Self::with_limits(MAX_RETRY_ATTEMPTS, MAX_INVALID_ACKS)
    }

    /// Create state with custom limits.
    pub fn with_limits(max_retries: u32, max_invalid_acks: u32) -> Self {
        Self {
            current: None,
            retry_attempts: 0,
            invalid_acks: 0,
            max_retries,
            max_invalid_acks,
            payloads: VecDeque::new(),
        }
    }

    /// The in-flight event, if any.
    pub fn current(&self) -> Option<&EventRecord> {
        self.current.as_ref()
    }

    /// Retries spent on the in-flight event.
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Invalid acks counted since the last matching ack.
    pub fn invalid_acks(&self) -> u32 {
        self.invalid_acks
    }

    /// Feed the current queue head.
    ///
    /// Returns the record to send when the head is a different event from
    /// the one in flight (or nothing is in flight). Adopting resets both
    /// counters. A head equal to the in-flight event returns `None`.
    pub fn observe_head(&mut self, entry: &str) -> Option<&EventRecord> {
        let record = EventRecord::parse(entry);
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.event_id == record.event_id)
        {
            return None;
        }

        self.retry_attempts = 0;
        self.invalid_acks = 0;
        self.current = Some(record);
        self.current.as_ref()
    }

    /// Advance the retry counter for one timer firing.
    pub fn on_retry_tick(&mut self) -> RetryDecision {
        if self.current.is_none() {
            return RetryDecision::Idle;
        }

        self.retry_attempts += 1;
        if self.retry_attempts > self.max_retries {
            let attempts = self.retry_attempts;
            let event_id = self
                .current
                .take()
                .map(|record| record.event_id)
                .unwrap_or_default();
            return RetryDecision::Abandon { event_id, attempts };
        }

        RetryDecision::Retransmit {
            attempt: self.retry_attempts,
        }
    }

    /// Apply an ack from the client.
    ///
    /// An ack without an id never matches. The invalid-ack counter is only
    /// reset by a matching ack or by adopting a new head.
    pub fn on_ack(&mut self, event_id: Option<&str>) -> AckDecision {
        let matches = match (&self.current, event_id) {
            (Some(current), Some(id)) => current.event_id == id,
            _ => false,
        };

        if matches {
            self.invalid_acks = 0;
            let event_id = self
                .current
                .take()
                .map(|record| record.event_id)
                .unwrap_or_default();
            return AckDecision::Matched { event_id };
        }

        self.invalid_acks += 1;
        if self.invalid_acks >= self.max_invalid_acks {
            return AckDecision::ForceDrop {
                invalid_acks: self.invalid_acks,
                dropped: self.current.take().map(|record| record.event_id),
            };
        }

        AckDecision::Mismatched {
            invalid_acks: self.invalid_acks,
        }
    }

    /// Buffer a serialized client payload until the queue is empty.
    pub fn enqueue_payload(&mut self, payload: String) {
        self.payloads.push_back(payload);
    }

    /// Oldest buffered payload, left in place until [`commit_payload`](Self::commit_payload).
    pub fn next_payload(&self) -> Option<&str> {
        self.payloads.front().map(String::as_str)
    }

    /// Drop the oldest buffered payload after it was persisted.
    pub fn commit_payload(&mut self) {
        self.payloads.pop_front();
    }

    /// Number of buffered payloads.
    pub fn pending_payloads(&self) -> usize {
        self.payloads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: i64) -> String {
        format!(r#"{{"type":"client-event","n":{n}}}"#)
    }

    // ========== EventRecord Tests ==========

    #[test]
    fn test_parse_full_entry() {
        let record = EventRecord::parse("ev1|1|1000");
        assert_eq!(record.event_id, "ev1");
        assert_eq!(record.event_number.as_deref(), Some("1"));
        assert_eq!(record.timestamp.as_deref(), Some("1000"));
    }

    #[test]
    fn test_parse_short_entry() {
        let record = EventRecord::parse("ev1");
        assert_eq!(record.event_id, "ev1");
        assert_eq!(record.event_number, None);
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn test_parse_keeps_extra_separators_in_timestamp() {
        let record = EventRecord::parse("ev1|2|3|4");
        assert_eq!(record.timestamp.as_deref(), Some("3|4"));
    }

    #[test]
    fn test_record_to_message() {
        let msg = EventRecord::parse("ev9|9|900").to_message();
        assert_eq!(
            msg,
            Message::ServerEvent {
                event_id: "ev9".into(),
                event_number: Some("9".into()),
                timestamp: Some("900".into()),
            }
        );
    }

    // ========== Head Adoption Tests ==========

    #[test]
    fn test_first_head_is_adopted() {
        let mut state = DeliveryState::new();
        let adopted = state.observe_head("ev1|1|1000").cloned();
        assert_eq!(adopted.map(|r| r.event_id).as_deref(), Some("ev1"));
        assert_eq!(state.current().map(|r| r.event_id.as_str()), Some("ev1"));
    }

    #[test]
    fn test_same_head_is_not_resent() {
        let mut state = DeliveryState::new();
        assert!(state.observe_head("ev1|1|1000").is_some());
        assert!(state.observe_head("ev1|1|1000").is_none());
    }

    #[test]
    fn test_new_head_resets_counters() {
        let mut state = DeliveryState::new();
        state.observe_head("ev1|1|1000");
        state.on_retry_tick();
        state.on_ack(Some("other"));
        assert_eq!(state.retry_attempts(), 1);
        assert_eq!(state.invalid_acks(), 1);

        assert!(state.observe_head("ev2|2|2000").is_some());
        assert_eq!(state.retry_attempts(), 0);
        assert_eq!(state.invalid_acks(), 0);
    }

    // ========== Retry Tests ==========

    #[test]
    fn test_retry_tick_without_event_is_idle() {
        let mut state = DeliveryState::new();
        assert_eq!(state.on_retry_tick(), RetryDecision::Idle);
    }

    #[test]
    fn test_retry_then_abandon_keeps_head() {
        let mut state = DeliveryState::new();
        state.observe_head("ev1|1|1000");

        assert_eq!(state.on_retry_tick(), RetryDecision::Retransmit { attempt: 1 });
        assert_eq!(state.on_retry_tick(), RetryDecision::Retransmit { attempt: 2 });
        assert_eq!(
            state.on_retry_tick(),
            RetryDecision::Abandon {
                event_id: "ev1".into(),
                attempts: 3
            }
        );
        assert!(state.current().is_none());

        // The entry was never popped, so the next poll sees it again.
        assert!(state.observe_head("ev1|1|1000").is_some());
        assert_eq!(state.retry_attempts(), 0);
    }

    #[test]
    fn test_custom_retry_limit() {
        let mut state = DeliveryState::with_limits(0, 2);
        state.observe_head("ev1");
        assert!(matches!(state.on_retry_tick(), RetryDecision::Abandon { attempts: 1, .. }));
    }

    // ========== Ack Tests ==========

    #[test]
    fn test_matching_ack_clears_event() {
        let mut state = DeliveryState::new();
        state.observe_head("ev1|1|1000");

        let decision = state.on_ack(Some("ev1"));
        assert_eq!(decision, AckDecision::Matched { event_id: "ev1".into() });
        assert!(decision.pops_head());
        assert!(state.current().is_none());
        assert_eq!(state.on_retry_tick(), RetryDecision::Idle);
    }

    #[test]
    fn test_matching_ack_resets_invalid_count() {
        let mut state = DeliveryState::new();
        state.observe_head("ev1|1|1000");
        state.on_ack(Some("nope"));
        state.on_ack(Some("ev1"));
        assert_eq!(state.invalid_acks(), 0);
    }

    #[test]
    fn test_two_mismatched_acks_force_drop() {
        let mut state = DeliveryState::new();
        state.observe_head("ev1|1|1000");

        let first = state.on_ack(Some("x"));
        assert_eq!(first, AckDecision::Mismatched { invalid_acks: 1 });
        assert!(!first.pops_head());
        assert!(state.current().is_some());

        let second = state.on_ack(Some("y"));
        assert_eq!(
            second,
            AckDecision::ForceDrop {
                invalid_acks: 2,
                dropped: Some("ev1".into())
            }
        );
        assert!(second.pops_head());
        assert!(state.current().is_none());
    }

    #[test]
    fn test_ack_without_id_counts_as_invalid() {
        let mut state = DeliveryState::new();
        state.observe_head("ev1|1|1000");
        assert_eq!(state.on_ack(None), AckDecision::Mismatched { invalid_acks: 1 });
    }

    #[test]
    fn test_ack_with_nothing_in_flight_is_invalid() {
        let mut state = DeliveryState::new();
        assert_eq!(state.on_ack(Some("ev1")), AckDecision::Mismatched { invalid_acks: 1 });
        assert_eq!(
            state.on_ack(Some("ev1")),
            AckDecision::ForceDrop {
                invalid_acks: 2,
                dropped: None
            }
        );
    }

    #[test]
    fn test_invalid_count_survives_forced_drop() {
        let mut state = DeliveryState::new();
        state.on_ack(Some("a"));
        state.on_ack(Some("b"));
        // Without a match or a new head, the next stray ack drops again.
        assert!(matches!(
            state.on_ack(Some("c")),
            AckDecision::ForceDrop { invalid_acks: 3, .. }
        ));
    }

    // ========== Client Payload Tests ==========

    #[test]
    fn test_payloads_drain_in_order() {
        let mut state = DeliveryState::new();
        state.enqueue_payload(payload(1));
        state.enqueue_payload(payload(2));
        assert_eq!(state.pending_payloads(), 2);

        assert_eq!(state.next_payload(), Some(payload(1).as_str()));
        state.commit_payload();
        assert_eq!(state.next_payload(), Some(payload(2).as_str()));
        state.commit_payload();
        assert!(state.next_payload().is_none());
    }

    #[test]
    fn test_uncommitted_payload_stays_buffered() {
        let mut state = DeliveryState::new();
        state.enqueue_payload(payload(1));
        let _ = state.next_payload();
        assert_eq!(state.pending_payloads(), 1);
    }
}
