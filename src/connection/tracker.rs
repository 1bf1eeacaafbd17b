//! Message reliability tracking.
//!
//! Owns every outbound message that is not yet safely delivered, plus the
//! set of recently seen inbound IDs.
//!
//! # Message Placement
//!
//! A [`MessageState`] is always in exactly one place:
//!
//! | Place | Meaning |
//! |-------|---------|
//! | pending queue | Not written yet, or written on a connection that broke |
//! | sent table | Written with `ack_required`, waiting for `ack` |
//! | nowhere | Acknowledged, sent without ack, expired or discarded |
//!
//! Both the queue and a flush batch are ordered by enqueue sequence, so
//! resends keep the original relative order.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, to_string};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;
use crate::protocol::stamp_outbound;

use super::config::ReconnectionConfig;

// ============================================================================
// Constants
// ============================================================================

/// Inbound IDs remembered before the dedup set is pruned.
pub const DEDUP_CAPACITY: usize = 10_000;

/// Most recent inbound IDs kept after a prune.
pub const DEDUP_RETAIN: usize = 5_000;

// ============================================================================
// MessageState
// ============================================================================

/// An outbound message and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageState {
    /// Unique message ID (also present in `content`).
    pub message_id: MessageId,

    /// The JSON object written to the wire.
    pub content: Value,

    /// When `send()` was called.
    pub timestamp: DateTime<Utc>,

    /// Whether the receiver must acknowledge.
    pub ack_required: bool,

    /// Set once an `ack` arrived.
    pub acknowledged: bool,

    /// Times the message was put back for another attempt.
    pub retry_count: u32,

    /// Enqueue order within the owning tracker.
    sequence: u64,
}

impl MessageState {
    /// Returns the enqueue sequence number.
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns `true` if the message is older than `retention` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        // Timestamps in the future count as fresh
        (now - self.timestamp)
            .to_std()
            .is_ok_and(|age| age > retention)
    }

    /// Serializes the content to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(to_string(&self.content)?)
    }
}

// ============================================================================
// DedupSet
// ============================================================================

/// Insertion-ordered set of recently seen inbound IDs.
///
/// Pruning is approximate: after a prune, an ID older than the retained
/// window is accepted again.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: FxHashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl DedupSet {
    /// Records `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());

        if self.order.len() > DEDUP_CAPACITY {
            let excess = self.order.len() - DEDUP_RETAIN;
            for old in self.order.drain(..excess) {
                self.seen.remove(&old);
            }
            debug!(pruned = excess, retained = self.order.len(), "Pruned dedup set");
        }

        true
    }

    /// Returns `true` if `id` is remembered.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Returns the number of remembered IDs.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns `true` if nothing is remembered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ============================================================================
// MessageTracker
// ============================================================================

/// Pending queue, sent-awaiting-ack table and inbound dedup set.
///
/// Not synchronized; the owning connection wraps it in a lock.
#[derive(Debug)]
pub struct MessageTracker {
    max_pending: usize,
    retention: Duration,
    next_sequence: u64,
    pending: VecDeque<MessageState>,
    sent: FxHashMap<MessageId, MessageState>,
    received: DedupSet,
}

impl MessageTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(max_pending: usize, retention: Duration) -> Self {
        Self {
            max_pending,
            retention,
            next_sequence: 0,
            pending: VecDeque::new(),
            sent: FxHashMap::default(),
            received: DedupSet::default(),
        }
    }

    /// Creates an empty tracker with limits from `config`.
    #[must_use]
    pub fn from_config(config: &ReconnectionConfig) -> Self {
        Self::new(config.max_pending_messages, config.message_retention)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Wraps outbound content in a new [`MessageState`].
    ///
    /// Assigns an `id` if the object has none. The message is not tracked
    /// until it is enqueued or marked in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if `content` is not a JSON object.
    pub fn prepare(&mut self, content: Value, ack_required: bool) -> Result<MessageState> {
        let (message_id, content) = stamp_outbound(content, ack_required)?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Ok(MessageState {
            message_id,
            content,
            timestamp: Utc::now(),
            ack_required,
            acknowledged: false,
            retry_count: 0,
            sequence,
        })
    }

    /// Appends a new message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if the queue is full; the message is
    /// dropped.
    pub fn enqueue(&mut self, message: MessageState) -> Result<()> {
        if self.pending.len() >= self.max_pending {
            warn!(
                message_id = %message.message_id,
                limit = self.max_pending,
                "Pending queue full, dropping message"
            );
            return Err(Error::capacity(self.max_pending));
        }
        self.insert_ordered(message);
        Ok(())
    }

    /// Puts a message back after a failed write.
    ///
    /// Ignores the queue limit: the message was already accepted once.
    /// `retry_count` is left as is; only a reconnect flush counts a retry.
    pub fn requeue(&mut self, message: MessageState) {
        self.insert_ordered(message);
    }

    /// Puts back a batch that was never attempted.
    pub fn restore(&mut self, messages: impl IntoIterator<Item = MessageState>) {
        for message in messages {
            self.insert_ordered(message);
        }
    }

    /// Records a message about to be written.
    ///
    /// Only `ack_required` messages are kept, so an `ack` racing the write
    /// still finds its entry.
    pub fn mark_in_flight(&mut self, message: &MessageState) {
        if message.ack_required {
            self.sent
                .insert(message.message_id.clone(), message.clone());
        }
    }

    /// Forgets an in-flight entry whose write failed.
    pub fn clear_in_flight(&mut self, id: &MessageId) {
        self.sent.remove(id);
    }

    /// Handles an inbound `ack`.
    ///
    /// Returns the acknowledged message, or `None` for an unknown ID.
    pub fn acknowledge(&mut self, id: &MessageId) -> Option<MessageState> {
        self.sent.remove(id).map(|mut message| {
            message.acknowledged = true;
            message
        })
    }

    /// Takes everything to resend after a successful connect.
    ///
    /// With `preserve`, expired entries are dropped and the remaining
    /// pending and unacknowledged messages are returned in enqueue order.
    /// Without it, unsent messages are discarded and the batch is empty.
    /// Unacknowledged entries stay tracked so a late `ack` still clears them.
    pub fn drain_for_flush(&mut self, preserve: bool, now: DateTime<Utc>) -> Vec<MessageState> {
        if !preserve {
            self.prune_expired(now);
            let discarded = self.pending.len();
            self.pending.clear();
            if discarded > 0 {
                debug!(discarded, "Discarded undelivered messages on reconnect");
            }
            return Vec::new();
        }

        self.prune_expired(now);

        let mut batch: Vec<_> = self.pending.drain(..).collect();
        batch.extend(self.sent.drain().map(|(_, mut message)| {
            message.retry_count += 1;
            message
        }));
        batch.sort_by_key(MessageState::sequence);
        batch
    }

    /// Drops pending and unacknowledged messages older than the retention.
    ///
    /// Returns the number of messages dropped.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let retention = self.retention;
        let before = self.pending.len() + self.sent.len();

        self.pending.retain(|m| !m.is_expired(now, retention));
        self.sent.retain(|_, m| !m.is_expired(now, retention));

        let expired = before - (self.pending.len() + self.sent.len());
        if expired > 0 {
            warn!(expired, "Dropped messages past retention");
        }
        expired
    }

    fn insert_ordered(&mut self, message: MessageState) {
        let index = self
            .pending
            .partition_point(|m| m.sequence < message.sequence);
        self.pending.insert(index, message);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Records an inbound ID. Returns `false` for a duplicate.
    pub fn record_received(&mut self, id: &MessageId) -> bool {
        self.received.insert(id)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the number of queued messages.
    #[inline]
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of messages awaiting `ack`.
    #[inline]
    #[must_use]
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Returns the number of remembered inbound IDs.
    #[inline]
    #[must_use]
    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    /// Returns the IDs of queued messages in send order.
    #[cfg(test)]
    fn pending_ids(&self) -> Vec<MessageId> {
        self.pending.iter().map(|m| m.message_id.clone()).collect()
    }

    /// Returns `true` if `id` is waiting for an `ack`.
    #[cfg(test)]
    fn is_awaiting_ack(&self, id: &MessageId) -> bool {
        self.sent.contains_key(id)
    }
}

// ============================================================================
// Tests
// ============================================================================
