//! Outbound priority queue and the sent-but-unacknowledged list.

use std::collections::{BTreeMap, VecDeque};

use crate::core::PRIO_HIGHEST;
use crate::transport::Message;

/// Pending and in-flight messages of one pipe.
///
/// Outbound messages are kept per priority and drained highest first,
/// FIFO within a priority. Transmitted messages move to the sent list,
/// ordered by sequence, until the peer acknowledges them.
#[derive(Debug, Default)]
pub struct MessageQueues {
    out: BTreeMap<u8, VecDeque<Message>>,
    sent: VecDeque<Message>,
}

impl MessageQueues {
    /// Create empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message at its own priority.
    pub fn enqueue(&mut self, msg: Message) {
        self.out.entry(msg.priority).or_default().push_back(msg);
    }

    /// Whether any outbound message is waiting.
    pub fn is_queued(&self) -> bool {
        !self.out.is_empty()
    }

    /// Number of outbound messages waiting.
    pub fn queued_len(&self) -> usize {
        self.out.values().map(VecDeque::len).sum()
    }

    /// Number of unacknowledged messages.
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Take the next message to transmit.
    pub fn pop_next(&mut self) -> Option<Message> {
        let mut entry = self.out.last_entry()?;
        let msg = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        msg
    }

    /// Remember a transmitted message until it is acknowledged.
    pub fn push_sent(&mut self, msg: Message) {
        self.sent.push_back(msg);
    }

    /// Trim every sent message with sequence `<= seq`.
    ///
    /// Acks are cumulative; repeating one is a no-op. Returns the number of
    /// messages trimmed.
    pub fn handle_ack(&mut self, seq: u64) -> usize {
        let mut trimmed = 0;
        while self.sent.front().is_some_and(|m| m.seq() <= seq) {
            self.sent.pop_front();
            trimmed += 1;
        }
        trimmed
    }

    /// Move sent messages newer than `max_acked` back to the head of the
    /// highest-priority queue, in ascending sequence order.
    ///
    /// `out_seq` is lowered by one per requeued message so they are
    /// renumbered contiguously on retransmission. Anything at or below
    /// `max_acked` is dropped.
    pub fn requeue_sent(&mut self, max_acked: u64, out_seq: &mut u64) -> usize {
        let mut requeued = 0;
        if self.sent.is_empty() {
            return 0;
        }
        let rq = self.out.entry(PRIO_HIGHEST).or_default();
        while let Some(msg) = self.sent.pop_back() {
            if msg.seq() > max_acked {
                tracing::trace!(seq = msg.seq(), out_seq = *out_seq, "requeue for resend");
                rq.push_front(msg);
                *out_seq = out_seq.saturating_sub(1);
                requeued += 1;
            } else {
                self.sent.clear();
            }
        }
        if rq.is_empty() {
            self.out.remove(&PRIO_HIGHEST);
        }
        requeued
    }

    /// Drop requeued messages the peer already has.
    ///
    /// Looks at the head of the highest-priority queue for previously
    /// transmitted messages with sequence `<= acked`. Returns how many were
    /// dropped; the caller advances `out_seq` by the same amount.
    pub fn trim_requeued(&mut self, acked: u64) -> usize {
        let Some(rq) = self.out.get_mut(&PRIO_HIGHEST) else {
            return 0;
        };
        let mut dropped = 0;
        while rq.front().is_some_and(|m| m.seq() != 0 && m.seq() <= acked) {
            rq.pop_front();
            dropped += 1;
        }
        if rq.is_empty() {
            self.out.remove(&PRIO_HIGHEST);
        }
        dropped
    }

    /// Move every outbound message of `other` to the head of our queues,
    /// priority by priority, ahead of what we already hold.
    pub fn splice_front(&mut self, other: &mut MessageQueues) {
        for (prio, mut theirs) in std::mem::take(&mut other.out) {
            let ours = self.out.entry(prio).or_default();
            theirs.append(ours);
            *ours = theirs;
        }
    }

    /// Drop everything. Returns the number of messages discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.queued_len() + self.sent.len();
        self.out.clear();
        self.sent.clear();
        dropped
    }
}
