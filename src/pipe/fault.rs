//! Fault handling and reconnect backoff.
//!
//! A fault is any socket error, protocol violation, or integrity failure
//! on an established or connecting pipe. What happens next depends on the
//! policy and on whether anything is left to send:
//!
//! ```text
//!   lossy ─────────────────────────► CLOSED (notify reset)
//!   nothing queued, connecting ────► CLOSED
//!   nothing queued ────────────────► STANDBY
//!   queued, was open ──────────────► CONNECTING (connect_seq + 1)
//!   queued, connect failed ────────► CONNECTING after backoff
//!                                     (initial, then doubling to max)
//! ```

use std::time::Duration;

use super::engine::PipeInner;
use super::state::PipeState;

/// What a fault decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultOutcome {
    /// The reader hit an error while the writer is reconnecting; the reader
    /// just exits.
    ReaderExit,
    /// Already closing or closed; nothing to do.
    AlreadyClosed,
    /// Lossy pipe gave up.
    Failed,
    /// Nothing to send and nothing worth retrying.
    Closed,
    /// Nothing to send; wait for new work.
    Standby,
    /// Reconnect right away.
    Reconnect,
    /// First failed connect; reconnect right away, backoff armed.
    FirstBackoff,
    /// Wait this long before reconnecting.
    Backoff(Duration),
}

impl PipeInner {
    /// Decide how to recover from a fault. `onconnect` marks a failure of the
    /// connect handshake; `onread` a failure seen by the reader.
    pub(crate) fn fault(&mut self, onconnect: bool, onread: bool) -> FaultOutcome {
        if onread && self.state == PipeState::Connecting {
            tracing::debug!(peer = %self.peer_addr, "fault already connecting, reader shutting down");
            return FaultOutcome::ReaderExit;
        }
        if matches!(self.state, PipeState::Closed | PipeState::Closing) {
            tracing::debug!(peer = %self.peer_addr, state = %self.state, "fault already closed|closing");
            return FaultOutcome::AlreadyClosed;
        }

        self.shutdown_socket();

        if self.policy.lossy {
            tracing::debug!(peer = %self.peer_addr, "fault on lossy channel, failing");
            self.fail();
            return FaultOutcome::Failed;
        }

        let requeued = self.requeue_sent(0);
        if requeued > 0 {
            tracing::debug!(peer = %self.peer_addr, requeued, out_seq = self.seq.out_seq, "requeued unacked");
        }

        if !self.queues.is_queued() {
            if onconnect {
                tracing::debug!(peer = %self.peer_addr, "fault on connect with nothing queued, closing");
                self.state = PipeState::Closed;
                return FaultOutcome::Closed;
            }
            tracing::debug!(peer = %self.peer_addr, "fault with nothing queued, standby");
            self.state = PipeState::Standby;
            return FaultOutcome::Standby;
        }

        if self.state != PipeState::Connecting {
            self.seq.connect_seq += 1;
            self.state = PipeState::Connecting;
            self.backoff = None;
            tracing::info!(
                peer = %self.peer_addr,
                cseq = self.seq.connect_seq,
                "fault initiating reconnect"
            );
            return FaultOutcome::Reconnect;
        }

        match self.backoff {
            None => {
                self.backoff = Some(self.initial_backoff);
                tracing::info!(peer = %self.peer_addr, "fault first connect failure");
                FaultOutcome::FirstBackoff
            }
            Some(wait) => {
                self.backoff = Some((wait * 2).min(self.max_backoff));
                tracing::info!(peer = %self.peer_addr, ?wait, "fault waiting before reconnect");
                FaultOutcome::Backoff(wait)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use super::*;
    use crate::core::PRIO_HIGHEST;
    use crate::pipe::engine::Notice;
    use crate::pipe::{ConnectionIdentity, Policy, SequenceState};
    use crate::transport::{Message, PeerAddress, SocketKill};

    const INITIAL: Duration = Duration::from_millis(200);
    const MAX: Duration = Duration::from_millis(700);

    fn inner(policy: Policy, state: PipeState) -> PipeInner {
        let addr: SocketAddr = "127.0.0.1:6800".parse().unwrap();
        let identity = Arc::new(ConnectionIdentity::new(PeerAddress::new(addr, 7)));
        PipeInner::new(identity, 4, policy, state, SequenceState::starting_at(10), (INITIAL, MAX))
    }

    fn send(inner: &mut PipeInner, count: usize) {
        for _ in 0..count {
            let mut msg = Message::new(1, &b"payload"[..]);
            msg.set_seq(inner.seq.next_out());
            inner.queues.push_sent(msg);
        }
    }

    #[test]
    fn test_lossy_fails_and_notifies() {
        let mut p = inner(Policy::lossy_client(), PipeState::Open);
        let (kill, _rx) = SocketKill::new();
        p.socket = Some(kill);
        send(&mut p, 3);
        p.queues.enqueue(Message::new(2, &b"queued"[..]));

        assert_eq!(p.fault(false, false), FaultOutcome::Failed);
        assert_eq!(p.state, PipeState::Closed);
        assert_eq!(p.queues.queued_len() + p.queues.sent_len(), 0);
        assert_eq!(p.notices, vec![Notice::Reset]);
        assert!(p.socket.as_ref().unwrap().is_shutdown());
    }

    #[test]
    fn test_open_fault_requeues_and_reconnects() {
        let mut p = inner(Policy::lossless_peer(), PipeState::Open);
        send(&mut p, 3);
        assert_eq!(p.seq.out_seq, 13);

        assert_eq!(p.fault(false, false), FaultOutcome::Reconnect);
        assert_eq!(p.state, PipeState::Connecting);
        assert_eq!(p.seq.connect_seq, 1);
        assert_eq!(p.seq.out_seq, 10);
        assert_eq!(p.queues.sent_len(), 0);
        assert_eq!(p.queues.queued_len(), 3);

        p.queues.enqueue(Message::new(9, &b"later"[..]).with_priority(PRIO_HIGHEST));
        let first = p.queues.pop_next().unwrap();
        assert_eq!(first.seq(), 11);
    }

    #[test]
    fn test_idle_fault_goes_standby() {
        let mut p = inner(Policy::lossless_peer(), PipeState::Open);
        assert_eq!(p.fault(false, false), FaultOutcome::Standby);
        assert_eq!(p.state, PipeState::Standby);
        assert_eq!(p.seq.connect_seq, 0);
    }

    #[test]
    fn test_idle_connect_failure_closes() {
        let mut p = inner(Policy::lossless_peer(), PipeState::Connecting);
        assert_eq!(p.fault(true, false), FaultOutcome::Closed);
        assert_eq!(p.state, PipeState::Closed);
    }

    #[test]
    fn test_backoff_doubles_to_max() {
        let mut p = inner(Policy::lossless_peer(), PipeState::Connecting);
        p.queues.enqueue(Message::new(1, &b"x"[..]));

        assert_eq!(p.fault(true, false), FaultOutcome::FirstBackoff);
        assert_eq!(p.fault(true, false), FaultOutcome::Backoff(INITIAL));
        assert_eq!(p.fault(true, false), FaultOutcome::Backoff(INITIAL * 2));
        assert_eq!(p.fault(true, false), FaultOutcome::Backoff(MAX));
        assert_eq!(p.fault(true, false), FaultOutcome::Backoff(MAX));
        assert_eq!(p.state, PipeState::Connecting);
    }

    #[test]
    fn test_reconnect_resets_backoff() {
        let mut p = inner(Policy::lossless_peer(), PipeState::Connecting);
        p.queues.enqueue(Message::new(1, &b"x"[..]));
        p.fault(true, false);
        p.fault(true, false);
        assert!(p.backoff.is_some());

        p.state = PipeState::Open;
        assert_eq!(p.fault(false, false), FaultOutcome::Reconnect);
        assert_eq!(p.backoff, None);
    }

    #[test]
    fn test_reader_exits_while_connecting() {
        let mut p = inner(Policy::lossless_peer(), PipeState::Connecting);
        p.queues.enqueue(Message::new(1, &b"x"[..]));
        assert_eq!(p.fault(false, true), FaultOutcome::ReaderExit);
        assert_eq!(p.queues.queued_len(), 1);
    }

    #[test]
    fn test_closed_is_noop() {
        for state in [PipeState::Closed, PipeState::Closing] {
            let mut p = inner(Policy::lossy_client(), state);
            assert_eq!(p.fault(false, false), FaultOutcome::AlreadyClosed);
            assert_eq!(p.state, state);
            assert!(p.notices.is_empty());
        }
    }
}
