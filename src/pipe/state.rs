//! Pipe lifecycle states and sequence counters.

use std::fmt;

/// Lifecycle state of a pipe.
///
/// ```text
///  ACCEPTING ──► OPEN ◄──► CONNECTING ──► WAIT
///                 │  ▲         │
///                 ▼  │         ▼
///              STANDBY      CLOSING ──► CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeState {
    /// Running the accept-side handshake.
    Accepting,
    /// Running (or about to run) the connect-side handshake.
    Connecting,
    /// Handshake done, reader and writer active.
    Open,
    /// Idle after a fault; reconnects when new work is queued.
    Standby,
    /// Lost a connection race; the peer will connect to us.
    Wait,
    /// Peer asked to close, or we are about to send `CLOSE`.
    Closing,
    /// Terminal.
    Closed,
}

impl PipeState {
    /// Whether the pipe will never carry traffic again.
    pub fn is_closed(self) -> bool {
        self == PipeState::Closed
    }

    /// Whether the writer may put frames on the socket.
    pub fn can_write(self) -> bool {
        !matches!(
            self,
            PipeState::Connecting | PipeState::Wait | PipeState::Standby | PipeState::Closed
        )
    }
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipeState::Accepting => "ACCEPTING",
            PipeState::Connecting => "CONNECTING",
            PipeState::Open => "OPEN",
            PipeState::Standby => "STANDBY",
            PipeState::Wait => "WAIT",
            PipeState::Closing => "CLOSING",
            PipeState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Sequence counters of one pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    /// Attempt counter, bumped on every reconnect.
    pub connect_seq: u32,
    /// Last global sequence seen from the peer.
    pub peer_global_seq: u32,
    /// Last sequence assigned to an outbound message.
    pub out_seq: u64,
    /// Last sequence accepted from the peer.
    pub in_seq: u64,
    /// Last `in_seq` acknowledged to the peer.
    pub in_seq_acked: u64,
}

impl SequenceState {
    /// Counters starting from `out_seq`.
    pub fn starting_at(out_seq: u64) -> Self {
        Self {
            out_seq,
            ..Default::default()
        }
    }

    /// Assign the next outbound sequence number.
    pub fn next_out(&mut self) -> u64 {
        self.out_seq += 1;
        self.out_seq
    }

    /// Record an inbound sequence number.
    ///
    /// Returns `false` for a stale or duplicate message, which must be
    /// dropped. `in_seq` never decreases; gaps are allowed.
    pub fn accept_incoming(&mut self, seq: u64) -> bool {
        if seq <= self.in_seq {
            return false;
        }
        self.in_seq = seq;
        true
    }

    /// Sequence to acknowledge, if anything arrived since the last ack.
    pub fn ack_due(&self) -> Option<u64> {
        (self.in_seq > self.in_seq_acked).then_some(self.in_seq)
    }

    /// Record that `seq` was acknowledged to the peer.
    pub fn mark_acked(&mut self, seq: u64) {
        self.in_seq_acked = self.in_seq_acked.max(seq);
    }
}
