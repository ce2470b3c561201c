//! The pipe: one socket at a time, its protocol state, and its two tasks.
//!
//! All mutable state lives in [`PipeInner`] behind a plain mutex that is
//! never held across an `.await`. The paired [`Notify`] plays the role of
//! a condition variable: waiters register (`enable`) while still holding
//! the lock, then release it and sleep, so no wakeup is lost.
//!
//! The reader task owns the read half of the socket and delivers messages
//! to the dispatch sink; the writer task owns the write half, runs the
//! connect-side handshake, and sends acks, keepalives, and messages.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::task::JoinHandle;

use super::fault::FaultOutcome;
use super::identity::ConnectionIdentity;
use super::policy::Policy;
use super::queue::MessageQueues;
use super::state::{PipeState, SequenceState};
use crate::core::tags;
use crate::messenger::Shared;
use crate::transport::{
    Decoded, FrameDecoder, FrameEncoder, HeaderLayout, Message, PeerAddress, Signing,
    SocketKill, SocketReader, SocketWriter, TransportError, TransportResult,
};

/// Lifecycle notifications waiting to be handed to the dispatch sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notice {
    Reset,
    RemoteReset,
    Connected,
}

/// Mutable state of a pipe, guarded by the pipe lock.
#[derive(Debug)]
pub(crate) struct PipeInner {
    pub(super) peer_addr: PeerAddress,
    pub(super) peer_type: u32,
    pub(super) state: PipeState,
    pub(super) seq: SequenceState,
    pub(super) queues: MessageQueues,
    pub(super) policy: Policy,
    pub(super) identity: Arc<ConnectionIdentity>,
    pub(super) backoff: Option<Duration>,
    pub(super) initial_backoff: Duration,
    pub(super) max_backoff: Duration,
    pub(super) keepalive: bool,
    pub(super) close_on_empty: bool,
    pub(super) reader_running: bool,
    pub(super) writer_running: bool,
    pub(super) reader_task: Option<JoinHandle<()>>,
    pub(super) socket: Option<SocketKill>,
    pub(super) notices: Vec<Notice>,
}

impl PipeInner {
    pub(super) fn new(
        identity: Arc<ConnectionIdentity>,
        peer_type: u32,
        policy: Policy,
        state: PipeState,
        seq: SequenceState,
        backoff: (Duration, Duration),
    ) -> Self {
        Self {
            peer_addr: identity.peer_addr(),
            peer_type,
            state,
            seq,
            queues: MessageQueues::new(),
            policy,
            identity,
            backoff: None,
            initial_backoff: backoff.0,
            max_backoff: backoff.1,
            keepalive: false,
            close_on_empty: false,
            reader_running: false,
            writer_running: false,
            reader_task: None,
            socket: None,
            notices: Vec::new(),
        }
    }

    pub(super) fn shutdown_socket(&mut self) {
        if let Some(kill) = &self.socket {
            kill.shutdown();
        }
    }

    /// Move to `CLOSED` and abort any socket I/O in flight.
    pub(super) fn stop(&mut self) {
        tracing::debug!(peer = %self.peer_addr, state = %self.state, "stop");
        self.state = PipeState::Closed;
        self.shutdown_socket();
    }

    pub(super) fn discard_queue(&mut self) {
        let dropped = self.queues.discard();
        if dropped > 0 {
            tracing::debug!(peer = %self.peer_addr, dropped, "discarded queued messages");
        }
    }

    /// Give up on a lossy connection.
    pub(super) fn fail(&mut self) {
        tracing::debug!(peer = %self.peer_addr, "fail");
        self.stop();
        self.discard_queue();
        self.notices.push(Notice::Reset);
    }

    /// The peer lost our session: start over from scratch.
    pub(super) fn was_session_reset(&mut self, new_out_seq: u64) {
        tracing::info!(
            peer = %self.peer_addr,
            cseq = self.seq.connect_seq,
            in_seq = self.seq.in_seq,
            "session reset"
        );
        self.discard_queue();
        self.notices.push(Notice::RemoteReset);
        self.seq.out_seq = new_out_seq;
        self.seq.in_seq = 0;
        self.seq.in_seq_acked = 0;
        self.seq.connect_seq = 0;
    }

    pub(super) fn requeue_sent(&mut self, max_acked: u64) -> usize {
        self.queues.requeue_sent(max_acked, &mut self.seq.out_seq)
    }

    /// Trim the sent list. Returns `true` if that closed the pipe.
    pub(super) fn handle_ack(&mut self, seq: u64) -> bool {
        let trimmed = self.queues.handle_ack(seq);
        tracing::trace!(peer = %self.peer_addr, seq, trimmed, "got ack");
        if self.close_on_empty && self.queues.sent_len() == 0 && !self.queues.is_queued() {
            tracing::debug!(peer = %self.peer_addr, "got last ack, closing");
            self.stop();
            return true;
        }
        false
    }
}

/// Snapshot of a pipe's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    /// Current state.
    pub state: PipeState,
    /// Sequence counters.
    pub seq: SequenceState,
    /// Messages waiting to be sent.
    pub queued: usize,
    /// Messages sent but not yet acknowledged.
    pub unacked: usize,
    /// Whether the peer policy is lossy.
    pub lossy: bool,
}

enum WriterStep<'a> {
    Connect,
    Close,
    Keepalive,
    Ack(u64),
    Send(Message, Arc<ConnectionIdentity>),
    Again,
    Wait(Pin<Box<Notified<'a>>>),
}

/// One connection endpoint to a peer.
pub struct Pipe {
    shared: Arc<Shared>,
    peer_addr: PeerAddress,
    inner: Mutex<PipeInner>,
    cond: Notify,
}

impl Pipe {
    fn with_inner(shared: &Arc<Shared>, inner: PipeInner) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::clone(shared),
            peer_addr: inner.peer_addr,
            inner: Mutex::new(inner),
            cond: Notify::new(),
        })
    }

    /// A pipe that will connect out to `identity`'s address.
    pub(crate) fn outgoing(
        shared: &Arc<Shared>,
        identity: Arc<ConnectionIdentity>,
        peer_type: u32,
    ) -> Arc<Self> {
        let policy = shared.policy_for(peer_type);
        let seq = SequenceState::starting_at(shared.initial_out_seq());
        identity.set_peer_type(peer_type);
        let backoff = (shared.config.initial_backoff, shared.config.max_backoff);
        let inner = PipeInner::new(identity, peer_type, policy, PipeState::Connecting, seq, backoff);
        Self::with_inner(shared, inner)
    }

    /// A pipe for a peer that connected to us.
    pub(crate) fn accepted(
        shared: &Arc<Shared>,
        identity: Arc<ConnectionIdentity>,
        peer_type: u32,
        policy: Policy,
        seq: SequenceState,
        queues: MessageQueues,
        socket: Option<SocketKill>,
    ) -> Arc<Self> {
        let backoff = (shared.config.initial_backoff, shared.config.max_backoff);
        let mut inner = PipeInner::new(identity, peer_type, policy, PipeState::Accepting, seq, backoff);
        inner.queues = queues;
        inner.socket = socket;
        Self::with_inner(shared, inner)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PipeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Wake every task waiting on this pipe.
    pub(crate) fn signal(&self) {
        self.cond.notify_waiters();
    }

    /// A wakeup registration; create it while holding the pipe lock.
    pub(super) fn notified(&self) -> Pin<Box<Notified<'_>>> {
        let mut notified = Box::pin(self.cond.notified());
        notified.as_mut().enable();
        notified
    }

    /// Peer address.
    pub fn peer_addr(&self) -> PeerAddress {
        self.peer_addr
    }

    /// Current state.
    pub fn state(&self) -> PipeState {
        self.lock().state
    }

    /// Identity this pipe carries.
    pub fn identity(&self) -> Arc<ConnectionIdentity> {
        Arc::clone(&self.lock().identity)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PipeStats {
        let inner = self.lock();
        PipeStats {
            state: inner.state,
            seq: inner.seq,
            queued: inner.queues.queued_len(),
            unacked: inner.queues.sent_len(),
            lossy: inner.policy.lossy,
        }
    }

    /// Queue a message. Hands it back if the pipe is already closed.
    pub(crate) fn submit(&self, msg: Message) -> Result<(), Message> {
        let mut inner = self.lock();
        if inner.state.is_closed() {
            return Err(msg);
        }
        tracing::trace!(peer = %self.peer_addr, %msg, "queue");
        inner.queues.enqueue(msg);
        self.signal();
        Ok(())
    }

    /// Ask the writer to send a keepalive.
    pub(crate) fn request_keepalive(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_closed() {
            return false;
        }
        inner.keepalive = true;
        self.signal();
        true
    }

    /// Close once every queued message has been acknowledged.
    ///
    /// Returns `true` if the pipe stopped right away.
    pub(crate) fn close_on_empty(&self) -> bool {
        let mut inner = self.lock();
        let idle = !inner.queues.is_queued() && inner.queues.sent_len() == 0;
        if idle {
            inner.stop();
        } else {
            inner.close_on_empty = true;
        }
        self.signal();
        idle
    }

    /// Stop immediately and drop everything queued.
    pub(crate) fn mark_down(&self) {
        let mut inner = self.lock();
        inner.stop();
        inner.discard_queue();
        self.signal();
    }

    /// Stop immediately.
    pub(crate) fn stop(&self) {
        self.lock().stop();
        self.signal();
    }

    /// Abort the current socket; the usual fault handling follows.
    pub(crate) fn reset_socket(&self) {
        self.lock().shutdown_socket();
    }

    /// Start the writer of a fresh outgoing pipe, optionally with a first
    /// message already queued.
    pub(crate) fn launch(self: &Arc<Self>, first: Option<Message>) {
        let mut inner = self.lock();
        if let Some(msg) = first {
            inner.queues.enqueue(msg);
        }
        self.start_writer(&mut inner, None);
    }

    pub(super) fn start_reader(self: &Arc<Self>, inner: &mut PipeInner, sock: SocketReader) {
        inner.reader_running = true;
        let pipe = Arc::clone(self);
        inner.reader_task = Some(tokio::spawn(pipe.run_reader(sock)));
    }

    pub(super) fn start_writer(self: &Arc<Self>, inner: &mut PipeInner, sock: Option<SocketWriter>) {
        inner.writer_running = true;
        let pipe = Arc::clone(self);
        tokio::spawn(pipe.run_writer(sock));
    }

    /// Hand pending lifecycle notifications to the sink, outside the lock.
    pub(crate) fn flush_notices(&self) {
        let (notices, identity) = {
            let mut inner = self.lock();
            if inner.notices.is_empty() {
                return;
            }
            (std::mem::take(&mut inner.notices), Arc::clone(&inner.identity))
        };
        let sink = &self.shared.sink;
        for notice in notices {
            match notice {
                Notice::Reset => sink.notify_reset(&identity),
                Notice::RemoteReset => sink.notify_remote_reset(&identity),
                Notice::Connected => sink.notify_connected(&identity),
            }
        }
    }

    /// Run fault handling, waiting out the backoff if one is due.
    pub(super) async fn fault(&self, onconnect: bool, onread: bool) -> FaultOutcome {
        let (outcome, wake) = {
            let mut inner = self.lock();
            self.signal();
            let outcome = inner.fault(onconnect, onread);
            let wake = matches!(outcome, FaultOutcome::Backoff(_)).then(|| self.notified());
            (outcome, wake)
        };
        self.flush_notices();
        if let (FaultOutcome::Backoff(wait), Some(wake)) = (outcome, wake) {
            let woke = tokio::time::timeout(wait, wake).await.is_ok();
            tracing::debug!(peer = %self.peer_addr, ?wait, woke, "backoff over");
        }
        outcome
    }

    fn signing<'a>(
        &'a self,
        secret: Option<&'a crate::core::SessionSecret>,
    ) -> Option<Signing<'a>> {
        match (secret, self.shared.crypto.as_deref()) {
            (Some(secret), Some(crypto)) => Some(Signing { crypto, secret }),
            _ => None,
        }
    }

    async fn run_reader(self: Arc<Self>, mut sock: SocketReader) {
        loop {
            let wait = {
                let inner = self.lock();
                if matches!(inner.state, PipeState::Closed | PipeState::Connecting) {
                    break;
                }
                (inner.state == PipeState::Standby).then(|| self.notified())
            };
            if let Some(wait) = wait {
                tracing::trace!(peer = %self.peer_addr, "reader sleeping during standby");
                wait.await;
                continue;
            }

            let tag = match sock.read_u8().await {
                Ok(tag) => tag,
                Err(e) => {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "reader couldn't read tag");
                    self.fault(false, true).await;
                    continue;
                }
            };

            match tag {
                tags::KEEPALIVE => {
                    tracing::trace!(peer = %self.peer_addr, "reader got KEEPALIVE");
                }
                tags::ACK => match sock.read_le64().await {
                    Ok(seq) => {
                        let closed = {
                            let mut inner = self.lock();
                            !inner.state.is_closed() && inner.handle_ack(seq)
                        };
                        if closed {
                            self.signal();
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %self.peer_addr, error = %e, "reader couldn't read ack seq");
                        self.fault(false, true).await;
                    }
                },
                tags::MSG => self.read_one(&mut sock).await,
                tags::CLOSE => {
                    tracing::debug!(peer = %self.peer_addr, "reader got CLOSE");
                    let mut inner = self.lock();
                    inner.state = if inner.state == PipeState::Closing {
                        PipeState::Closed
                    } else {
                        PipeState::Closing
                    };
                    self.signal();
                    break;
                }
                other => {
                    tracing::warn!(peer = %self.peer_addr, tag = other, "reader bad tag");
                    self.fault(false, true).await;
                }
            }
        }

        let reap = {
            let mut inner = self.lock();
            inner.reader_running = false;
            let reap = !inner.writer_running;
            if reap {
                inner.shutdown_socket();
            }
            reap
        };
        self.flush_notices();
        if reap {
            self.reap();
        }
        tracing::debug!(peer = %self.peer_addr, "reader done");
    }

    async fn read_one(&self, sock: &mut SocketReader) {
        let (identity, policy_throttle) = {
            let inner = self.lock();
            (Arc::clone(&inner.identity), inner.policy.throttle.clone())
        };
        let secret = identity.signing_secret();
        let decoder = FrameDecoder {
            layout: HeaderLayout::for_features(identity.features()),
            signing: self.signing(secret.as_ref()),
            rx_buffers: Some(identity.rx_buffers()),
            policy_throttle: policy_throttle.as_ref(),
            dispatch_throttle: Some(&self.shared.dispatch_throttle),
        };

        let mut msg = match decoder.read_message(sock).await {
            Ok(Decoded::Message(msg)) => msg,
            Ok(Decoded::Aborted) => return,
            Err(e) => {
                if e.is_integrity_failure() {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "rejecting corrupt message");
                } else {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "reader couldn't read message");
                }
                self.fault(false, true).await;
                return;
            }
        };

        let size = msg.payload_len();
        let deliver = {
            let mut inner = self.lock();
            if matches!(inner.state, PipeState::Closed | PipeState::Connecting) {
                None
            } else if !inner.seq.accept_incoming(msg.seq()) {
                tracing::info!(
                    peer = %self.peer_addr,
                    seq = msg.seq(),
                    in_seq = inner.seq.in_seq,
                    "reader got old message, discarding"
                );
                None
            } else {
                msg.set_connection(Arc::clone(&inner.identity));
                // Wake the writer so it acks.
                self.signal();
                Some(msg)
            }
        };

        if let Some(msg) = deliver {
            tracing::debug!(peer = %self.peer_addr, %msg, "reader got message");
            let priority = msg.priority;
            self.shared.sink.deliver(msg, priority);
        }
        if size > 0 {
            self.shared.dispatch_throttle.release(size);
        }
    }

    fn encode(&self, msg: &Message, identity: &ConnectionIdentity) -> Vec<u8> {
        let secret = identity.signing_secret();
        FrameEncoder {
            layout: HeaderLayout::for_features(identity.features()),
            own_addr: self.shared.my_addr(),
            crc: self.shared.config.crc,
            signing: self.signing(secret.as_ref()),
        }
        .encode(msg)
    }

    async fn run_writer(self: Arc<Self>, mut sock: Option<SocketWriter>) {
        loop {
            let step = {
                let mut inner = self.lock();
                if inner.state.is_closed() {
                    break;
                }
                tracing::trace!(peer = %self.peer_addr, state = %inner.state, "writer");

                if inner.queues.is_queued() && inner.state == PipeState::Standby && !inner.policy.server {
                    inner.seq.connect_seq += 1;
                    inner.state = PipeState::Connecting;
                }
                if inner.state == PipeState::Connecting && inner.policy.server {
                    inner.state = PipeState::Standby;
                }

                if inner.state == PipeState::Connecting {
                    WriterStep::Connect
                } else if inner.state == PipeState::Closing {
                    inner.state = PipeState::Closed;
                    WriterStep::Close
                } else if inner.state.can_write() && inner.keepalive {
                    WriterStep::Keepalive
                } else if let Some(seq) = inner.seq.ack_due().filter(|_| inner.state.can_write()) {
                    WriterStep::Ack(seq)
                } else if inner.state.can_write() && inner.queues.is_queued() {
                    match inner.queues.pop_next() {
                        Some(mut msg) => {
                            msg.set_seq(inner.seq.next_out());
                            if !inner.policy.lossy || inner.close_on_empty {
                                inner.queues.push_sent(msg.clone());
                            }
                            WriterStep::Send(msg, Arc::clone(&inner.identity))
                        }
                        None => WriterStep::Again,
                    }
                } else if inner.close_on_empty
                    && inner.queues.sent_len() == 0
                    && !inner.queues.is_queued()
                {
                    tracing::debug!(peer = %self.peer_addr, "writer out and sent queues empty, closing");
                    inner.stop();
                    WriterStep::Again
                } else {
                    WriterStep::Wait(self.notified())
                }
            };

            match step {
                WriterStep::Connect => self.connect(&mut sock).await,
                WriterStep::Close => {
                    tracing::debug!(peer = %self.peer_addr, "writer writing CLOSE tag");
                    if let Some(w) = sock.as_mut() {
                        // Best effort; the peer may already be gone.
                        let _ = w.write_tag(tags::CLOSE).await;
                    }
                }
                WriterStep::Keepalive => {
                    tracing::trace!(peer = %self.peer_addr, "write keepalive");
                    match write_to(&mut sock, &[tags::KEEPALIVE]).await {
                        Ok(()) => self.lock().keepalive = false,
                        Err(e) => {
                            tracing::debug!(peer = %self.peer_addr, error = %e, "writer couldn't write keepalive");
                            self.fault(false, false).await;
                        }
                    }
                }
                WriterStep::Ack(seq) => {
                    tracing::trace!(peer = %self.peer_addr, seq, "write ack");
                    let mut frame = [0u8; 9];
                    frame[0] = tags::ACK;
                    frame[1..].copy_from_slice(&seq.to_le_bytes());
                    match write_to(&mut sock, &frame).await {
                        Ok(()) => self.lock().seq.mark_acked(seq),
                        Err(e) => {
                            tracing::debug!(peer = %self.peer_addr, error = %e, "writer couldn't write ack");
                            self.fault(false, false).await;
                        }
                    }
                }
                WriterStep::Send(msg, identity) => {
                    let frame = self.encode(&msg, &identity);
                    tracing::trace!(peer = %self.peer_addr, %msg, bytes = frame.len(), "writer sending");
                    if let Err(e) = write_to(&mut sock, &frame).await {
                        tracing::info!(peer = %self.peer_addr, seq = msg.seq(), error = %e, "writer error sending");
                        self.fault(false, false).await;
                    }
                }
                WriterStep::Again => {}
                WriterStep::Wait(wait) => {
                    tracing::trace!(peer = %self.peer_addr, "writer sleeping");
                    wait.await;
                }
            }
        }

        let reap = {
            let mut inner = self.lock();
            inner.writer_running = false;
            let reap = !inner.reader_running;
            if reap {
                inner.shutdown_socket();
            }
            reap
        };
        self.flush_notices();
        if reap {
            self.reap();
        }
        tracing::debug!(peer = %self.peer_addr, "writer done");
    }

    /// Release a pipe whose reader and writer have both exited.
    fn reap(self: &Arc<Self>) {
        let unregistered = self.shared.registry().unregister(self);
        let identity = {
            let mut inner = self.lock();
            inner.shutdown_socket();
            inner.socket = None;
            inner.reader_task = None;
            inner.discard_queue();
            Arc::clone(&inner.identity)
        };
        identity.clear_pipe(self);
        tracing::debug!(peer = %self.peer_addr, unregistered, "reaped");
    }
}

async fn write_to(sock: &mut Option<SocketWriter>, bytes: &[u8]) -> TransportResult<()> {
    match sock {
        Some(w) => w.write_all(bytes).await,
        None => Err(TransportError::Closed),
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
