//! Connect-side and accept-side handshakes.
//!
//! ```text
//!   connector                                  acceptor
//!       |  <────────── banner, acceptor addr, connector addr as seen
//!       |  banner, connector addr ──────────►
//!       |  ConnectRequest + authorizer ─────►
//!       |  <───────────── ConnectReply + authorizer reply
//!       |        (RETRY_* / RESETSESSION / BADAUTHORIZER: send again)
//!       |        (SEQ: acceptor's in_seq ◄──, connector's in_seq ──►)
//!       v                                      v
//!     OPEN                                   OPEN
//! ```
//!
//! When the acceptor already has a pipe for the connecting address, the
//! race table in [`resolve_existing`] decides who wins.

use std::sync::Arc;

use tokio::net::TcpStream;

use super::error::{HandshakeError, HandshakeResult};
use super::engine::{Notice, Pipe, PipeInner};
use super::policy::Policy;
use super::queue::MessageQueues;
use super::state::{PipeState, SequenceState};
use crate::core::{
    AuthVerdict, BANNER, BANNER_LEN, CONNECT_FLAG_LOSSY, MAX_AUTHORIZER_LEN, features, tags,
};
use crate::messenger::{Registry, Shared};
use crate::transport::{
    ADDR_WIRE_SIZE, CONNECT_REPLY_SIZE, CONNECT_REQUEST_SIZE, ConnectReply, ConnectRequest,
    PeerAddress, SocketKill, SocketReader, SocketWriter, TransportError, split_stream,
};

/// The parts of an existing pipe the race table looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExistingView {
    pub peer_global_seq: u32,
    pub connect_seq: u32,
    pub lossy: bool,
    pub server: bool,
    pub state: PipeState,
}

impl ExistingView {
    fn of(inner: &PipeInner) -> Self {
        Self {
            peer_global_seq: inner.seq.peer_global_seq,
            connect_seq: inner.seq.connect_seq,
            lossy: inner.policy.lossy,
            server: inner.policy.server,
            state: inner.state,
        }
    }
}

/// How an incoming connect attempt relates to an existing pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RaceOutcome {
    /// Peer must retry with a global sequence above this one.
    RetryGlobal(u32),
    /// Peer must retry with this connect sequence.
    RetrySession(u32),
    /// Our own outgoing attempt wins; peer waits for it.
    Wait,
    /// We lost the session the peer is trying to resume.
    ResetSession,
    /// Incoming attempt takes over the existing pipe.
    Replace {
        /// Reset the existing session first (peer restarted, or the
        /// existing pipe is lossy and its queue is dropped).
        reset_session: bool,
    },
}

/// Resolve a connect attempt against an existing pipe for the same address.
///
/// `peer_is_lower` breaks ties between simultaneous connects: the lower
/// address wins.
pub(crate) fn resolve_existing(
    connect: &ConnectRequest,
    existing: &ExistingView,
    peer_is_lower: bool,
) -> RaceOutcome {
    if connect.global_seq < existing.peer_global_seq {
        return RaceOutcome::RetryGlobal(existing.peer_global_seq);
    }
    if existing.lossy {
        return RaceOutcome::Replace { reset_session: true };
    }
    if connect.connect_seq < existing.connect_seq {
        if connect.connect_seq == 0 {
            return RaceOutcome::Replace { reset_session: true };
        }
        return RaceOutcome::RetrySession(existing.connect_seq);
    }
    if connect.connect_seq == existing.connect_seq {
        if peer_is_lower || existing.server || existing.state == PipeState::Standby {
            return RaceOutcome::Replace { reset_session: false };
        }
        return RaceOutcome::Wait;
    }
    if existing.connect_seq == 0 {
        return RaceOutcome::ResetSession;
    }
    RaceOutcome::Replace { reset_session: false }
}

// =============================================================================
// ACCEPT
// =============================================================================

struct Opened {
    pipe: Arc<Pipe>,
    reply: ConnectReply,
    replaced: Option<Arc<Pipe>>,
    existing_seq: Option<u64>,
}

enum Admission {
    Reply(ConnectReply),
    Opened(Opened),
}

struct Carried {
    in_seq: u64,
    out_seq: u64,
    queues: MessageQueues,
}

async fn send_reply(
    writer: &mut SocketWriter,
    mut reply: ConnectReply,
    authorizer_reply: &[u8],
) -> HandshakeResult<()> {
    reply.authorizer_len = authorizer_reply.len() as u32;
    let mut out = reply.to_bytes().to_vec();
    out.extend_from_slice(authorizer_reply);
    writer.write_all(&out).await?;
    Ok(())
}

/// Decide what to do with a verified connect request. Runs under the
/// registry lock.
#[allow(clippy::too_many_arguments)]
fn admit(
    shared: &Arc<Shared>,
    registry: &mut Registry,
    peer_addr: PeerAddress,
    connect: &ConnectRequest,
    policy: Policy,
    verdict: &AuthVerdict,
    mut reply: ConnectReply,
    socket: &mut Option<SocketKill>,
) -> HandshakeResult<Admission> {
    if registry.is_stopped() {
        return Err(HandshakeError::ShuttingDown);
    }

    let mut replaced = None;
    let mut existing_seq = None;
    let mut carried = None;

    match registry.lookup(&peer_addr) {
        None if connect.connect_seq > 0 => {
            tracing::info!(peer = %peer_addr, cseq = connect.connect_seq, "accept we reset, sending RESETSESSION");
            reply.tag = tags::RESETSESSION;
            return Ok(Admission::Reply(reply));
        }
        None => {
            tracing::debug!(peer = %peer_addr, "accept new session");
        }
        Some(existing) => {
            let mut ex = existing.lock();
            let view = ExistingView::of(&ex);
            let outcome = resolve_existing(connect, &view, peer_addr < shared.my_addr());
            tracing::debug!(
                peer = %peer_addr,
                cseq = connect.connect_seq,
                gseq = connect.global_seq,
                existing_cseq = view.connect_seq,
                existing_state = %view.state,
                ?outcome,
                "accept found existing pipe"
            );
            match outcome {
                RaceOutcome::RetryGlobal(gseq) => {
                    reply.tag = tags::RETRY_GLOBAL;
                    reply.global_seq = gseq;
                    return Ok(Admission::Reply(reply));
                }
                RaceOutcome::RetrySession(cseq) => {
                    reply.tag = tags::RETRY_SESSION;
                    reply.connect_seq = cseq;
                    return Ok(Admission::Reply(reply));
                }
                RaceOutcome::Wait => {
                    reply.tag = tags::WAIT;
                    return Ok(Admission::Reply(reply));
                }
                RaceOutcome::ResetSession => {
                    reply.tag = tags::RESETSESSION;
                    return Ok(Admission::Reply(reply));
                }
                RaceOutcome::Replace { reset_session } => {
                    if reset_session {
                        ex.was_session_reset(shared.initial_out_seq());
                    }
                    if connect.features & policy.features_supported & features::RECONNECT_SEQ != 0 {
                        existing_seq = Some(ex.seq.in_seq);
                    }
                    ex.stop();
                    if !ex.policy.lossy {
                        ex.requeue_sent(0);
                        carried = Some(Carried {
                            in_seq: ex.seq.in_seq,
                            out_seq: ex.seq.out_seq,
                            queues: std::mem::take(&mut ex.queues),
                        });
                    }
                    drop(ex);
                    existing.signal();
                    registry.unregister(&existing);
                    replaced = Some(existing);
                }
            }
        }
    }

    let identity = registry.get_or_create(peer_addr);
    let mut seq = SequenceState {
        connect_seq: connect.connect_seq + 1,
        peer_global_seq: connect.global_seq,
        ..SequenceState::starting_at(shared.initial_out_seq())
    };
    let mut queues = MessageQueues::new();
    if let Some(carried) = carried {
        seq.in_seq = carried.in_seq;
        seq.in_seq_acked = carried.in_seq;
        seq.out_seq = carried.out_seq;
        queues = carried.queues;
        tracing::debug!(peer = %peer_addr, out_seq = seq.out_seq, in_seq = seq.in_seq, "accept took over queues");
    }

    reply.tag = if existing_seq.is_some() { tags::SEQ } else { tags::READY };
    reply.features = policy.features_supported;
    reply.global_seq = shared.global_seq(0);
    reply.connect_seq = seq.connect_seq;
    reply.flags = if policy.lossy { CONNECT_FLAG_LOSSY } else { 0 };

    let pipe = Pipe::accepted(
        shared,
        Arc::clone(&identity),
        connect.host_type,
        policy,
        seq,
        queues,
        socket.take(),
    );
    pipe.lock().state = PipeState::Open;
    identity.set_negotiated(
        reply.features & connect.features,
        verdict.session_secret.clone(),
        connect.authorizer_protocol,
    );
    identity.set_peer_type(connect.host_type);
    identity.rebind(&pipe);
    registry.register(&pipe);
    tracing::info!(peer = %peer_addr, cseq = reply.connect_seq, tag = reply.tag, "accept success");

    Ok(Admission::Opened(Opened {
        pipe,
        reply,
        replaced,
        existing_seq,
    }))
}

/// Run the accept side of the handshake on a freshly accepted socket.
///
/// On success the pipe is registered, open, and running its reader and
/// writer.
pub(crate) async fn accept(shared: &Arc<Shared>, stream: TcpStream) -> HandshakeResult<Arc<Pipe>> {
    let observed = stream.peer_addr()?;
    if shared.config.tcp_nodelay {
        stream.set_nodelay(true)?;
    }
    let (kill, mut reader, mut writer) = split_stream(stream, shared.config.tcp_read_timeout);
    let mut socket = Some(kill);

    let mut hello = Vec::with_capacity(BANNER_LEN + 2 * ADDR_WIRE_SIZE);
    hello.extend_from_slice(BANNER);
    hello.extend_from_slice(&shared.my_addr().to_bytes());
    hello.extend_from_slice(&PeerAddress::new(observed, 0).to_bytes());
    writer.write_all(&hello).await?;

    let banner = reader.read_vec(BANNER_LEN).await?;
    if banner != BANNER {
        return Err(HandshakeError::BadBanner(banner));
    }
    let mut peer_addr = PeerAddress::from_bytes(&reader.read_vec(ADDR_WIRE_SIZE).await?)?;
    if peer_addr.is_blank_ip() {
        peer_addr = peer_addr.with_ip(observed.ip());
        tracing::info!(peer = %peer_addr, socket = %observed, "accept peer addr is really");
    }

    let opened = loop {
        let connect = ConnectRequest::from_bytes(&reader.read_vec(CONNECT_REQUEST_SIZE).await?)?;
        if connect.authorizer_len > MAX_AUTHORIZER_LEN {
            return Err(HandshakeError::AuthorizerTooLarge(connect.authorizer_len));
        }
        let blob = reader.read_vec(connect.authorizer_len as usize).await?;
        tracing::trace!(
            peer = %peer_addr,
            cseq = connect.connect_seq,
            gseq = connect.global_seq,
            host_type = connect.host_type,
            "accept got connect"
        );

        if shared.is_stopped() {
            return Err(HandshakeError::ShuttingDown);
        }
        let policy = shared.policy_for(connect.host_type);
        let mut reply = ConnectReply {
            protocol_version: shared.protocol_version_for(connect.host_type),
            features: (connect.features & policy.features_supported) | policy.features_required,
            ..Default::default()
        };

        if connect.protocol_version != reply.protocol_version {
            tracing::info!(
                peer = %peer_addr,
                ours = reply.protocol_version,
                theirs = connect.protocol_version,
                "accept protocol mismatch"
            );
            reply.tag = tags::BADPROTOVER;
            send_reply(&mut writer, reply, &[]).await?;
            continue;
        }

        let missing = policy.missing_from(connect.features);
        if missing != 0 {
            tracing::info!(peer = %peer_addr, missing = format_args!("{missing:#x}"), "peer missing required features");
            reply.tag = tags::FEATURES;
            send_reply(&mut writer, reply, &[]).await?;
            continue;
        }

        let verdict = shared
            .authorizer
            .verify(connect.host_type, connect.authorizer_protocol, &blob);
        if !verdict.valid {
            tracing::warn!(peer = %peer_addr, protocol = connect.authorizer_protocol, "accept bad authorizer");
            reply.tag = tags::BADAUTHORIZER;
            send_reply(&mut writer, reply, &verdict.reply).await?;
            continue;
        }

        let admission = {
            let mut registry = shared.registry();
            admit(shared, &mut registry, peer_addr, &connect, policy, &verdict, reply, &mut socket)?
        };
        match admission {
            Admission::Reply(reply) => send_reply(&mut writer, reply, &verdict.reply).await?,
            Admission::Opened(opened) => break (opened, verdict.reply),
        }
    };

    let (Opened { pipe, reply, replaced, existing_seq }, authorizer_reply) = opened;
    if let Some(existing) = &replaced {
        existing.flush_notices();
    }

    let exchanged = finish_accept(&mut reader, &mut writer, reply, &authorizer_reply, existing_seq).await;

    let mut inner = pipe.lock();
    match exchanged {
        Ok(newly_acked) => {
            if let Some(acked) = newly_acked {
                let dropped = inner.queues.trim_requeued(acked);
                inner.seq.out_seq += dropped as u64;
                if dropped > 0 {
                    tracing::debug!(peer = %peer_addr, acked, dropped, "accept dropped requeued messages peer already has");
                }
            }
            pipe.start_reader(&mut inner, reader);
            if !inner.state.is_closed() {
                pipe.start_writer(&mut inner, Some(writer));
            }
            drop(inner);
            Ok(pipe)
        }
        Err(e) => {
            tracing::debug!(peer = %peer_addr, error = %e, "accept failed after open");
            if !inner.state.is_closed() {
                let queued = inner.queues.is_queued();
                inner.state = if queued {
                    PipeState::Connecting
                } else if replaced.is_some() {
                    PipeState::Standby
                } else {
                    PipeState::Closed
                };
                inner.fault(false, false);
                if queued || replaced.is_some() {
                    pipe.start_writer(&mut inner, None);
                }
            }
            pipe.start_reader(&mut inner, reader);
            drop(inner);
            pipe.flush_notices();
            Err(e)
        }
    }
}

/// Write the final reply and, for `SEQ`, swap acked sequences.
///
/// Returns the peer's `in_seq` when a `SEQ` exchange took place.
async fn finish_accept(
    reader: &mut SocketReader,
    writer: &mut SocketWriter,
    reply: ConnectReply,
    authorizer_reply: &[u8],
    existing_seq: Option<u64>,
) -> HandshakeResult<Option<u64>> {
    send_reply(writer, reply, authorizer_reply).await?;
    match existing_seq {
        Some(seq) => {
            writer.write_le64(seq).await?;
            Ok(Some(reader.read_le64().await?))
        }
        None => Ok(None),
    }
}

// =============================================================================
// CONNECT
// =============================================================================

enum ReplyAction {
    Retry,
    Exchange,
    Open,
}

impl Pipe {
    /// Connect out to the peer. Runs on the writer task; `sock` receives the
    /// new write half on success.
    pub(super) async fn connect(self: &Arc<Self>, sock: &mut Option<SocketWriter>) {
        let (cseq, reader_task) = {
            let mut inner = self.lock();
            inner.shutdown_socket();
            (inner.seq.connect_seq, inner.reader_task.take())
        };
        let gseq = self.shared().global_seq(0);
        tracing::debug!(peer = %self.peer_addr(), cseq, gseq, "connect");

        if let Some(task) = reader_task {
            self.signal();
            if let Err(e) = task.await {
                tracing::warn!(peer = %self.peer_addr(), error = %e, "reader task panicked");
            }
        }
        *sock = None;

        match self.handshake(cseq, gseq, sock).await {
            Ok(()) => {}
            Err(HandshakeError::NoLongerConnecting) => {
                tracing::debug!(peer = %self.peer_addr(), "connect abandoned, pipe no longer connecting");
            }
            Err(e) => {
                if e.is_protocol_violation() || e.is_auth_failure() {
                    tracing::warn!(peer = %self.peer_addr(), error = %e, "connect failed");
                } else {
                    tracing::debug!(peer = %self.peer_addr(), error = %e, "connect failed");
                }
                let connecting = self.lock().state == PipeState::Connecting;
                if connecting {
                    self.fault(true, false).await;
                }
            }
        }
    }

    async fn handshake(
        self: &Arc<Self>,
        mut cseq: u32,
        mut gseq: u32,
        sock: &mut Option<SocketWriter>,
    ) -> HandshakeResult<()> {
        let shared = Arc::clone(self.shared());
        let config = &shared.config;
        let peer_addr = self.peer_addr();

        let stream = match config.tcp_read_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(peer_addr.addr))
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => TcpStream::connect(peer_addr.addr).await?,
        };
        if config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        let (kill, mut reader, mut writer) = split_stream(stream, config.tcp_read_timeout);
        {
            let mut inner = self.lock();
            if inner.state != PipeState::Connecting {
                return Err(HandshakeError::NoLongerConnecting);
            }
            inner.socket = Some(kill);
        }

        let banner = reader.read_vec(BANNER_LEN).await?;
        if banner != BANNER {
            return Err(HandshakeError::BadBanner(banner));
        }
        writer.write_all(BANNER).await?;

        let addrs = reader.read_vec(2 * ADDR_WIRE_SIZE).await?;
        let paddr = PeerAddress::from_bytes(&addrs[..ADDR_WIRE_SIZE])?;
        let seen = PeerAddress::from_bytes(&addrs[ADDR_WIRE_SIZE..])?;
        if paddr != peer_addr {
            if !peer_addr.matches_blank(&paddr) {
                return Err(HandshakeError::WrongPeer {
                    expected: peer_addr,
                    actual: paddr,
                });
            }
            tracing::debug!(peer = %peer_addr, declared = %paddr, "connect claims to be blank ip, ok");
        }
        shared.learned_addr(seen);
        writer.write_all(&shared.my_addr().to_bytes()).await?;

        let mut got_bad_auth = false;
        loop {
            let (peer_type, policy) = {
                let inner = self.lock();
                (inner.peer_type, inner.policy.clone())
            };
            let authorizer = shared.authorizer.produce(peer_type, got_bad_auth);
            let connect = ConnectRequest {
                features: policy.features_supported,
                host_type: shared.my_type(),
                global_seq: gseq,
                connect_seq: cseq,
                protocol_version: shared.protocol_version_for(peer_type),
                authorizer_protocol: authorizer.as_ref().map_or(0, |a| a.protocol),
                authorizer_len: authorizer.as_ref().map_or(0, |a| a.blob.len() as u32),
                flags: if policy.lossy { CONNECT_FLAG_LOSSY } else { 0 },
            };
            let mut out = connect.to_bytes().to_vec();
            if let Some(a) = &authorizer {
                out.extend_from_slice(&a.blob);
            }
            tracing::trace!(peer = %peer_addr, cseq, gseq, "connect sending request");
            writer.write_all(&out).await?;

            let reply = ConnectReply::from_bytes(&reader.read_vec(CONNECT_REPLY_SIZE).await?)?;
            if reply.authorizer_len > MAX_AUTHORIZER_LEN {
                return Err(HandshakeError::AuthorizerTooLarge(reply.authorizer_len));
            }
            let authorizer_reply = reader.read_vec(reply.authorizer_len as usize).await?;
            tracing::trace!(peer = %peer_addr, tag = reply.tag, cseq = reply.connect_seq, "connect got reply");

            if let Some(a) = &authorizer {
                let must_verify = reply.is_ready() || !authorizer_reply.is_empty();
                if must_verify && !shared.authorizer.verify_reply(a, &authorizer_reply) {
                    return Err(HandshakeError::BadReplyAuthorizer);
                }
            }

            let action = {
                let mut inner = self.lock();
                if inner.state != PipeState::Connecting {
                    return Err(HandshakeError::NoLongerConnecting);
                }
                match reply.tag {
                    tags::FEATURES => {
                        return Err(HandshakeError::MissingFeatures {
                            missing: reply.features & !connect.features,
                        });
                    }
                    tags::BADPROTOVER => {
                        return Err(HandshakeError::ProtocolVersion {
                            ours: connect.protocol_version,
                            theirs: reply.protocol_version,
                        });
                    }
                    tags::BADAUTHORIZER => {
                        if got_bad_auth {
                            return Err(HandshakeError::AuthorizerRejected);
                        }
                        tracing::info!(peer = %peer_addr, "connect got BADAUTHORIZER, retrying");
                        got_bad_auth = true;
                        ReplyAction::Retry
                    }
                    tags::RESETSESSION => {
                        inner.was_session_reset(shared.initial_out_seq());
                        cseq = 0;
                        ReplyAction::Retry
                    }
                    tags::RETRY_GLOBAL => {
                        gseq = shared.global_seq(reply.global_seq);
                        tracing::debug!(peer = %peer_addr, peer_gseq = reply.global_seq, gseq, "connect got RETRY_GLOBAL");
                        ReplyAction::Retry
                    }
                    tags::RETRY_SESSION => {
                        tracing::debug!(peer = %peer_addr, cseq, peer_cseq = reply.connect_seq, "connect got RETRY_SESSION");
                        cseq = reply.connect_seq;
                        inner.seq.connect_seq = cseq;
                        ReplyAction::Retry
                    }
                    tags::WAIT => {
                        tracing::debug!(peer = %peer_addr, "connect got WAIT (connection race)");
                        inner.state = PipeState::Wait;
                        return Ok(());
                    }
                    tags::READY | tags::SEQ => {
                        let missing = policy.missing_from(reply.features);
                        if missing != 0 {
                            return Err(HandshakeError::MissingFeatures { missing });
                        }
                        if reply.tag == tags::SEQ {
                            ReplyAction::Exchange
                        } else {
                            ReplyAction::Open
                        }
                    }
                    other => return Err(HandshakeError::UnknownTag(other)),
                }
            };
            self.flush_notices();

            match action {
                ReplyAction::Retry => continue,
                ReplyAction::Exchange => {
                    let newly_acked = reader.read_le64().await?;
                    let in_seq = {
                        let mut inner = self.lock();
                        inner.queues.handle_ack(newly_acked);
                        let dropped = inner.queues.trim_requeued(newly_acked);
                        inner.seq.out_seq += dropped as u64;
                        tracing::debug!(peer = %peer_addr, newly_acked, dropped, "connect got SEQ");
                        inner.seq.in_seq
                    };
                    writer.write_le64(in_seq).await?;
                }
                ReplyAction::Open => {}
            }

            let mut inner = self.lock();
            if inner.state != PipeState::Connecting {
                return Err(HandshakeError::NoLongerConnecting);
            }
            inner.seq.peer_global_seq = reply.global_seq;
            inner.policy.lossy = reply.is_lossy();
            inner.state = PipeState::Open;
            inner.seq.connect_seq = cseq + 1;
            inner.backoff = None;
            if inner.seq.connect_seq != reply.connect_seq {
                tracing::debug!(
                    peer = %peer_addr,
                    ours = inner.seq.connect_seq,
                    theirs = reply.connect_seq,
                    "connect_seq differs from reply"
                );
            }

            let identity = Arc::clone(&inner.identity);
            identity.set_negotiated(
                reply.features & connect.features,
                authorizer.map(|a| a.session_secret),
                connect.authorizer_protocol,
            );
            identity.rebind(self);
            tracing::info!(
                peer = %peer_addr,
                cseq = inner.seq.connect_seq,
                lossy = inner.policy.lossy,
                features = format_args!("{:#x}", identity.features()),
                "connect success"
            );

            inner.notices.push(Notice::Connected);
            if !inner.reader_running {
                self.start_reader(&mut inner, reader);
            }
            *sock = Some(writer);
            drop(inner);
            self.flush_notices();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NoAuth;
    use crate::messenger::MessengerConfig;
    use crate::pipe::ConnectionIdentity;
    use crate::transport::{ByteThrottle, Message, entity_type};

    struct NullSink;

    impl crate::core::DispatchSink for NullSink {
        fn deliver(&self, _message: Message, _priority: u8) {}
        fn notify_reset(&self, _identity: &Arc<ConnectionIdentity>) {}
        fn notify_remote_reset(&self, _identity: &Arc<ConnectionIdentity>) {}
        fn notify_connected(&self, _identity: &Arc<ConnectionIdentity>) {}
    }

    fn shared() -> Arc<Shared> {
        let config = MessengerConfig {
            randomize_initial_seq: false,
            ..MessengerConfig::default()
        };
        Arc::new(Shared::new(
            config,
            PeerAddress::new("127.0.0.1:6800".parse().unwrap(), 1),
            Arc::new(NullSink),
            Arc::new(NoAuth),
            None,
            ByteThrottle::shared("dispatch", 1024),
        ))
    }

    fn peer() -> PeerAddress {
        PeerAddress::new("127.0.0.1:6801".parse().unwrap(), 2)
    }

    /// Register an open pipe to `peer()` with `cseq` and one queued message.
    fn registered(shared: &Arc<Shared>, policy: Policy, cseq: u32) -> Arc<Pipe> {
        let mut registry = shared.registry();
        let identity = registry.get_or_create(peer());
        let pipe = Pipe::outgoing(shared, identity, entity_type::OSD);
        {
            let mut inner = pipe.lock();
            inner.policy = policy;
            inner.state = PipeState::Open;
            inner.seq.connect_seq = cseq;
            inner.seq.in_seq = 4;
            inner.queues.enqueue(Message::new(1, &b"pending"[..]));
        }
        registry.register(&pipe);
        pipe
    }

    fn connect_request(cseq: u32, features: u64) -> ConnectRequest {
        ConnectRequest {
            features,
            host_type: entity_type::OSD,
            global_seq: 100,
            connect_seq: cseq,
            ..Default::default()
        }
    }

    fn admit_request(shared: &Arc<Shared>, connect: &ConnectRequest, policy: Policy) -> Opened {
        let mut registry = shared.registry();
        let admission = admit(
            shared,
            &mut registry,
            peer(),
            connect,
            policy,
            &AuthVerdict::accept(),
            ConnectReply::default(),
            &mut None,
        )
        .unwrap();
        match admission {
            Admission::Opened(opened) => opened,
            Admission::Reply(reply) => panic!("expected open, got tag {}", reply.tag),
        }
    }

    fn request(gseq: u32, cseq: u32) -> ConnectRequest {
        ConnectRequest {
            global_seq: gseq,
            connect_seq: cseq,
            ..Default::default()
        }
    }

    fn existing(gseq: u32, cseq: u32, state: PipeState) -> ExistingView {
        ExistingView {
            peer_global_seq: gseq,
            connect_seq: cseq,
            lossy: false,
            server: false,
            state,
        }
    }

    #[test]
    fn test_stale_global_seq_retries() {
        let ex = existing(20, 3, PipeState::Open);
        assert_eq!(
            resolve_existing(&request(10, 3), &ex, true),
            RaceOutcome::RetryGlobal(20)
        );
    }

    #[test]
    fn test_lossy_existing_is_replaced() {
        let ex = ExistingView {
            lossy: true,
            ..existing(1, 9, PipeState::Open)
        };
        assert_eq!(
            resolve_existing(&request(5, 0), &ex, false),
            RaceOutcome::Replace { reset_session: true }
        );
    }

    #[test]
    fn test_peer_restart_resets_and_replaces() {
        let ex = existing(1, 5, PipeState::Open);
        assert_eq!(
            resolve_existing(&request(2, 0), &ex, false),
            RaceOutcome::Replace { reset_session: true }
        );
    }

    #[test]
    fn test_old_attempt_retries_session() {
        let ex = existing(1, 5, PipeState::Open);
        assert_eq!(
            resolve_existing(&request(2, 3), &ex, false),
            RaceOutcome::RetrySession(5)
        );
    }

    #[test]
    fn test_equal_connect_seq_tie_break() {
        let ex = existing(1, 2, PipeState::Connecting);
        assert_eq!(
            resolve_existing(&request(2, 2), &ex, true),
            RaceOutcome::Replace { reset_session: false }
        );
        assert_eq!(resolve_existing(&request(2, 2), &ex, false), RaceOutcome::Wait);

        let standby = existing(1, 2, PipeState::Standby);
        assert_eq!(
            resolve_existing(&request(2, 2), &standby, false),
            RaceOutcome::Replace { reset_session: false }
        );

        let server = ExistingView {
            server: true,
            ..existing(1, 2, PipeState::Open)
        };
        assert_eq!(
            resolve_existing(&request(2, 2), &server, false),
            RaceOutcome::Replace { reset_session: false }
        );
    }

    #[test]
    fn test_we_reset_sends_resetsession() {
        let ex = existing(1, 0, PipeState::Connecting);
        assert_eq!(
            resolve_existing(&request(2, 4), &ex, true),
            RaceOutcome::ResetSession
        );
    }

    #[test]
    fn test_newer_attempt_replaces() {
        let ex = existing(1, 4, PipeState::Standby);
        assert_eq!(
            resolve_existing(&request(2, 5), &ex, false),
            RaceOutcome::Replace { reset_session: false }
        );
    }

    #[test]
    fn test_global_seq_checked_before_lossy() {
        let ex = ExistingView {
            lossy: true,
            ..existing(50, 1, PipeState::Open)
        };
        assert_eq!(
            resolve_existing(&request(49, 0), &ex, true),
            RaceOutcome::RetryGlobal(50)
        );
    }

    #[test]
    fn test_replacing_lossy_pipe_reports_remote_reset() {
        let shared = shared();
        let existing = registered(&shared, Policy::lossy_client(), 3);

        let opened = admit_request(
            &shared,
            &connect_request(0, features::SUPPORTED_DEFAULT),
            Policy::stateless_server(),
        );

        let replaced = opened.replaced.expect("lossy pipe replaced");
        assert!(Arc::ptr_eq(&replaced, &existing));
        {
            let ex = existing.lock();
            assert_eq!(ex.state, PipeState::Closed);
            assert!(ex.notices.contains(&Notice::RemoteReset));
            assert_eq!(ex.queues.queued_len(), 0);
        }
        // Nothing carried over from the lossy pipe.
        let inner = opened.pipe.lock();
        assert_eq!(inner.queues.queued_len(), 0);
        assert_eq!(inner.seq.in_seq, 0);
        assert_eq!(inner.seq.connect_seq, 1);
        drop(inner);
        assert!(Arc::ptr_eq(&shared.registry().lookup(&peer()).unwrap(), &opened.pipe));
    }

    #[test]
    fn test_replace_carries_queue_and_offers_seq() {
        let shared = shared();
        registered(&shared, Policy::lossless_peer(), 2);

        let opened = admit_request(
            &shared,
            &connect_request(3, features::SUPPORTED_DEFAULT),
            Policy::lossless_peer(),
        );

        assert_eq!(opened.reply.tag, tags::SEQ);
        assert_eq!(opened.existing_seq, Some(4));
        let inner = opened.pipe.lock();
        assert_eq!(inner.queues.queued_len(), 1);
        assert_eq!(inner.seq.in_seq, 4);
        assert_eq!(inner.seq.connect_seq, 4);
        assert!(inner.notices.is_empty());
    }

    #[test]
    fn test_seq_exchange_needs_both_sides() {
        let shared = shared();
        registered(&shared, Policy::lossless_peer(), 2);

        // Peer offers sequence exchange, but we don't support it.
        let opened = admit_request(
            &shared,
            &connect_request(3, features::SUPPORTED_DEFAULT),
            Policy::lossless_peer().without(features::RECONNECT_SEQ),
        );

        assert_eq!(opened.reply.tag, tags::READY);
        assert_eq!(opened.existing_seq, None);
        assert_eq!(opened.pipe.lock().queues.queued_len(), 1);
    }
}
