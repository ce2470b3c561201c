//! Two messengers talking over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use tether_protocol::pipe::PipeState;
use tether_protocol::prelude::*;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Event {
    Msg(Message),
    Reset(PeerAddress),
    RemoteReset(PeerAddress),
    Connected(PeerAddress),
}

struct Recorder(mpsc::UnboundedSender<Event>);

impl DispatchSink for Recorder {
    fn deliver(&self, message: Message, _priority: u8) {
        let _ = self.0.send(Event::Msg(message));
    }

    fn notify_reset(&self, identity: &Arc<ConnectionIdentity>) {
        let _ = self.0.send(Event::Reset(identity.peer_addr()));
    }

    fn notify_remote_reset(&self, identity: &Arc<ConnectionIdentity>) {
        let _ = self.0.send(Event::RemoteReset(identity.peer_addr()));
    }

    fn notify_connected(&self, identity: &Arc<ConnectionIdentity>) {
        let _ = self.0.send(Event::Connected(identity.peer_addr()));
    }
}

struct Node {
    messenger: Messenger,
    events: mpsc::UnboundedReceiver<Event>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Node {
    async fn start(builder: MessengerConfigBuilder) -> Self {
        init_tracing();
        let (tx, events) = mpsc::unbounded_channel();
        let config = builder.build().unwrap();
        let messenger = Messenger::bind(config, Arc::new(Recorder(tx))).await.unwrap();
        Self { messenger, events }
    }

    fn addr(&self) -> PeerAddress {
        self.messenger.my_addr()
    }

    fn send(&self, to: PeerAddress, peer_type: u32, body: &str) {
        self.messenger
            .send_message(to, peer_type, Message::new(42, body.to_string()))
            .unwrap();
    }

    async fn next(&mut self) -> Event {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink dropped")
    }

    /// Next delivered message, skipping lifecycle notifications.
    async fn next_msg(&mut self) -> Message {
        loop {
            if let Event::Msg(msg) = self.next().await {
                return msg;
            }
        }
    }

    async fn bodies(&mut self, n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let msg = self.next_msg().await;
            out.push(String::from_utf8(msg.front.to_vec()).unwrap());
        }
        out
    }

    async fn wait_for(&mut self, want: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = self.next().await;
            if want(&event) {
                return event;
            }
        }
    }

    /// Assert nothing but lifecycle notifications arrives for `quiet`.
    async fn assert_no_msg(&mut self, quiet: Duration) {
        let deadline = tokio::time::Instant::now() + quiet;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(Event::Msg(msg))) => panic!("unexpected message {msg}"),
                Ok(Some(_)) => {}
            }
        }
    }

    async fn wait_stats(&self, peer: PeerAddress, want: impl Fn(&PipeStats) -> bool) -> PipeStats {
        timeout(WAIT, async {
            loop {
                if let Some(stats) = self.messenger.pipe_stats(peer) {
                    if want(&stats) {
                        return stats;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for pipe stats")
    }
}

fn builder(entity: EntityName, nonce: u32) -> MessengerConfigBuilder {
    MessengerConfigBuilder::new()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .entity(entity)
        .nonce(nonce)
        .backoff(Duration::from_millis(20), Duration::from_millis(200))
        .randomize_initial_seq(false)
}

fn osd(num: u64) -> MessengerConfigBuilder {
    builder(EntityName::new(entity_type::OSD, num), num as u32 + 1)
}

fn numbered(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("{prefix}{i}")).collect()
}

#[tokio::test]
async fn test_delivery_in_order() {
    let mut a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    for body in numbered("m", 0..20) {
        a.send(b.addr(), entity_type::OSD, &body);
    }

    let first = b.next_msg().await;
    assert_eq!(&first.front[..], b"m0");
    assert_eq!(first.seq(), 1);
    assert_eq!(first.src, EntityName::new(entity_type::OSD, 0));
    assert!(first.connection().is_some());

    assert_eq!(b.bodies(19).await, numbered("m", 1..20));

    let connected = a.wait_for(|e| matches!(e, Event::Connected(_))).await;
    assert!(matches!(connected, Event::Connected(addr) if addr == b.addr()));
}

#[tokio::test]
async fn test_acks_trim_sent_list() {
    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    for body in numbered("m", 0..10) {
        a.send(b.addr(), entity_type::OSD, &body);
    }
    assert_eq!(b.bodies(10).await, numbered("m", 0..10));

    let stats = a.wait_stats(b.addr(), |s| s.unacked == 0).await;
    assert_eq!(stats.state, PipeState::Open);
    assert_eq!(stats.seq.out_seq, 10);
    assert_eq!(stats.queued, 0);
    assert!(!stats.lossy);

    let stats = b.wait_stats(a.addr(), |s| s.seq.in_seq_acked == 10).await;
    assert_eq!(stats.seq.in_seq, 10);
}

#[tokio::test]
async fn test_replay_after_socket_reset() {
    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    for body in numbered("m", 0..5) {
        a.send(b.addr(), entity_type::OSD, &body);
    }
    assert_eq!(b.bodies(5).await, numbered("m", 0..5));

    assert!(a.messenger.reset_socket(b.addr()));
    for body in numbered("m", 5..15) {
        a.send(b.addr(), entity_type::OSD, &body);
    }

    // Every message exactly once, in order, despite the reconnect.
    assert_eq!(b.bodies(10).await, numbered("m", 5..15));
    b.assert_no_msg(Duration::from_millis(200)).await;

    let stats = a.wait_stats(b.addr(), |s| s.unacked == 0 && s.state == PipeState::Open).await;
    assert_eq!(stats.seq.out_seq, 15);
    assert!(stats.seq.connect_seq >= 1);
}

#[tokio::test]
async fn test_reset_with_nothing_queued_goes_standby() {
    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    a.send(b.addr(), entity_type::OSD, "hello");
    b.next_msg().await;
    a.wait_stats(b.addr(), |s| s.unacked == 0).await;

    assert!(a.messenger.reset_socket(b.addr()));
    a.wait_stats(b.addr(), |s| s.state == PipeState::Standby).await;

    // New traffic wakes the pipe up again.
    a.send(b.addr(), entity_type::OSD, "again");
    let msg = b.next_msg().await;
    assert_eq!(&msg.front[..], b"again");
    assert_eq!(msg.seq(), 2);
}

#[tokio::test]
async fn test_connection_race_keeps_both_streams() {
    let mut a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;
    let (a_addr, b_addr) = (a.addr(), b.addr());

    for i in 0..10 {
        a.send(b_addr, entity_type::OSD, &format!("a{i}"));
        b.send(a_addr, entity_type::OSD, &format!("b{i}"));
    }

    assert_eq!(b.bodies(10).await, numbered("a", 0..10));
    assert_eq!(a.bodies(10).await, numbered("b", 0..10));
    a.assert_no_msg(Duration::from_millis(200)).await;
    b.assert_no_msg(Duration::from_millis(200)).await;

    // Both sides settle on a single open pipe.
    a.wait_stats(b_addr, |s| s.state == PipeState::Open && s.unacked == 0).await;
    b.wait_stats(a_addr, |s| s.state == PipeState::Open && s.unacked == 0).await;
}

#[tokio::test]
async fn test_peer_forgot_session() {
    let mut a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    a.send(b.addr(), entity_type::OSD, "before");
    b.next_msg().await;
    a.wait_stats(b.addr(), |s| s.unacked == 0).await;

    // B drops everything it knew about A; A's next reconnect is told to
    // start a new session.
    b.messenger.mark_down(a.addr());
    a.wait_stats(b.addr(), |s| s.state == PipeState::Standby).await;
    a.send(b.addr(), entity_type::OSD, "lost");

    let event = a.wait_for(|e| matches!(e, Event::RemoteReset(_))).await;
    assert!(matches!(event, Event::RemoteReset(addr) if addr == b.addr()));

    let stats = a.wait_stats(b.addr(), |s| s.state == PipeState::Open).await;
    assert_eq!(stats.seq.in_seq, 0);

    a.send(b.addr(), entity_type::OSD, "after");
    let msg = b.next_msg().await;
    assert_eq!(&msg.front[..], b"after");
}

#[tokio::test]
async fn test_mark_down_then_reconnect() {
    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    a.send(b.addr(), entity_type::OSD, "one");
    b.next_msg().await;

    a.messenger.mark_down(b.addr());
    assert!(a.messenger.pipe_stats(b.addr()).is_none());
    assert!(a.messenger.connection(b.addr()).is_none());

    // A fresh session from A resets B's stale one.
    a.send(b.addr(), entity_type::OSD, "two");
    let event = b.wait_for(|e| matches!(e, Event::RemoteReset(_) | Event::Msg(_))).await;
    let msg = match event {
        Event::RemoteReset(addr) => {
            assert_eq!(addr, a.addr());
            b.next_msg().await
        }
        Event::Msg(msg) => msg,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(&msg.front[..], b"two");
    assert_eq!(msg.seq(), 1);
}

#[tokio::test]
async fn test_lossy_client_reports_reset() {
    let mut client = Node::start(
        builder(EntityName::new(entity_type::CLIENT, 7), 70).policy(entity_type::OSD, Policy::lossy_client()),
    )
    .await;
    let mut server = Node::start(osd(1).policy(entity_type::CLIENT, Policy::stateless_server())).await;
    let server_addr = server.addr();

    client.send(server_addr, entity_type::OSD, "req");
    assert_eq!(&server.next_msg().await.front[..], b"req");
    assert!(client.wait_stats(server_addr, |_| true).await.lossy);

    assert!(client.messenger.reset_socket(server_addr));
    let event = client.wait_for(|e| matches!(e, Event::Reset(_))).await;
    assert!(matches!(event, Event::Reset(addr) if addr == server_addr));
    server.wait_for(|e| matches!(e, Event::Reset(_))).await;

    // A lossy pipe is gone for good; the next send opens a new one.
    client.send(server_addr, entity_type::OSD, "req2");
    let msg = server.next_msg().await;
    assert_eq!(&msg.front[..], b"req2");
    assert_eq!(msg.seq(), 1);
}

#[tokio::test]
async fn test_server_policy_never_connects() {
    let a = Node::start(osd(0)).await;
    let b = Node::start(osd(1).default_policy(Policy::stateful_server())).await;

    let err = b
        .messenger
        .send_message(a.addr(), entity_type::OSD, Message::new(1, "x"))
        .unwrap_err();
    assert!(matches!(err, MessengerError::NotConnected(_)));
    assert!(b.messenger.connect(a.addr(), entity_type::OSD).is_err());
}

#[tokio::test]
async fn test_server_replies_over_accepted_pipe() {
    let mut client = Node::start(osd(0)).await;
    let mut server = Node::start(osd(1).default_policy(Policy::stateful_server())).await;

    client.send(server.addr(), entity_type::OSD, "ping");
    let msg = server.next_msg().await;
    assert_eq!(&msg.front[..], b"ping");

    server.send(client.addr(), entity_type::OSD, "pong");
    assert_eq!(&client.next_msg().await.front[..], b"pong");
}

#[tokio::test]
async fn test_local_delivery() {
    let mut a = Node::start(osd(0)).await;
    a.send(a.addr(), entity_type::OSD, "self");
    let msg = a.next_msg().await;
    assert_eq!(&msg.front[..], b"self");
    assert_eq!(msg.src, a.messenger.entity());
    assert!(a.messenger.pipe_stats(a.addr()).is_none());
}

#[tokio::test]
async fn test_keepalive_and_connect() {
    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    assert!(!a.messenger.send_keepalive(b.addr()));

    let identity = a.messenger.connect(b.addr(), entity_type::OSD).unwrap();
    assert_eq!(identity.peer_addr(), b.addr());
    a.wait_stats(b.addr(), |s| s.state == PipeState::Open).await;
    assert!(a.messenger.send_keepalive(b.addr()));

    // Keepalives carry no message and keep the pipe healthy.
    a.send(b.addr(), entity_type::OSD, "after keepalive");
    assert_eq!(&b.next_msg().await.front[..], b"after keepalive");
    let same = a.messenger.connection(b.addr()).unwrap();
    assert!(Arc::ptr_eq(&identity, &same));
}

#[tokio::test]
async fn test_mark_down_on_empty_closes_after_acks() {
    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    for body in numbered("m", 0..5) {
        a.send(b.addr(), entity_type::OSD, &body);
    }
    a.messenger.mark_down_on_empty(b.addr());
    assert_eq!(b.bodies(5).await, numbered("m", 0..5));

    timeout(WAIT, async {
        while a.messenger.pipe_stats(b.addr()).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipe never closed");
}

#[tokio::test]
async fn test_global_seq_and_shutdown() {
    let a = Node::start(osd(0)).await;
    let b = Node::start(osd(1)).await;

    let first = a.messenger.global_seq(0);
    assert!(a.messenger.global_seq(first + 100) > first + 100);

    a.send(b.addr(), entity_type::OSD, "x");
    a.wait_stats(b.addr(), |s| s.state == PipeState::Open).await;
    timeout(WAIT, a.messenger.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_garbage_connection_is_dropped() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let a = Node::start(osd(0)).await;
    let mut b = Node::start(osd(1)).await;

    let mut raw = tokio::net::TcpStream::connect(b.messenger.local_addr()).await.unwrap();
    raw.write_all(&[b'x'; BANNER_LEN]).await.unwrap();
    let mut hello = Vec::new();
    // The acceptor hangs up after the bad banner.
    let read = timeout(WAIT, raw.read_to_end(&mut hello)).await.unwrap();
    if read.is_ok() {
        assert!(hello.starts_with(BANNER));
    }

    a.send(b.addr(), entity_type::OSD, "still fine");
    assert_eq!(&b.next_msg().await.front[..], b"still fine");
}

fn padded(i: usize) -> String {
    format!("{:<100}", format!("m{i}"))
}

#[tokio::test]
async fn test_unacked_messages_replay_exactly_once() {
    let a = Node::start(osd(0)).await;
    // Room for three 100-byte messages; the reader stalls on the fourth
    // until the sink lets go of earlier ones.
    let throttled = Policy::lossless_peer().with_throttle(ByteThrottle::shared("osd", 300));
    let mut b = Node::start(osd(1).policy(entity_type::OSD, throttled)).await;

    for i in 0..10 {
        a.send(b.addr(), entity_type::OSD, &padded(i));
    }

    let stats = a.wait_stats(b.addr(), |s| s.queued == 0 && s.unacked == 7).await;
    assert_eq!(stats.state, PipeState::Open);
    assert_eq!(stats.seq.out_seq, 10);

    assert!(a.messenger.reset_socket(b.addr()));

    let want: Vec<String> = (0..10).map(padded).collect();
    assert_eq!(b.bodies(10).await, want);
    b.assert_no_msg(Duration::from_millis(300)).await;

    let stats = a.wait_stats(b.addr(), |s| s.state == PipeState::Open && s.unacked == 0).await;
    assert_eq!(stats.seq.out_seq, 10);
    assert_eq!(stats.queued, 0);
    let stats = b.wait_stats(a.addr(), |s| s.seq.in_seq_acked == 10).await;
    assert_eq!(stats.seq.in_seq, 10);
}

/// Frame `body` as message `seq`, optionally with a bad front CRC.
fn raw_frame(seq: u64, body: &str, corrupt: bool) -> Vec<u8> {
    use tether_protocol::transport::{Footer, Header, HeaderLayout};

    let msg = Message::new(42, body.to_string());
    let mut header = Header::for_message(&msg);
    header.seq = seq;
    let mut footer = Footer {
        front_crc: crc32fast::hash(body.as_bytes()),
        middle_crc: crc32fast::hash(&[]),
        data_crc: crc32fast::hash(&[]),
        flags: FOOTER_COMPLETE,
        ..Default::default()
    };
    if corrupt {
        footer.front_crc ^= 1;
    }

    let mut out = vec![tags::MSG];
    out.extend_from_slice(&header.encode(HeaderLayout::Modern));
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&footer.to_bytes());
    out
}

#[tokio::test]
async fn test_corrupt_frame_is_never_delivered() {
    use tether_protocol::transport::{
        ADDR_WIRE_SIZE, CONNECT_REPLY_SIZE, ConnectReply, ConnectRequest,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut b = Node::start(osd(1)).await;
    let me = PeerAddress::new("127.0.0.1:1".parse().unwrap(), 77);

    let mut raw = tokio::net::TcpStream::connect(b.messenger.local_addr()).await.unwrap();
    let mut hello = vec![0u8; BANNER_LEN + 2 * ADDR_WIRE_SIZE];
    raw.read_exact(&mut hello).await.unwrap();
    assert!(hello.starts_with(BANNER));

    let mut out = BANNER.to_vec();
    out.extend_from_slice(&me.to_bytes());
    let connect = ConnectRequest {
        features: features::SUPPORTED_DEFAULT,
        host_type: entity_type::OSD,
        global_seq: 1,
        connect_seq: 0,
        protocol_version: CLUSTER_PROTOCOL_VERSION,
        ..Default::default()
    };
    out.extend_from_slice(&connect.to_bytes());
    raw.write_all(&out).await.unwrap();

    let mut bytes = [0u8; CONNECT_REPLY_SIZE];
    raw.read_exact(&mut bytes).await.unwrap();
    let reply = ConnectReply::from_bytes(&bytes).unwrap();
    assert_eq!(reply.tag, tags::READY);
    assert_ne!(reply.features & features::NOSRCADDR, 0);
    let mut authorizer = vec![0u8; reply.authorizer_len as usize];
    raw.read_exact(&mut authorizer).await.unwrap();

    raw.write_all(&raw_frame(1, "intact", false)).await.unwrap();
    assert_eq!(&b.next_msg().await.front[..], b"intact");

    raw.write_all(&raw_frame(2, "tampered", true)).await.unwrap();
    let stats = b.wait_stats(me, |s| s.state != PipeState::Open).await;
    assert_eq!(stats.seq.in_seq, 1);
    b.assert_no_msg(Duration::from_millis(300)).await;
}

#[cfg(feature = "crypto")]
mod signed {
    use super::*;

    async fn start_with_key(builder: MessengerConfigBuilder, key: &[u8]) -> Node {
        init_tracing();
        let (tx, events) = mpsc::unbounded_channel();
        let messenger = Messenger::bind_with_auth(
            builder.build().unwrap(),
            Arc::new(Recorder(tx)),
            Arc::new(SharedKeyAuthorizer::new(key.to_vec()).unwrap()),
            Some(Arc::new(Blake2Signer::new())),
        )
        .await
        .unwrap();
        Node { messenger, events }
    }

    #[tokio::test]
    async fn test_shared_key_signs_messages() {
        let key = [7u8; 32];
        let a = start_with_key(osd(0), &key).await;
        let mut b = start_with_key(osd(1), &key).await;

        for body in numbered("s", 0..5) {
            a.send(b.addr(), entity_type::OSD, &body);
        }
        assert_eq!(b.bodies(5).await, numbered("s", 0..5));

        let identity = a.messenger.connection(b.addr()).unwrap();
        assert!(identity.has_feature(features::MSG_AUTH));
        assert_eq!(identity.protocol(), AUTH_PROTOCOL_SHARED_KEY);
        assert!(identity.signing_secret().is_some());
    }

    #[tokio::test]
    async fn test_wrong_key_never_delivers() {
        let a = start_with_key(osd(0), &[1u8; 32]).await;
        let mut b = start_with_key(osd(1), &[2u8; 32]).await;

        a.send(b.addr(), entity_type::OSD, "nope");
        b.assert_no_msg(Duration::from_millis(500)).await;
        let stats = a.messenger.pipe_stats(b.addr()).unwrap();
        assert_ne!(stats.state, PipeState::Open);
    }
}
