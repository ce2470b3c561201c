//! Message frame encoding and decoding.
//!
//! A message travels as `MSG` tag, header, three sections, footer:
//! ```text
//! +-----+----------------+-------+--------+------+---------+
//! | Tag | Header (+CRC)  | Front | Middle | Data | Footer  |
//! | 1   | 55 or 78 bytes | ...   | ...    | ...  | 21      |
//! +-----+----------------+-------+--------+------+---------+
//! ```
//!
//! Header (modern layout, 55 bytes):
//! ```text
//! seq LE64 | tid LE64 | type LE16 | priority LE16 | version LE16 |
//! front_len LE32 | middle_len LE32 | data_len LE32 | data_off LE32 |
//! src (type u8 + num LE64) | compat_version LE16 | reserved LE16 | crc LE32
//! ```
//! The legacy layout, used when `NOSRCADDR` was not negotiated, inserts the
//! sender's 23-byte address right after `src`.
//!
//! Footer (21 bytes):
//! ```text
//! front_crc LE32 | middle_crc LE32 | data_crc LE32 | sig1 LE32 | sig2 LE32 | flags u8
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncRead;

use super::addr::{ADDR_WIRE_SIZE, ENTITY_NAME_WIRE_SIZE, EntityName, PeerAddress};
use super::error::TransportResult;
use super::message::Message;
use super::socket::SocketReader;
use super::throttle::ThrottleReservation;
use crate::core::{
    CryptoService, FOOTER_COMPLETE, FOOTER_NOCRC, MAX_MESSAGE_LEN, MAX_SECTION_LEN, PAGE_SIZE,
    SessionSecret, Signature, Throttle, features, tags,
};

/// Size constants for the frame wire format.
pub mod sizes {
    use super::{ADDR_WIRE_SIZE, ENTITY_NAME_WIRE_SIZE};

    /// Modern header size.
    pub const HEADER_SIZE: usize = 8 + 8 + 2 + 2 + 2 + 4 + 4 + 4 + 4 + ENTITY_NAME_WIRE_SIZE + 2 + 2 + 4;
    /// Legacy header size (modern plus inline source address).
    pub const LEGACY_HEADER_SIZE: usize = HEADER_SIZE + ADDR_WIRE_SIZE;
    /// Footer size.
    pub const FOOTER_SIZE: usize = 4 * 5 + 1;
    /// Signed plaintext: seq plus the three section CRCs.
    pub const SIGNED_PLAINTEXT_SIZE: usize = 8 + 4 * 3;
}

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Buffer too short for the structure being parsed.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Header CRC does not match its contents.
    #[error("bad header crc: computed {actual:#010x}, header says {expected:#010x}")]
    HeaderCrc {
        /// CRC carried in the header.
        expected: u32,
        /// CRC computed over the received header.
        actual: u32,
    },

    /// A section CRC does not match its contents.
    #[error("bad {section} crc: computed {actual:#010x}, footer says {expected:#010x}")]
    SectionCrc {
        /// Section name.
        section: &'static str,
        /// CRC carried in the footer.
        expected: u32,
        /// CRC computed over the received section.
        actual: u32,
    },

    /// Signature does not match the message contents.
    #[error("signature mismatch on message {seq}")]
    BadSignature {
        /// Sequence number of the rejected message.
        seq: u64,
    },

    /// A section length exceeds [`MAX_SECTION_LEN`].
    #[error("{section} section too large: {len} bytes")]
    SectionTooLarge {
        /// Section name.
        section: &'static str,
        /// Declared length.
        len: u32,
    },

    /// The sections together exceed what we are willing to buffer.
    #[error("message too large: {size} bytes, limit {limit}")]
    MessageTooLarge {
        /// Declared front + middle + data length.
        size: u64,
        /// Effective limit.
        limit: u64,
    },
}

impl FrameError {
    /// Whether this is a CRC or signature failure.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            FrameError::HeaderCrc { .. }
                | FrameError::SectionCrc { .. }
                | FrameError::BadSignature { .. }
        )
    }
}

/// Header layout, chosen by the negotiated `NOSRCADDR` feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    /// Source address carried inline in every header.
    Legacy,
    /// Source address exchanged once during the handshake.
    Modern,
}

impl HeaderLayout {
    /// Pick the layout for a negotiated feature mask.
    pub fn for_features(negotiated: u64) -> Self {
        if negotiated & features::NOSRCADDR != 0 {
            Self::Modern
        } else {
            Self::Legacy
        }
    }

    /// Encoded header size for this layout.
    pub fn header_size(self) -> usize {
        match self {
            Self::Legacy => sizes::LEGACY_HEADER_SIZE,
            Self::Modern => sizes::HEADER_SIZE,
        }
    }
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Message header as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Sequence number.
    pub seq: u64,
    /// Transaction id.
    pub tid: u64,
    /// Message type.
    pub msg_type: u16,
    /// Priority.
    pub priority: u16,
    /// Front encoding version.
    pub version: u16,
    /// Front section length.
    pub front_len: u32,
    /// Middle section length.
    pub middle_len: u32,
    /// Data section length.
    pub data_len: u32,
    /// Data alignment hint.
    pub data_off: u32,
    /// Logical sender.
    pub src: EntityName,
    /// Sender address (legacy layout only).
    pub src_addr: Option<PeerAddress>,
    /// Oldest compatible front version.
    pub compat_version: u16,
    /// CRC over every preceding header byte.
    pub crc: u32,
}

impl Header {
    /// Build the header for `msg` (lengths taken from its sections).
    pub fn for_message(msg: &Message) -> Self {
        Self {
            seq: msg.seq(),
            tid: msg.tid,
            msg_type: msg.msg_type,
            priority: u16::from(msg.priority),
            version: msg.version,
            front_len: msg.front.len() as u32,
            middle_len: msg.middle.len() as u32,
            data_len: msg.data.len() as u32,
            data_off: msg.data_off,
            src: msg.src,
            src_addr: None,
            compat_version: msg.compat_version,
            crc: 0,
        }
    }

    /// Serialize, computing and storing the header CRC.
    pub fn encode(&mut self, layout: HeaderLayout) -> Vec<u8> {
        let size = layout.header_size();
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.tid.to_le_bytes());
        buf.extend_from_slice(&self.msg_type.to_le_bytes());
        buf.extend_from_slice(&self.priority.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.front_len.to_le_bytes());
        buf.extend_from_slice(&self.middle_len.to_le_bytes());
        buf.extend_from_slice(&self.data_len.to_le_bytes());
        buf.extend_from_slice(&self.data_off.to_le_bytes());
        buf.extend_from_slice(&self.src.to_bytes());
        if layout == HeaderLayout::Legacy {
            let addr = self.src_addr.unwrap_or_else(PeerAddress::blank);
            buf.extend_from_slice(&addr.to_bytes());
        }
        buf.extend_from_slice(&self.compat_version.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        self.crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&self.crc.to_le_bytes());
        buf
    }

    /// Parse a header and return it with the CRC computed over its bytes.
    ///
    /// The caller compares the two before trusting any length field.
    pub fn decode(bytes: &[u8], layout: HeaderLayout) -> Result<(Self, u32), FrameError> {
        let size = layout.header_size();
        if bytes.len() < size {
            return Err(FrameError::TooShort {
                expected: size,
                actual: bytes.len(),
            });
        }

        let computed = crc32fast::hash(&bytes[..size - 4]);
        let mut at = 38;
        let src = EntityName::from_bytes(&bytes[at..at + ENTITY_NAME_WIRE_SIZE]).map_err(|_| {
            FrameError::TooShort {
                expected: size,
                actual: bytes.len(),
            }
        })?;
        at += ENTITY_NAME_WIRE_SIZE;
        let src_addr = match layout {
            HeaderLayout::Legacy => {
                let addr = PeerAddress::from_bytes(&bytes[at..at + ADDR_WIRE_SIZE]).ok();
                at += ADDR_WIRE_SIZE;
                addr
            }
            HeaderLayout::Modern => None,
        };

        let header = Self {
            seq: le64(bytes, 0),
            tid: le64(bytes, 8),
            msg_type: le16(bytes, 16),
            priority: le16(bytes, 18),
            version: le16(bytes, 20),
            front_len: le32(bytes, 22),
            middle_len: le32(bytes, 26),
            data_len: le32(bytes, 30),
            data_off: le32(bytes, 34),
            src,
            src_addr,
            compat_version: le16(bytes, at),
            crc: le32(bytes, at + 4),
        };
        Ok((header, computed))
    }

    /// Sum of the three section lengths.
    pub fn message_size(&self) -> u64 {
        u64::from(self.front_len) + u64::from(self.middle_len) + u64::from(self.data_len)
    }
}

/// Message footer as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footer {
    /// CRC of the front section.
    pub front_crc: u32,
    /// CRC of the middle section.
    pub middle_crc: u32,
    /// CRC of the data section.
    pub data_crc: u32,
    /// Signature words (zero when unsigned).
    pub sig: Signature,
    /// Footer flags.
    pub flags: u8,
}

impl Footer {
    /// Whether the sender finished writing the message.
    pub fn is_complete(&self) -> bool {
        self.flags & FOOTER_COMPLETE != 0
    }

    /// Whether section CRCs were computed.
    pub fn has_crc(&self) -> bool {
        self.flags & FOOTER_NOCRC == 0
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; sizes::FOOTER_SIZE] {
        let mut buf = [0u8; sizes::FOOTER_SIZE];
        buf[0..4].copy_from_slice(&self.front_crc.to_le_bytes());
        buf[4..8].copy_from_slice(&self.middle_crc.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_crc.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sig.sig1.to_le_bytes());
        buf[16..20].copy_from_slice(&self.sig.sig2.to_le_bytes());
        buf[20] = self.flags;
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < sizes::FOOTER_SIZE {
            return Err(FrameError::TooShort {
                expected: sizes::FOOTER_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            front_crc: le32(bytes, 0),
            middle_crc: le32(bytes, 4),
            data_crc: le32(bytes, 8),
            sig: Signature {
                sig1: le32(bytes, 12),
                sig2: le32(bytes, 16),
            },
            flags: bytes[20],
        })
    }
}

/// Plaintext covered by the message signature.
///
/// The header CRC is deliberately not part of it; peers on the wire expect
/// exactly `seq || front_crc || middle_crc || data_crc`.
pub fn signature_plaintext(seq: u64, footer: &Footer) -> [u8; sizes::SIGNED_PLAINTEXT_SIZE] {
    let mut buf = [0u8; sizes::SIGNED_PLAINTEXT_SIZE];
    buf[0..8].copy_from_slice(&seq.to_le_bytes());
    buf[8..12].copy_from_slice(&footer.front_crc.to_le_bytes());
    buf[12..16].copy_from_slice(&footer.middle_crc.to_le_bytes());
    buf[16..20].copy_from_slice(&footer.data_crc.to_le_bytes());
    buf
}

/// Signing context: the crypto service and the connection's secret.
#[derive(Clone, Copy)]
pub struct Signing<'a> {
    /// Crypto service computing signatures.
    pub crypto: &'a dyn CryptoService,
    /// Session secret keying the signatures.
    pub secret: &'a SessionSecret,
}

/// Encodes outgoing messages.
#[derive(Clone, Copy)]
pub struct FrameEncoder<'a> {
    /// Header layout.
    pub layout: HeaderLayout,
    /// Our own address (legacy layout only).
    pub own_addr: PeerAddress,
    /// Compute section CRCs.
    pub crc: bool,
    /// Sign messages when set.
    pub signing: Option<Signing<'a>>,
}

impl FrameEncoder<'_> {
    /// Encode `msg` as tag + header + sections + footer.
    pub fn encode(&self, msg: &Message) -> Vec<u8> {
        let mut footer = Footer {
            flags: FOOTER_COMPLETE,
            ..Default::default()
        };
        if self.crc {
            footer.front_crc = crc32fast::hash(&msg.front);
            footer.middle_crc = crc32fast::hash(&msg.middle);
            footer.data_crc = crc32fast::hash(&msg.data);
        } else {
            footer.flags |= FOOTER_NOCRC;
        }
        if let Some(signing) = self.signing {
            let plaintext = signature_plaintext(msg.seq(), &footer);
            footer.sig = signing.crypto.sign(signing.secret, &plaintext);
        }

        let mut header = Header::for_message(msg);
        if self.layout == HeaderLayout::Legacy {
            header.src_addr = Some(self.own_addr);
        }
        let header_bytes = header.encode(self.layout);

        let mut out = Vec::with_capacity(
            1 + header_bytes.len() + msg.payload_len() as usize + sizes::FOOTER_SIZE,
        );
        out.push(tags::MSG);
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&msg.front);
        out.extend_from_slice(&msg.middle);
        out.extend_from_slice(&msg.data);
        out.extend_from_slice(&footer.to_bytes());
        out
    }
}

/// Receive buffers posted ahead of time, keyed by transaction id.
///
/// A posted buffer is consumed by the first message carrying its tid; the
/// data section is read straight into it.
#[derive(Debug, Default)]
pub struct RxBufferPool {
    buffers: Mutex<HashMap<u64, BytesMut>>,
}

impl RxBufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a buffer for replies carrying `tid`.
    pub fn post(&self, tid: u64, buf: BytesMut) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.insert(tid, buf);
        }
    }

    /// Withdraw a posted buffer.
    pub fn revoke(&self, tid: u64) -> Option<BytesMut> {
        self.buffers.lock().ok()?.remove(&tid)
    }

    /// Whether a buffer is posted for `tid`.
    pub fn contains(&self, tid: u64) -> bool {
        self.buffers.lock().map(|b| b.contains_key(&tid)).unwrap_or(false)
    }
}

/// Split a fresh data buffer of `len` bytes at offset `off` into a head up
/// to the next page boundary, a page-multiple middle, and a tail.
///
/// Zero-length segments are omitted.
pub fn aligned_segments(len: usize, off: usize) -> Vec<usize> {
    let mut segments = Vec::with_capacity(3);
    let mut left = len;
    let misalign = off % PAGE_SIZE;
    if misalign != 0 && left > 0 {
        let head = (PAGE_SIZE - misalign).min(left);
        segments.push(head);
        left -= head;
    }
    let middle = left - left % PAGE_SIZE;
    if middle > 0 {
        segments.push(middle);
        left -= middle;
    }
    if left > 0 {
        segments.push(left);
    }
    segments
}

/// Outcome of reading one `MSG` frame.
#[derive(Debug)]
pub enum Decoded {
    /// A complete, verified message.
    Message(Message),
    /// The sender aborted the message mid-way; nothing to deliver.
    Aborted,
}

/// Decodes incoming messages for one connection.
#[derive(Clone, Copy)]
pub struct FrameDecoder<'a> {
    /// Header layout.
    pub layout: HeaderLayout,
    /// Verify signatures when set.
    pub signing: Option<Signing<'a>>,
    /// Posted receive buffers.
    pub rx_buffers: Option<&'a RxBufferPool>,
    /// Per-policy throttle, held for the message's lifetime.
    pub policy_throttle: Option<&'a Arc<dyn Throttle>>,
    /// Process-wide dispatch throttle, released by the caller after delivery.
    pub dispatch_throttle: Option<&'a Arc<dyn Throttle>>,
}

impl FrameDecoder<'_> {
    /// Read one message (the `MSG` tag has already been consumed).
    pub async fn read_message<R>(&self, sock: &mut SocketReader<R>) -> TransportResult<Decoded>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut raw = vec![0u8; self.layout.header_size()];
        sock.read_exact(&mut raw).await?;
        let (header, computed) = Header::decode(&raw, self.layout)?;
        if computed != header.crc {
            tracing::warn!(expected = header.crc, actual = computed, "bad header crc");
            return Err(FrameError::HeaderCrc {
                expected: header.crc,
                actual: computed,
            }
            .into());
        }
        check_len("front", header.front_len)?;
        check_len("middle", header.middle_len)?;
        check_len("data", header.data_len)?;

        tracing::trace!(
            seq = header.seq,
            msg_type = header.msg_type,
            front = header.front_len,
            middle = header.middle_len,
            data = header.data_len,
            "got envelope"
        );

        let size = header.message_size();
        let limit = self.message_limit();
        if size > limit {
            tracing::warn!(seq = header.seq, size, limit, "refusing oversized message");
            return Err(FrameError::MessageTooLarge { size, limit }.into());
        }
        if size > 0 {
            if let Some(throttle) = self.policy_throttle {
                throttle.acquire(size).await;
            }
            if let Some(throttle) = self.dispatch_throttle {
                throttle.acquire(size).await;
            }
        }

        let res = self.read_body(sock, &header).await;
        match res {
            Ok(Decoded::Message(mut msg)) => {
                if size > 0 {
                    if let Some(throttle) = self.policy_throttle {
                        msg.set_reservation(ThrottleReservation::new(Arc::clone(throttle), size));
                    }
                }
                Ok(Decoded::Message(msg))
            }
            other => {
                self.dethrottle(size);
                other
            }
        }
    }

    fn message_limit(&self) -> u64 {
        self.dispatch_throttle
            .map_or(MAX_MESSAGE_LEN, |throttle| throttle.max().min(MAX_MESSAGE_LEN))
    }

    fn dethrottle(&self, size: u64) {
        if size == 0 {
            return;
        }
        if let Some(throttle) = self.policy_throttle {
            throttle.release(size);
        }
        if let Some(throttle) = self.dispatch_throttle {
            throttle.release(size);
        }
    }

    async fn read_body<R>(
        &self,
        sock: &mut SocketReader<R>,
        header: &Header,
    ) -> TransportResult<Decoded>
    where
        R: AsyncRead + Unpin + Send,
    {
        let front = sock.read_vec(header.front_len as usize).await?;
        let middle = sock.read_vec(header.middle_len as usize).await?;
        let data = self.read_data(sock, header).await?;

        let mut raw = [0u8; sizes::FOOTER_SIZE];
        sock.read_exact(&mut raw).await?;
        let footer = Footer::from_bytes(&raw)?;
        if !footer.is_complete() {
            tracing::info!(
                seq = header.seq,
                front = front.len(),
                middle = middle.len(),
                data = data.len(),
                "message aborted by sender"
            );
            return Ok(Decoded::Aborted);
        }

        if footer.has_crc() {
            check_crc("front", footer.front_crc, &front)?;
            check_crc("middle", footer.middle_crc, &middle)?;
            check_crc("data", footer.data_crc, &data)?;
        }

        if let Some(signing) = self.signing {
            let plaintext = signature_plaintext(header.seq, &footer);
            if !signing.crypto.verify(signing.secret, &plaintext, footer.sig) {
                tracing::warn!(seq = header.seq, "message signature does not match contents");
                return Err(FrameError::BadSignature { seq: header.seq }.into());
            }
        }

        let mut msg = Message::new(header.msg_type, front)
            .with_middle(middle)
            .with_data(data, header.data_off)
            .with_tid(header.tid)
            .with_priority(header.priority.min(u16::from(u8::MAX)) as u8);
        msg.version = header.version;
        msg.compat_version = header.compat_version;
        msg.src = header.src;
        msg.set_seq(header.seq);
        Ok(Decoded::Message(msg))
    }

    async fn read_data<R>(&self, sock: &mut SocketReader<R>, header: &Header) -> TransportResult<Bytes>
    where
        R: AsyncRead + Unpin + Send,
    {
        let len = header.data_len as usize;
        if len == 0 {
            return Ok(Bytes::new());
        }

        if let Some(mut posted) = self.rx_buffers.and_then(|pool| pool.revoke(header.tid)) {
            tracing::debug!(tid = header.tid, len, "reading into posted rx buffer");
            posted.clear();
            posted.resize(len, 0);
            sock.read_exact(&mut posted).await?;
            return Ok(posted.freeze());
        }

        let mut buf = BytesMut::zeroed(len);
        let mut at = 0;
        for segment in aligned_segments(len, header.data_off as usize) {
            sock.read_exact(&mut buf[at..at + segment]).await?;
            at += segment;
        }
        Ok(buf.freeze())
    }
}

fn check_len(section: &'static str, len: u32) -> Result<(), FrameError> {
    if len > MAX_SECTION_LEN {
        return Err(FrameError::SectionTooLarge { section, len });
    }
    Ok(())
}

fn check_crc(section: &'static str, expected: u32, bytes: &[u8]) -> Result<(), FrameError> {
    let actual = crc32fast::hash(bytes);
    if actual != expected {
        tracing::warn!(section, expected, actual, "bad section crc");
        return Err(FrameError::SectionCrc {
            section,
            expected,
            actual,
        });
    }
    Ok(())
}
