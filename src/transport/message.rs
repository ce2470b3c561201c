//! Application messages carried by pipes.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::addr::EntityName;
use super::throttle::ThrottleReservation;
use crate::core::PRIO_DEFAULT;
use crate::pipe::ConnectionIdentity;

/// A message with three opaque sections.
///
/// Sections are reference-counted [`Bytes`], so cloning a message to keep
/// it on the sent list while it is being written does not copy payload.
/// The sequence number is assigned by the writer at transmission time.
#[derive(Clone, Default)]
pub struct Message {
    /// Application message type.
    pub msg_type: u16,
    /// Queueing priority; higher drains first.
    pub priority: u8,
    /// Encoding version of the front section.
    pub version: u16,
    /// Oldest version able to decode the front section.
    pub compat_version: u16,
    /// Transaction id, used to match pre-posted receive buffers.
    pub tid: u64,
    /// Logical sender.
    pub src: EntityName,
    /// Alignment hint for the data section.
    pub data_off: u32,
    /// Front section (typically the encoded payload).
    pub front: Bytes,
    /// Middle section.
    pub middle: Bytes,
    /// Bulk data section.
    pub data: Bytes,
    seq: u64,
    connection: Option<Arc<ConnectionIdentity>>,
    reservation: Option<Arc<ThrottleReservation>>,
}

impl Message {
    /// Create a message with a front section and default priority.
    pub fn new(msg_type: u16, front: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            priority: PRIO_DEFAULT,
            front: front.into(),
            ..Default::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the middle section.
    pub fn with_middle(mut self, middle: impl Into<Bytes>) -> Self {
        self.middle = middle.into();
        self
    }

    /// Set the data section and its alignment hint.
    pub fn with_data(mut self, data: impl Into<Bytes>, data_off: u32) -> Self {
        self.data = data.into();
        self.data_off = data_off;
        self
    }

    /// Set the transaction id.
    pub fn with_tid(mut self, tid: u64) -> Self {
        self.tid = tid;
        self
    }

    /// Sequence number (0 until transmitted or received).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    /// Connection the message arrived on.
    pub fn connection(&self) -> Option<&Arc<ConnectionIdentity>> {
        self.connection.as_ref()
    }

    pub(crate) fn set_connection(&mut self, identity: Arc<ConnectionIdentity>) {
        self.connection = Some(identity);
    }

    pub(crate) fn set_reservation(&mut self, reservation: ThrottleReservation) {
        self.reservation = Some(Arc::new(reservation));
    }

    /// Bytes held against the policy throttle while this message lives.
    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map_or(0, |r| r.bytes())
    }

    /// Total length of the three sections.
    pub fn payload_len(&self) -> u64 {
        (self.front.len() + self.middle.len() + self.data.len()) as u64
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type)
            .field("seq", &self.seq)
            .field("tid", &self.tid)
            .field("priority", &self.priority)
            .field("src", &self.src)
            .field("front", &self.front.len())
            .field("middle", &self.middle.len())
            .field("data", &self.data.len())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg(type={} seq={} {}+{}+{})",
            self.msg_type,
            self.seq,
            self.front.len(),
            self.middle.len(),
            self.data.len()
        )
    }
}
