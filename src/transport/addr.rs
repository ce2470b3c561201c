//! Peer addresses and entity names.
//!
//! Wire format of a [`PeerAddress`] (23 bytes, fixed size so it can be read
//! before anything else is known about the peer):
//! ```text
//! +--------+-------------+---------------+------------------------+
//! | Family | Port (LE16) | Nonce (LE32)  | IP (16 bytes, v4 pads) |
//! +--------+-------------+---------------+------------------------+
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::WireError;

/// Encoded size of a [`PeerAddress`].
pub const ADDR_WIRE_SIZE: usize = 1 + 2 + 4 + 16;

/// Encoded size of an [`EntityName`].
pub const ENTITY_NAME_WIRE_SIZE: usize = 1 + 8;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Network address plus a nonce that tells restarted processes apart.
///
/// Ordering compares the socket address first, then the nonce. It is used
/// to break ties when two nodes connect to each other at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    /// Socket address the peer listens on.
    pub addr: SocketAddr,
    /// Per-process nonce.
    pub nonce: u32,
}

impl PeerAddress {
    /// Create a peer address.
    pub fn new(addr: SocketAddr, nonce: u32) -> Self {
        Self { addr, nonce }
    }

    /// An address with an unspecified IP and port zero.
    pub fn blank() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0)
    }

    /// Whether the IP part is unspecified (peer does not know its IP).
    pub fn is_blank_ip(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Replace the IP, keeping port and nonce.
    pub fn with_ip(self, ip: IpAddr) -> Self {
        Self::new(SocketAddr::new(ip, self.addr.port()), self.nonce)
    }

    /// Whether `other` names the same node with only the IP left blank.
    pub fn matches_blank(&self, other: &PeerAddress) -> bool {
        other.is_blank_ip() && self.port() == other.port() && self.nonce == other.nonce
    }

    /// Serialize to the fixed 23-byte wire form.
    pub fn to_bytes(&self) -> [u8; ADDR_WIRE_SIZE] {
        let mut buf = [0u8; ADDR_WIRE_SIZE];
        buf[1..3].copy_from_slice(&self.addr.port().to_le_bytes());
        buf[3..7].copy_from_slice(&self.nonce.to_le_bytes());
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf[0] = FAMILY_V4;
                buf[7..11].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf[0] = FAMILY_V6;
                buf[7..23].copy_from_slice(&ip.octets());
            }
        }
        buf
    }

    /// Parse from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < ADDR_WIRE_SIZE {
            return Err(WireError::UnexpectedEof {
                expected: ADDR_WIRE_SIZE,
                actual: bytes.len(),
            });
        }

        let port = u16::from_le_bytes([bytes[1], bytes[2]]);
        let nonce = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        let ip = match bytes[0] {
            FAMILY_V4 => IpAddr::V4(Ipv4Addr::new(bytes[7], bytes[8], bytes[9], bytes[10])),
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[7..23]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(WireError::BadAddressFamily(other)),
        };

        Ok(Self::new(SocketAddr::new(ip, port), nonce))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}

/// Well-known entity types, used as the connect request's host type.
pub mod entity_type {
    /// Monitor daemon.
    pub const MON: u32 = 0x01;
    /// Metadata server daemon.
    pub const MDS: u32 = 0x02;
    /// Object storage daemon.
    pub const OSD: u32 = 0x04;
    /// Client.
    pub const CLIENT: u32 = 0x08;
}

/// Logical name of a message source (type + number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityName {
    /// Entity type, see [`entity_type`].
    pub entity_type: u32,
    /// Entity number within its type.
    pub num: u64,
}

impl EntityName {
    /// Create an entity name.
    pub fn new(entity_type: u32, num: u64) -> Self {
        Self { entity_type, num }
    }

    /// Serialize to the 9-byte wire form.
    pub fn to_bytes(&self) -> [u8; ENTITY_NAME_WIRE_SIZE] {
        let mut buf = [0u8; ENTITY_NAME_WIRE_SIZE];
        buf[0] = self.entity_type as u8;
        buf[1..9].copy_from_slice(&self.num.to_le_bytes());
        buf
    }

    /// Parse from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < ENTITY_NAME_WIRE_SIZE {
            return Err(WireError::UnexpectedEof {
                expected: ENTITY_NAME_WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut num = [0u8; 8];
        num.copy_from_slice(&bytes[1..9]);
        Ok(Self::new(u32::from(bytes[0]), u64::from_le_bytes(num)))
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.entity_type {
            entity_type::MON => "mon",
            entity_type::MDS => "mds",
            entity_type::OSD => "osd",
            entity_type::CLIENT => "client",
            _ => "unknown",
        };
        write!(f, "{}.{}", kind, self.num)
    }
}
