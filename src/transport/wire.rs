//! Handshake structures exchanged before a session is open.
//!
//! Connect request (33 bytes, followed by `authorizer_len` bytes):
//! ```text
//! +----------+-----------+------------+-------------+------------+
//! | Features | Host type | Global seq | Connect seq | Proto ver  |
//! | LE64     | LE32      | LE32       | LE32        | LE32       |
//! +----------+-----------+------------+-------------+------------+
//! | Auth protocol (LE32) | Auth len (LE32) | Flags (1 byte)      |
//! +----------------------+-----------------+---------------------+
//! ```
//!
//! Connect reply (26 bytes, followed by `authorizer_len` bytes):
//! ```text
//! +-----+----------+------------+-------------+-----------+----------+-------+
//! | Tag | Features | Global seq | Connect seq | Proto ver | Auth len | Flags |
//! | u8  | LE64     | LE32       | LE32        | LE32      | LE32     | u8    |
//! +-----+----------+------------+-------------+-----------+----------+-------+
//! ```

use crate::core::{CONNECT_FLAG_LOSSY, WireError, tags};

/// Encoded size of a [`ConnectRequest`] without its authorizer.
pub const CONNECT_REQUEST_SIZE: usize = 8 + 4 + 4 + 4 + 4 + 4 + 4 + 1;

/// Encoded size of a [`ConnectReply`] without its authorizer.
pub const CONNECT_REPLY_SIZE: usize = 1 + 8 + 4 + 4 + 4 + 4 + 1;

fn need(bytes: &[u8], expected: usize) -> Result<(), WireError> {
    if bytes.len() < expected {
        return Err(WireError::UnexpectedEof {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Sent by the connecting side, once per handshake round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectRequest {
    /// Features the sender supports.
    pub features: u64,
    /// Sender's entity type.
    pub host_type: u32,
    /// Sender's process-wide global sequence.
    pub global_seq: u32,
    /// Sender's attempt counter for this peer.
    pub connect_seq: u32,
    /// Protocol version the sender speaks.
    pub protocol_version: u32,
    /// Authorizer protocol id (0 if none).
    pub authorizer_protocol: u32,
    /// Length of the authorizer blob that follows.
    pub authorizer_len: u32,
    /// Connect flags, see [`CONNECT_FLAG_LOSSY`].
    pub flags: u8,
}

impl ConnectRequest {
    /// Whether the sender considers the channel lossy (informational).
    pub fn is_lossy(&self) -> bool {
        self.flags & CONNECT_FLAG_LOSSY != 0
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; CONNECT_REQUEST_SIZE] {
        let mut buf = [0u8; CONNECT_REQUEST_SIZE];
        buf[0..8].copy_from_slice(&self.features.to_le_bytes());
        buf[8..12].copy_from_slice(&self.host_type.to_le_bytes());
        buf[12..16].copy_from_slice(&self.global_seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.connect_seq.to_le_bytes());
        buf[20..24].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf[24..28].copy_from_slice(&self.authorizer_protocol.to_le_bytes());
        buf[28..32].copy_from_slice(&self.authorizer_len.to_le_bytes());
        buf[32] = self.flags;
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        need(bytes, CONNECT_REQUEST_SIZE)?;
        Ok(Self {
            features: le64(bytes, 0),
            host_type: le32(bytes, 8),
            global_seq: le32(bytes, 12),
            connect_seq: le32(bytes, 16),
            protocol_version: le32(bytes, 20),
            authorizer_protocol: le32(bytes, 24),
            authorizer_len: le32(bytes, 28),
            flags: bytes[32],
        })
    }
}

/// Sent by the accepting side in answer to every [`ConnectRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectReply {
    /// Reply tag, see [`tags`].
    pub tag: u8,
    /// Negotiated (or required) features.
    pub features: u64,
    /// Accepting side's global sequence, or the existing one on `RETRY_GLOBAL`.
    pub global_seq: u32,
    /// New connect sequence, or the existing one on `RETRY_SESSION`.
    pub connect_seq: u32,
    /// Protocol version the accepting side speaks.
    pub protocol_version: u32,
    /// Length of the authorizer reply that follows.
    pub authorizer_len: u32,
    /// Connect flags, see [`CONNECT_FLAG_LOSSY`].
    pub flags: u8,
}

impl ConnectReply {
    /// Whether the accepting side decided the channel is lossy.
    pub fn is_lossy(&self) -> bool {
        self.flags & CONNECT_FLAG_LOSSY != 0
    }

    /// Whether the tag opens the session.
    pub fn is_ready(&self) -> bool {
        self.tag == tags::READY || self.tag == tags::SEQ
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; CONNECT_REPLY_SIZE] {
        let mut buf = [0u8; CONNECT_REPLY_SIZE];
        buf[0] = self.tag;
        buf[1..9].copy_from_slice(&self.features.to_le_bytes());
        buf[9..13].copy_from_slice(&self.global_seq.to_le_bytes());
        buf[13..17].copy_from_slice(&self.connect_seq.to_le_bytes());
        buf[17..21].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf[21..25].copy_from_slice(&self.authorizer_len.to_le_bytes());
        buf[25] = self.flags;
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        need(bytes, CONNECT_REPLY_SIZE)?;
        Ok(Self {
            tag: bytes[0],
            features: le64(bytes, 1),
            global_seq: le32(bytes, 9),
            connect_seq: le32(bytes, 13),
            protocol_version: le32(bytes, 17),
            authorizer_len: le32(bytes, 21),
            flags: bytes[25],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_layout() {
        let req = ConnectRequest {
            features: 0x42,
            host_type: 4,
            global_seq: 10,
            connect_seq: 3,
            protocol_version: 9,
            authorizer_protocol: 2,
            authorizer_len: 48,
            flags: CONNECT_FLAG_LOSSY,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), 33);
        assert_eq!(hex::encode(&bytes[0..8]), "4200000000000000");
        assert_eq!(bytes[32], 1);
        assert!(req.is_lossy());
        assert_eq!(ConnectRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_connect_reply_ready() {
        let reply = ConnectReply {
            tag: tags::SEQ,
            connect_seq: 6,
            ..Default::default()
        };
        assert!(reply.is_ready());
        assert!(!reply.is_lossy());
        let parsed = ConnectReply::from_bytes(&reply.to_bytes()).unwrap();
        assert_eq!(parsed.connect_seq, 6);

        let wait = ConnectReply {
            tag: tags::WAIT,
            ..Default::default()
        };
        assert!(!wait.is_ready());
    }

    #[test]
    fn test_short_buffers() {
        assert_eq!(
            ConnectRequest::from_bytes(&[0u8; 10]),
            Err(WireError::UnexpectedEof {
                expected: CONNECT_REQUEST_SIZE,
                actual: 10
            })
        );
        assert!(ConnectReply::from_bytes(&[]).is_err());
    }
}
