//! Protocol-level data: the transfer mode, reliable-connection parameters,
//! and the fixed-layout buffer descriptor the two peers exchange.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Direction of the one-sided transfer. Fixed per process invocation and
/// threaded through every per-connection component; both peers must agree
/// on it for the transfer semantics to be consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// The client pulls the server's scratch buffer into its own.
    Read,
    /// The client pushes its scratch buffer into the server's.
    Write,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Read => "read",
            TransferMode::Write => "write",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a mode string is neither `read` nor `write`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transfer mode `{0}` (expected \"read\" or \"write\")")]
pub struct ModeParseError(String);

impl FromStr for TransferMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(TransferMode::Read),
            "write" => Ok(TransferMode::Write),
            other => Err(ModeParseError(other.to_owned())),
        }
    }
}

/// Reliable-connection parameters carried on connect and accept.
///
/// The transfer mode rides along as connection private data so that the
/// passive side can reject a peer whose mode does not match its own
/// before any resources are committed.
#[derive(Debug, Clone, Copy)]
pub struct ConnParams {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub mode: TransferMode,
}

impl ConnParams {
    pub fn new(mode: TransferMode) -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 7,
            rnr_retry_count: 7,
            mode,
        }
    }
}

/// Remote registered memory, as advertised to the peer: start address,
/// remote access key, and length.
///
/// This structure carries remote memory region information only and holds
/// no local resources. It is the payload of the descriptor exchange and
/// the target of the one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub addr: u64,
    pub rkey: u32,
    pub len: u32,
}

impl BufferDescriptor {
    /// On-the-wire size of an encoded descriptor.
    ///
    /// Layout: address (8B) + remote key (4B) + length (4B) + 8 reserved
    /// zero bytes, all integers big-endian.
    pub const WIRE_LEN: usize = 24;

    pub fn new(addr: u64, rkey: u32, len: u32) -> Self {
        Self { addr, rkey, len }
    }

    /// Serialize into `out`, which must hold at least [`Self::WIRE_LEN`]
    /// bytes. Reserved bytes are zeroed.
    pub fn encode(&self, out: &mut [u8]) -> Result<(), DescriptorError> {
        if out.len() < Self::WIRE_LEN {
            return Err(DescriptorError::Truncated(out.len()));
        }
        out[0..8].copy_from_slice(&self.addr.to_be_bytes());
        out[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        out[12..16].copy_from_slice(&self.len.to_be_bytes());
        out[16..Self::WIRE_LEN].fill(0);
        Ok(())
    }

    /// Deserialize from `buf`, which must hold at least [`Self::WIRE_LEN`]
    /// bytes. A descriptor advertising a zero-length buffer is rejected,
    /// as it cannot be the target of a transfer.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(DescriptorError::Truncated(buf.len()));
        }
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&buf[0..8]);
        let mut rkey = [0u8; 4];
        rkey.copy_from_slice(&buf[8..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[12..16]);

        let desc = Self {
            addr: u64::from_be_bytes(addr),
            rkey: u32::from_be_bytes(rkey),
            len: u32::from_be_bytes(len),
        };
        if desc.len == 0 {
            return Err(DescriptorError::ZeroLength);
        }
        Ok(desc)
    }
}

/// Descriptor codec error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// The buffer is shorter than the fixed wire length.
    #[error("descriptor buffer too short ({0} bytes)")]
    Truncated(usize),

    /// The peer advertised a zero-length buffer.
    #[error("descriptor advertises a zero-length buffer")]
    ZeroLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trip() {
        let desc = BufferDescriptor::new(0x5565_1122_3344, 394756, 16);
        let mut wire = [0xffu8; BufferDescriptor::WIRE_LEN];
        desc.encode(&mut wire).unwrap();
        assert_eq!(BufferDescriptor::decode(&wire).unwrap(), desc);
    }

    #[test]
    fn descriptor_reserved_bytes_zeroed() {
        let desc = BufferDescriptor::new(1, 2, 3);
        let mut wire = [0xffu8; BufferDescriptor::WIRE_LEN];
        desc.encode(&mut wire).unwrap();
        assert!(wire[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn descriptor_truncated() {
        let desc = BufferDescriptor::new(1, 2, 3);
        let mut short = [0u8; 16];
        assert_eq!(desc.encode(&mut short), Err(DescriptorError::Truncated(16)));
        assert_eq!(
            BufferDescriptor::decode(&short),
            Err(DescriptorError::Truncated(16))
        );
    }

    #[test]
    fn descriptor_zero_length_rejected() {
        let desc = BufferDescriptor { addr: 1, rkey: 2, len: 0 };
        let mut wire = [0u8; BufferDescriptor::WIRE_LEN];
        desc.encode(&mut wire).unwrap();
        assert_eq!(
            BufferDescriptor::decode(&wire),
            Err(DescriptorError::ZeroLength)
        );
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("read".parse::<TransferMode>().unwrap(), TransferMode::Read);
        assert_eq!("write".parse::<TransferMode>().unwrap(), TransferMode::Write);
        assert!("rread".parse::<TransferMode>().is_err());
    }
}
