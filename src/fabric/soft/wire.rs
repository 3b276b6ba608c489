//! Wire framing for the soft fabric: length-prefixed JSON frames over a
//! byte stream.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::proto::TransferMode;

/// Upper bound on a frame body; anything larger is a corrupt stream.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Everything that travels on a soft-fabric connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// Connect request; the transfer mode is the private data.
    Hello { mode: TransferMode },
    /// Connect request accepted.
    HelloAck,
    /// Connect request rejected.
    Reject,
    /// Two-sided send; consumed by the oldest posted receive.
    Send { payload: Vec<u8> },
    /// One-sided READ request against the peer's advertised region.
    Read { addr: u64, rkey: u32, len: u32 },
    /// Data answering a `Read`.
    ReadResp { data: Vec<u8> },
    /// The `Read` target was invalid or not readable.
    ReadNak,
    /// One-sided WRITE carrying its payload.
    Write { addr: u64, rkey: u32, len: u32, data: Vec<u8> },
    /// The `Write` has been placed in the target region.
    WriteAck,
    /// The `Write` target was invalid or not writable.
    WriteNak,
    /// Voluntary disconnect.
    Bye,
}

pub(crate) fn write_frame<W: Write>(stream: &mut W, frame: &Frame) -> io::Result<()> {
    let body = serde_json::to_vec(frame)?;
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

pub(crate) fn read_frame<R: Read>(stream: &mut R) -> io::Result<Frame> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized frame ({len} bytes)"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
