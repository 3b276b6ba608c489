//! Transfer Trigger: issues the one-sided operation and waits for its
//! completion with a bounded completion-queue poll.

use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use super::resources::ResourceSet;
use crate::error::TransferError;
use crate::fabric::{Fabric, WcOpcode, WcStatus};
use crate::proto::TransferMode;

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Issue the single one-sided operation against the peer's advertised
/// region and poll the completion queue until it completes or the
/// deadline passes. Returns the number of bytes moved.
///
/// Refuses to run until the peer descriptor has been absorbed: before the
/// receive completion the peer descriptor buffer is undefined remote
/// metadata.
pub(crate) fn execute<F: Fabric>(
    fabric: &mut F,
    res: &ResourceSet,
    mode: TransferMode,
    timeout: Duration,
) -> Result<u32, TransferError> {
    let peer = res.peer.ok_or(TransferError::DescriptorNotReady)?;
    match mode {
        TransferMode::Read => fabric.post_read(res.qp, res.scratch, &peer)?,
        TransferMode::Write => fabric.post_write(res.qp, res.scratch, &peer)?,
    }
    debug!("issued one-sided {mode} of {} bytes", peer.len);

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(wc) = fabric.poll_cq(res.cq)? {
            match wc.opcode {
                WcOpcode::RdmaRead | WcOpcode::RdmaWrite => {
                    return if wc.status == WcStatus::Success {
                        Ok(wc.byte_len)
                    } else {
                        Err(TransferError::WcFailure(wc.status))
                    };
                }
                // Completions of the descriptor exchange may still be
                // queued ahead of ours.
                WcOpcode::Send | WcOpcode::Recv => continue,
            }
        }
        if Instant::now() >= deadline {
            return Err(TransferError::CompletionTimeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}
