//! Error taxonomy: fabric-level failures and transfer-core failures.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::conn::machine::State;
use crate::fabric::{EventKind, WcStatus};
use crate::proto::DescriptorError;

/// Errors surfaced by a [`Fabric`](crate::fabric::Fabric) implementation.
#[derive(Debug, Error)]
pub enum FabricError {
    /// I/O failure on the underlying transport.
    #[error("fabric I/O error")]
    Io(#[from] io::Error),

    /// The connection handle does not name a live connection.
    #[error("unknown connection handle")]
    UnknownConn,

    /// The queue pair handle does not name a live queue pair.
    #[error("unknown queue pair handle")]
    UnknownQp,

    /// The completion queue handle does not name a live completion queue.
    #[error("unknown completion queue handle")]
    UnknownCq,

    /// The memory region handle does not name a registered region.
    #[error("unknown memory region handle")]
    UnknownMr,

    /// `accept`/`reject` was called without a pending connect request.
    #[error("no pending connect request for this connection")]
    NoPendingRequest,

    /// The connection is not in a state that permits the operation.
    #[error("connection is not ready for this operation")]
    NotConnected,

    /// The local buffer cannot cover the remote advertised length.
    #[error("local buffer ({local} bytes) does not cover remote length ({remote} bytes)")]
    LengthMismatch { local: usize, remote: usize },

    /// A local buffer access fell outside the registered region.
    #[error("buffer access out of bounds")]
    OutOfBounds,

    /// The event channel has shut down.
    #[error("event channel closed")]
    ChannelClosed,
}

/// Errors surfaced by the connection state machine and its components.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Address resolution reported an error event.
    #[error("address resolution failed")]
    AddrResolution,

    /// Route resolution reported an error event.
    #[error("route resolution failed")]
    RouteResolution,

    /// The connection attempt failed (no listener, unreachable, ...).
    #[error("connection attempt failed")]
    Connect,

    /// The peer rejected the connect request.
    #[error("connection rejected by peer")]
    Rejected,

    /// The RDMA device was removed while the connection was live.
    #[error("device removed")]
    DeviceRemoval,

    /// A resource-acquisition step failed during connection setup.
    /// Already-acquired resources have been released.
    #[error("connection setup failed during {step}")]
    Setup {
        step: &'static str,
        #[source]
        source: FabricError,
    },

    /// A fabric operation outside of setup failed.
    #[error("fabric operation failed")]
    Fabric(#[from] FabricError),

    /// The peer descriptor could not be encoded or decoded.
    #[error("malformed buffer descriptor")]
    Descriptor(#[from] DescriptorError),

    /// A transfer was triggered before the peer descriptor arrived.
    #[error("peer descriptor not yet received")]
    DescriptorNotReady,

    /// The state machine has no transition for this (state, event) pair.
    /// This is a protocol invariant violation and is process-fatal.
    #[error("no transition for event {event:?} in state {state:?}")]
    UnexpectedEvent { state: State, event: EventKind },

    /// The one-sided operation's completion was not observed in time.
    #[error("transfer completion not observed within {0:?}")]
    CompletionTimeout(Duration),

    /// A work completion carried a failure status.
    #[error("work completion failed: {0}")]
    WcFailure(WcStatus),

    /// The configured pre-fill payload does not fit the scratch buffer.
    #[error("pre-fill payload ({payload} bytes) exceeds the scratch buffer ({buffer} bytes)")]
    PayloadTooLarge { payload: usize, buffer: usize },

    /// The scratch buffer length must be nonzero.
    #[error("scratch buffer length must be nonzero")]
    EmptyBuffer,
}
