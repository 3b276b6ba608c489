//! The fabric interface: the minimal connection-manager and verbs surface
//! the transfer core drives.
//!
//! The core never talks to a concrete RDMA library directly; everything it
//! needs from the transport (asynchronous connection-management events,
//! queue pair and completion queue lifecycles, memory registration and
//! posted operations) is expressed by the [`Fabric`] trait. The crate
//! ships one implementation, the TCP-backed [`soft::SoftFabric`], which
//! lets the protocol run and be tested without an RDMA device.

pub mod soft;

use std::time::Duration;

use thiserror::Error;

use crate::error::FabricError;
use crate::proto::{BufferDescriptor, ConnParams, TransferMode};

macro_rules! define_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(pub(crate) u64);
    };
}

define_handle! {
    /// Opaque handle of one connection attempt or established connection.
    ///
    /// Created on outbound resolve (client) or on an inbound connect
    /// request (server); destroyed exactly once, after teardown.
    ConnId
}

define_handle! {
    /// Opaque handle of a queue pair.
    QpHandle
}

define_handle! {
    /// Opaque handle of a completion queue.
    CqHandle
}

define_handle! {
    /// Opaque handle of a registered memory region.
    MrHandle
}

/// Memory registration access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    /// Receives may land in the region.
    pub const LOCAL_WRITE: Access = Access(1);
    /// The peer may READ from the region.
    pub const REMOTE_READ: Access = Access(1 << 1);
    /// The peer may WRITE into the region.
    pub const REMOTE_WRITE: Access = Access(1 << 2);

    pub fn empty() -> Access {
        Access(0)
    }

    pub fn allows(self, rights: Access) -> bool {
        self.0 & rights.0 == rights.0
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

/// Queue pair capacity attributes.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        QpCaps {
            max_send_wr: 16,
            max_recv_wr: 16,
        }
    }
}

/// One event from the fabric's event stream, tagged with the connection it
/// pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub conn: ConnId,
    pub kind: EventKind,
}

/// The kinds of events the state machine consumes.
///
/// Connection-management progress notifications plus the one completion
/// the machine must react to: the peer-descriptor receive. Other
/// completions (sends, one-sided operations) surface only through
/// [`Fabric::poll_cq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    /// An inbound connect request; `conn` is the identifier of the new
    /// connection, and the peer's transfer mode rides as private data.
    ConnectRequest { peer_mode: TransferMode },
    ConnectError,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    /// A posted receive on this connection has completed.
    RecvComplete,
}

/// Opcode of a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaRead,
    RdmaWrite,
}

/// Status of a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// Operation completed successfully; the buffers it refers to are
    /// ready to be reused.
    #[error("success")]
    Success,

    /// The inbound message did not fit the posted receive buffer.
    #[error("local length error")]
    LocalLengthError,

    /// The remote side refused the access (bad rkey, bad bounds, or
    /// insufficient access rights).
    #[error("remote access error")]
    RemoteAccessError,

    /// The work request was flushed before it could complete.
    #[error("work request flushed")]
    Flushed,
}

/// One work completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    pub opcode: WcOpcode,
    pub status: WcStatus,
    pub byte_len: u32,
}

impl Wc {
    pub fn ok(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// The external collaborator interface the transfer core drives.
///
/// Implementations own all transport resources; the core sees opaque
/// handles only. Registered buffers are allocated and pinned by the
/// fabric at registration time and stay at a fixed size for their whole
/// lifetime; the core accesses them through [`read_local`] and
/// [`write_local`].
///
/// [`read_local`]: Fabric::read_local
/// [`write_local`]: Fabric::write_local
pub trait Fabric {
    // ---- Connection management ----

    /// Bind a wildcard address and listen. `port` 0 picks an ephemeral
    /// port; the bound port is returned alongside the listener's id.
    fn listen(&mut self, port: u16) -> Result<(ConnId, u16), FabricError>;

    /// Begin address resolution toward `host:port`. The outcome arrives
    /// asynchronously as an `AddrResolved` or `AddrError` event.
    fn resolve_addr(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<ConnId, FabricError>;

    /// Begin route resolution for a connection whose address has been
    /// resolved. Outcome: `RouteResolved` or `RouteError` event.
    fn resolve_route(&mut self, conn: ConnId, timeout: Duration) -> Result<(), FabricError>;

    /// Issue the connect request. Outcome: `Established`, `ConnectError`
    /// or `Rejected` event.
    fn connect(&mut self, conn: ConnId, params: &ConnParams) -> Result<(), FabricError>;

    /// Accept a pending inbound connect request. Outcome: `Established`
    /// on both sides.
    fn accept(&mut self, conn: ConnId, params: &ConnParams) -> Result<(), FabricError>;

    /// Reject a pending inbound connect request; the initiator observes
    /// a `Rejected` event.
    fn reject(&mut self, conn: ConnId) -> Result<(), FabricError>;

    /// Initiate a disconnect. Both sides observe `Disconnected`.
    fn disconnect(&mut self, conn: ConnId) -> Result<(), FabricError>;

    /// Free the connection identifier. Safe to call on an identifier the
    /// fabric no longer knows.
    fn destroy_id(&mut self, conn: ConnId) -> Result<(), FabricError>;

    // ---- Resource lifecycle ----

    fn create_cq(&mut self, conn: ConnId, depth: u32) -> Result<CqHandle, FabricError>;

    fn create_qp(
        &mut self,
        conn: ConnId,
        cq: CqHandle,
        caps: &QpCaps,
    ) -> Result<QpHandle, FabricError>;

    /// Allocate and pin a zeroed buffer of `len` bytes, registered with
    /// the given access rights.
    fn register_memory(
        &mut self,
        conn: ConnId,
        len: usize,
        access: Access,
    ) -> Result<MrHandle, FabricError>;

    fn deregister_memory(&mut self, mr: MrHandle) -> Result<(), FabricError>;

    fn destroy_qp(&mut self, qp: QpHandle) -> Result<(), FabricError>;

    fn destroy_cq(&mut self, cq: CqHandle) -> Result<(), FabricError>;

    // ---- Local buffer access ----

    /// The {address, rkey, length} descriptor of a registered region,
    /// as advertised to the peer.
    fn descriptor(&self, mr: MrHandle) -> Result<BufferDescriptor, FabricError>;

    fn write_local(&mut self, mr: MrHandle, offset: usize, data: &[u8])
        -> Result<(), FabricError>;

    /// Copy out as much of the region as `out` can hold; returns the
    /// number of bytes copied.
    fn read_local(&self, mr: MrHandle, out: &mut [u8]) -> Result<usize, FabricError>;

    // ---- Data path ----

    /// Post a two-sided send carrying the region's contents.
    fn post_send(&mut self, qp: QpHandle, mr: MrHandle) -> Result<(), FabricError>;

    /// Post a receive that the peer's next send will land in.
    fn post_receive(&mut self, qp: QpHandle, mr: MrHandle) -> Result<(), FabricError>;

    /// Post a one-sided READ pulling `remote.len` bytes from the peer's
    /// advertised region into `local`.
    fn post_read(
        &mut self,
        qp: QpHandle,
        local: MrHandle,
        remote: &BufferDescriptor,
    ) -> Result<(), FabricError>;

    /// Post a one-sided WRITE pushing `remote.len` bytes from `local`
    /// into the peer's advertised region.
    fn post_write(
        &mut self,
        qp: QpHandle,
        local: MrHandle,
        remote: &BufferDescriptor,
    ) -> Result<(), FabricError>;

    /// Non-blockingly poll one work completion.
    fn poll_cq(&mut self, cq: CqHandle) -> Result<Option<Wc>, FabricError>;

    // ---- Event source ----

    /// Block until the next event. The only indefinitely blocking call
    /// in the system.
    fn next_event(&mut self) -> Result<Event, FabricError>;
}
