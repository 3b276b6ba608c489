//! The per-connection resource bundle.

use log::warn;

use crate::fabric::{CqHandle, Fabric, MrHandle, QpHandle};
use crate::proto::BufferDescriptor;

/// Everything one connection owns: its queue pair, its completion queue,
/// and the three registered buffers of the protocol.
///
/// A `ResourceSet` exists exactly while its connection is between
/// successful setup and teardown. It is owned by the connection entry in
/// the state machine and never shared across connections.
#[derive(Debug)]
pub struct ResourceSet {
    pub(crate) qp: QpHandle,
    pub(crate) cq: CqHandle,
    /// READ destination / WRITE source; advertised to the peer.
    pub(crate) scratch: MrHandle,
    /// Holds the encoded local descriptor for the two-sided send.
    pub(crate) local_desc: MrHandle,
    /// Receives the peer's encoded descriptor.
    pub(crate) peer_desc: MrHandle,
    /// Decoded peer descriptor; `None` until the receive completion for
    /// `peer_desc` has been observed.
    pub(crate) peer: Option<BufferDescriptor>,
}

impl ResourceSet {
    /// Release everything in dependency order: memory regions first, then
    /// the queue pair, then the completion queue. Failures are logged,
    /// not propagated; teardown must run to the end.
    pub(crate) fn release<F: Fabric>(self, fabric: &mut F) {
        let regions = [
            ("scratch", self.scratch),
            ("local descriptor", self.local_desc),
            ("peer descriptor", self.peer_desc),
        ];
        for (name, mr) in regions {
            if let Err(e) = fabric.deregister_memory(mr) {
                warn!("failed to deregister {name} buffer: {e}");
            }
        }
        if let Err(e) = fabric.destroy_qp(self.qp) {
            warn!("failed to destroy queue pair: {e}");
        }
        if let Err(e) = fabric.destroy_cq(self.cq) {
            warn!("failed to destroy completion queue: {e}");
        }
    }
}
