//! Connection Builder: allocates a connection's full resource set.

use log::debug;

use super::machine::TransferConfig;
use super::resources::ResourceSet;
use crate::error::{FabricError, TransferError};
use crate::fabric::{Access, ConnId, CqHandle, Fabric, MrHandle, QpCaps, QpHandle};
use crate::proto::BufferDescriptor;

pub(crate) const CQ_DEPTH: u32 = 16;

/// Resources acquired so far; released in reverse order if a later step
/// fails.
#[derive(Default)]
struct Acquired {
    cq: Option<CqHandle>,
    qp: Option<QpHandle>,
    mrs: Vec<MrHandle>,
}

impl Acquired {
    fn abort<F: Fabric>(&mut self, fabric: &mut F) {
        for mr in self.mrs.drain(..).rev() {
            let _ = fabric.deregister_memory(mr);
        }
        if let Some(qp) = self.qp.take() {
            let _ = fabric.destroy_qp(qp);
        }
        if let Some(cq) = self.cq.take() {
            let _ = fabric.destroy_cq(cq);
        }
    }
}

/// Build the resource set for a connection whose device context is known.
///
/// Must run at most once per connection, before any send or receive is
/// posted. The initial receive for the peer descriptor is posted here, so
/// there is no window between "established" and "peer descriptor can
/// land". On failure every already-acquired resource is released and the
/// failing step is named in the error; the failure is fatal for this
/// connection only.
pub(crate) fn build<F: Fabric>(
    fabric: &mut F,
    id: ConnId,
    cfg: &TransferConfig,
) -> Result<ResourceSet, TransferError> {
    let mut acquired = Acquired::default();
    let result = try_build(fabric, id, cfg, &mut acquired);
    if result.is_err() {
        acquired.abort(fabric);
    }
    result
}

fn try_build<F: Fabric>(
    fabric: &mut F,
    id: ConnId,
    cfg: &TransferConfig,
    acquired: &mut Acquired,
) -> Result<ResourceSet, TransferError> {
    let step = |step: &'static str| move |source: FabricError| TransferError::Setup { step, source };

    let cq = fabric
        .create_cq(id, CQ_DEPTH)
        .map_err(step("completion queue creation"))?;
    acquired.cq = Some(cq);

    let qp = fabric
        .create_qp(id, cq, &QpCaps::default())
        .map_err(step("queue pair creation"))?;
    acquired.qp = Some(qp);

    let scratch = fabric
        .register_memory(
            id,
            cfg.buffer_len,
            Access::LOCAL_WRITE | Access::REMOTE_READ | Access::REMOTE_WRITE,
        )
        .map_err(step("scratch buffer registration"))?;
    acquired.mrs.push(scratch);
    if let Some(payload) = &cfg.payload {
        fabric
            .write_local(scratch, 0, payload)
            .map_err(step("scratch buffer pre-fill"))?;
    }

    let local_desc = fabric
        .register_memory(id, BufferDescriptor::WIRE_LEN, Access::empty())
        .map_err(step("local descriptor registration"))?;
    acquired.mrs.push(local_desc);

    let peer_desc = fabric
        .register_memory(id, BufferDescriptor::WIRE_LEN, Access::LOCAL_WRITE)
        .map_err(step("peer descriptor registration"))?;
    acquired.mrs.push(peer_desc);

    // Exactly one outstanding receive for the peer descriptor.
    fabric
        .post_receive(qp, peer_desc)
        .map_err(step("initial receive post"))?;

    debug!("conn {id:?}: resource set built ({} byte scratch)", cfg.buffer_len);
    Ok(ResourceSet {
        qp,
        cq,
        scratch,
        local_desc,
        peer_desc,
        peer: None,
    })
}
