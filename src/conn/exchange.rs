//! Descriptor Exchange: advertise the local scratch buffer, absorb the
//! peer's advertisement.
//!
//! Both directions are independent and may complete in either order; only
//! the *receive* completion makes the peer descriptor buffer valid, which
//! is why [`absorb_peer_descriptor`] must not run before that completion
//! has been observed.

use log::debug;

use super::resources::ResourceSet;
use crate::error::TransferError;
use crate::fabric::Fabric;
use crate::proto::BufferDescriptor;

/// Encode the scratch buffer's {address, rkey, length} into the local
/// descriptor buffer and post the two-sided send carrying it.
pub(crate) fn send_local_descriptor<F: Fabric>(
    fabric: &mut F,
    res: &ResourceSet,
) -> Result<(), TransferError> {
    let desc = fabric.descriptor(res.scratch)?;
    let mut wire = [0u8; BufferDescriptor::WIRE_LEN];
    desc.encode(&mut wire)?;
    fabric.write_local(res.local_desc, 0, &wire)?;
    fabric.post_send(res.qp, res.local_desc)?;
    debug!("sent local descriptor {desc:?}");
    Ok(())
}

/// Decode the peer descriptor buffer and record the result in the
/// resource set. Valid only after the corresponding receive completion.
pub(crate) fn absorb_peer_descriptor<F: Fabric>(
    fabric: &F,
    res: &mut ResourceSet,
) -> Result<BufferDescriptor, TransferError> {
    let mut wire = [0u8; BufferDescriptor::WIRE_LEN];
    fabric.read_local(res.peer_desc, &mut wire)?;
    let desc = BufferDescriptor::decode(&wire)?;
    res.peer = Some(desc);
    debug!("peer descriptor received: {desc:?}");
    Ok(desc)
}
