//! Point-to-point one-sided RDMA transfer over a connection-managed
//! fabric.
//!
//! A client and a server establish a reliable connection through an
//! asynchronous connection-management event stream, exchange the
//! {address, rkey, length} descriptors of their pinned scratch buffers
//! over a two-sided send/receive, and the client then performs a single
//! one-sided READ or WRITE against the server's advertised buffer before
//! disconnecting.
//!
//! The transport itself is abstracted behind the [`Fabric`] trait
//! ([`fabric`] module); [`SoftFabric`] is a TCP-backed implementation so
//! the protocol runs without an RDMA device. The connection lifecycle
//! (builder, descriptor exchange, transfer trigger, teardown) lives in
//! the [`conn`] module and is driven by [`Driver`].
//!
//! # Example
//!
//! ```no_run
//! use onesided::{Driver, SoftFabric, TransferConfig, TransferMode};
//!
//! # fn main() -> Result<(), onesided::TransferError> {
//! let cfg = TransferConfig::new(TransferMode::Read);
//! let server = Driver::server(SoftFabric::new(), cfg, 0)?;
//! println!("listening on port {}.", server.local_port());
//! let served = server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod conn;
pub mod error;
pub mod fabric;
pub mod proto;

pub use conn::{Driver, Role, State, TransferConfig};
pub use error::{FabricError, TransferError};
pub use fabric::soft::SoftFabric;
pub use fabric::{ConnId, Event, EventKind, Fabric};
pub use proto::{BufferDescriptor, ConnParams, TransferMode};
