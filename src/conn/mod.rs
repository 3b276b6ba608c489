//! The connection core: state machine, resource builder, descriptor
//! exchange, transfer trigger and teardown.

pub(crate) mod builder;
pub(crate) mod exchange;
pub mod machine;
pub mod resources;
pub(crate) mod transfer;

pub use machine::{Driver, Role, State, TransferConfig};
pub use resources::ResourceSet;
