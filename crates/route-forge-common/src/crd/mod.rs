//! Custom Resource projections consumed by the route engine
//!
//! Neither resource is owned by this project. The structs model only the
//! fields the engine reads; unknown fields are ignored on deserialization.

mod cilium_node;
mod virtual_machine;

pub use cilium_node::{CiliumNode, CiliumNodeSpec, NodeAddress, CILIUM_INTERNAL_IP};
pub use virtual_machine::{VirtualMachine, VirtualMachineSpec, VirtualMachineStatus};
