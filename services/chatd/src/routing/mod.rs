//! Message routing engines. `p2p` owns the deliver-local / publish /
//! enqueue-offline decision tree; `group` owns membership-checked fan-out.
pub mod group;
pub mod p2p;
