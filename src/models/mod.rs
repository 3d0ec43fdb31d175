//! Model discovery
//!
//! Builds the read-only catalog of llama-server model artifacts and assigns
//! each one its dedicated port.

pub mod registry;

pub use registry::{ModelDescriptor, ModelRegistry, ModelRole, ScanSettings};
