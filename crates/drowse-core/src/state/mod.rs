//! Durable state: the document model, its file format and the locked
//! session API used to change it.

mod lock;
mod migrate;
mod model;
mod persist;
mod ports;
mod store;

pub use lock::StateLock;
pub use migrate::{stored_schema, upgrade};
pub use model::{
    normalize_project_path, EnvironmentRecord, HostInfo, MountRecord, ShimRecord, StateDocument,
    Status, UserRecord, VmRecord, CONTAINER_RUNTIME, CURRENT_SCHEMA, VM_BACKEND,
};
pub use persist::{Advisory, Loaded, StateFile};
pub use ports::{PortMapping, PortRegistry, Protocol, FIRST_EPHEMERAL_PORT};
pub use store::StateStore;

#[cfg(test)]
pub(crate) use model::fixtures;
