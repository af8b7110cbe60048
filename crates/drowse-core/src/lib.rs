//! # drowse-core
//!
//! State and lifecycle management for drowse development environments.
//!
//! Everything drowse knows lives in one JSON document guarded by a
//! cross-process lock. CLI invocations mutate it through short exclusive
//! sessions; the autosleep agent reads it without the lock and only takes
//! the lock to commit a stop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       drowse-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │   Autosleep     │────▶│  IdlePolicy              │    │
//! │  │   - run()       │     │  - environment_is_idle() │    │
//! │  │   - tick()      │     │  - vm_is_idle()          │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │   Lifecycle     │────▶│  VmSupervisor /          │    │
//! │  │  - ensure_*()   │     │  ContainerRuntime        │    │
//! │  │  - create/stop  │     │  (from drowse-vm)        │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │   StateStore    │────▶│  state.lock (flock)      │    │
//! │  │  - session()    │     │  state.json (atomic)     │    │
//! │  │  - read_only()  │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use drowse_core::{StatePaths, StateStore, Status};
//!
//! # fn example() -> drowse_core::Result<()> {
//! let store = StateStore::new(StatePaths::from_env()?);
//!
//! // Exclusive read-modify-write; written back only if the closure succeeds.
//! let port = store.with_exclusive_session(|doc| doc.reserve_port("dev", 3000))?;
//! println!("dev got port {port}");
//!
//! // Lock-free snapshot.
//! let snapshot = store.read_only()?.document;
//! for env in snapshot.environments() {
//!     println!("{} {}", env.name, env.status);
//! }
//! # Ok(())
//! # }
//! ```

mod autosleep;
mod clock;
mod error;
mod idle;
mod lifecycle;
mod paths;
mod settings;
pub mod state;

pub use autosleep::{Autosleep, AutosleepStats, TickReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use idle::{format_idle, idle_duration, IdlePolicy};
pub use lifecycle::{
    container_spec, validate_name, Lifecycle, NewEnvironment, VmEnsure, DEFAULT_WORKDIR,
    HOST_HOME_MOUNT,
};
pub use paths::{StatePaths, HOME_ENV};
pub use settings::{AutosleepSettings, Settings};
pub use state::{
    Advisory, EnvironmentRecord, Loaded, PortMapping, StateDocument, StateStore, Status, VmRecord,
};
