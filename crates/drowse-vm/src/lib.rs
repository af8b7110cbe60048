//! # drowse-vm
//!
//! Backend adapters for drowse: the VM supervisor (Lima) and the container
//! runtime (Podman running inside the Lima instance).
//!
//! The core crate only talks to the [`VmSupervisor`] and [`ContainerRuntime`]
//! traits, so tests can swap in fakes and nothing outside this crate knows
//! how `limactl` or `podman` are invoked.
//!
//! ## Quick Start
//!
//! ```no_run
//! use drowse_vm::{LimaSupervisor, VmConfig, VmSupervisor};
//!
//! # async fn example() -> drowse_vm::Result<()> {
//! let supervisor = LimaSupervisor::new("/home/me/.drowse/lima.yaml");
//! let config = VmConfig::builder().cpus(4).memory("8GiB").build()?;
//!
//! supervisor.start(&config).await?;
//! println!("VM is {}", supervisor.live_status().await?);
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod error;
mod runtime;
mod supervisor;

pub use command::ExecOutput;
pub use config::{config_checksum, VmConfig, VmConfigBuilder};
pub use error::{BackendError, Result};
pub use runtime::{BindMount, ContainerRuntime, ContainerSpec, PodmanRuntime, PublishedPort};
pub use supervisor::{LimaSupervisor, LiveStatus, VmSupervisor, INSTANCE_NAME};
