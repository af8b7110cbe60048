//! Command-line definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "drowse",
    version,
    about = "Development environments in a Lima VM that go to sleep when you do"
)]
pub struct Cli {
    /// Log debug output to stderr.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage the development VM.
    #[command(subcommand)]
    Vm(VmCommand),

    /// Create and start an environment for a project directory.
    Create(CreateArgs),

    /// Run a command inside an environment.
    Run {
        /// Environment name.
        name: String,
        /// Command and arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Open an interactive shell inside an environment.
    Enter {
        /// Environment name.
        name: String,
        /// Shell to run (default: bash).
        #[arg(long, short)]
        shell: Option<String>,
    },

    /// Mark an environment as active so autosleep leaves it alone.
    Touch {
        /// Environment name.
        name: String,
    },

    /// Stop an environment's container.
    Stop {
        /// Environment name.
        name: String,
    },

    /// Remove an environment and release its ports.
    Rm {
        /// Environment name.
        name: String,
        /// Remove even if the container is running.
        #[arg(long, short)]
        force: bool,
    },

    /// List environments.
    Ls {
        /// Output JSON.
        #[arg(long, short)]
        json: bool,
    },

    /// List published ports.
    Ports {
        /// Only show this environment.
        #[arg(long, short)]
        env: Option<String>,
    },

    /// Inspect the raw state document.
    #[command(subcommand)]
    State(StateCommand),

    /// Background agents.
    #[command(subcommand)]
    Agent(AgentCommand),
}

#[derive(Debug, Subcommand)]
pub enum VmCommand {
    /// Create (if needed) and start the VM.
    Up(VmUpArgs),
    /// Stop the VM.
    Stop,
    /// Show the VM status.
    Status {
        /// Ask the VM supervisor instead of reading recorded state.
        #[arg(long)]
        live: bool,
        /// Output JSON.
        #[arg(long, short)]
        json: bool,
    },
}

#[derive(Debug, Args)]
pub struct VmUpArgs {
    /// Virtual CPUs.
    #[arg(long, default_value_t = 4)]
    pub cpus: u32,
    /// Memory, e.g. 4GiB.
    #[arg(long, default_value = "4GiB")]
    pub memory: String,
    /// Disk size, e.g. 100GiB.
    #[arg(long, default_value = "100GiB")]
    pub disk: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Environment name (also the container name).
    #[arg(long, short)]
    pub name: String,
    /// Container image.
    #[arg(long, short, default_value = "ubuntu:24.04")]
    pub image: String,
    /// Project directory to mount.
    #[arg(long, short, default_value = ".")]
    pub dir: PathBuf,
    /// Working directory inside the container.
    #[arg(long, short, default_value = drowse_core::DEFAULT_WORKDIR)]
    pub workdir: String,
    /// User name to record (default: $USER).
    #[arg(long, short)]
    pub user: Option<String>,
    /// Port to publish: HOST[:CONTAINER][/tcp|udp]. Repeatable.
    #[arg(long = "port", short = 'p')]
    pub ports: Vec<String>,
    /// Environment variable KEY=VALUE. Repeatable.
    #[arg(long = "env", short = 'e')]
    pub env: Vec<String>,
    /// Never autosleep this environment.
    #[arg(long)]
    pub persistent: bool,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// Print the state document as JSON.
    Show,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    /// Stop idle environments and the idle VM until interrupted.
    Autosleep(AutosleepArgs),
}

#[derive(Debug, Args)]
pub struct AutosleepArgs {
    /// Environment idle timeout, e.g. 15m.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub container_timeout: Option<Duration>,
    /// VM idle timeout, e.g. 30m.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub vm_timeout: Option<Duration>,
    /// Time between checks, e.g. 30s.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,
    /// Never stop the VM.
    #[arg(long)]
    pub no_stop_vm: bool,
}
