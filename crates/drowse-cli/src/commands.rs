//! Command handlers.

use crate::cli::{
    AgentCommand, AutosleepArgs, Commands, CreateArgs, StateCommand, VmCommand, VmUpArgs,
};
use crate::output;
use anyhow::{bail, Context as _, Result};
use drowse_core::{
    Autosleep, Clock, Lifecycle, NewEnvironment, PortMapping, Settings, StatePaths, StateStore,
    SystemClock, VmEnsure,
};
use drowse_vm::{LimaSupervisor, PodmanRuntime, VmConfig, VmSupervisor};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a command needs, built once per invocation.
struct Context {
    settings: Settings,
    lifecycle: Lifecycle,
}

impl Context {
    fn load() -> Result<Self> {
        let paths = StatePaths::from_env()?;
        let settings = Settings::load(&paths)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = StateStore::with_clock(paths.clone(), clock.clone());
        let supervisor = Arc::new(LimaSupervisor::new(paths.lima_template.clone()));
        let runtime = Arc::new(PodmanRuntime::new());
        tracing::debug!(home = %paths.home.display(), "Using state directory");
        Ok(Self {
            settings,
            lifecycle: Lifecycle::new(store, supervisor, runtime, clock),
        })
    }

    fn store(&self) -> &StateStore {
        self.lifecycle.store()
    }
}

pub async fn dispatch(command: Commands) -> Result<ExitCode> {
    let ctx = Context::load()?;
    match command {
        Commands::Vm(cmd) => vm(&ctx, cmd).await?,
        Commands::Create(args) => create(&ctx, args).await?,
        Commands::Run { name, command } => {
            let output = ctx.lifecycle.run_in_environment(&name, &command).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            return Ok(exit_code(output.exit_code));
        }
        Commands::Enter { name, shell } => {
            let code = ctx.lifecycle.enter_environment(&name, shell.as_deref()).await?;
            return Ok(exit_code(code));
        }
        Commands::Touch { name } => {
            ctx.lifecycle.mark_active(&name)?;
            println!("Marked {name} active");
        }
        Commands::Stop { name } => {
            ctx.lifecycle.stop_environment(&name).await?;
            println!("Stopped {name}");
        }
        Commands::Rm { name, force } => {
            let removed = ctx.lifecycle.remove_environment(&name, force).await?;
            println!(
                "Removed {name} (released {} port{})",
                removed.ports.len(),
                if removed.ports.len() == 1 { "" } else { "s" }
            );
        }
        Commands::Ls { json } => {
            let doc = ctx.store().read_only()?.document;
            if json {
                let envs: Vec<_> = doc.environments().collect();
                println!("{}", serde_json::to_string_pretty(&envs)?);
            } else if doc.environments().next().is_none() {
                println!("No environments. Create one with 'drowse create --name <name>'");
            } else {
                print!(
                    "{}",
                    output::environments_table(doc.environments(), ctx.lifecycle.now())
                );
            }
        }
        Commands::Ports { env } => {
            let doc = ctx.store().read_only()?.document;
            match output::ports_table(doc.environments(), env.as_deref()) {
                Some(table) => print!("{table}"),
                None => match env {
                    Some(name) => println!("No port mappings for environment {name}"),
                    None => println!("No port mappings. Add some with 'drowse create -p <port>'"),
                },
            }
        }
        Commands::State(StateCommand::Show) => {
            let loaded = ctx.store().read_only()?;
            println!("{}", serde_json::to_string_pretty(&loaded.document)?);
        }
        Commands::Agent(AgentCommand::Autosleep(args)) => autosleep(ctx, args).await?,
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}

async fn vm(ctx: &Context, cmd: VmCommand) -> Result<()> {
    match cmd {
        VmCommand::Up(VmUpArgs { cpus, memory, disk }) => {
            let config = VmConfig::builder()
                .cpus(cpus)
                .memory(memory)
                .disk(disk)
                .build()?;
            let has_record = ctx.store().read_only()?.document.vm().is_some();
            if has_record {
                match ctx.lifecycle.ensure_vm_running().await? {
                    VmEnsure::AlreadyRunning => println!("VM is already running"),
                    VmEnsure::Started => println!("VM started"),
                }
            } else {
                let record = ctx.lifecycle.create_vm(&config).await?;
                println!(
                    "VM created ({} CPUs, {} memory, {} disk)",
                    record.cpus, record.memory, record.disk
                );
            }
        }
        VmCommand::Stop => {
            ctx.lifecycle.stop_vm().await?;
            println!("VM stopped");
        }
        VmCommand::Status { live, json } => {
            let status = if live {
                if ctx.lifecycle.supervisor().exists().await? {
                    Some(ctx.lifecycle.supervisor().live_status().await?.to_string())
                } else {
                    None
                }
            } else {
                ctx.store()
                    .read_only()?
                    .document
                    .vm()
                    .map(|vm| vm.status.to_string())
            };
            let name = ctx.lifecycle.supervisor().instance();
            if json {
                let value = serde_json::json!({
                    "name": name,
                    "status": status.as_deref().unwrap_or("not_found"),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                match status {
                    Some(status) => println!("VM {name}: {status}"),
                    None => println!("VM {name}: not found (run 'drowse vm up')"),
                }
            }
        }
    }
    Ok(())
}

fn parse_env_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("invalid --env {pair:?}, expected KEY=VALUE"),
        })
        .collect()
}

async fn create(ctx: &Context, args: CreateArgs) -> Result<()> {
    let ports = args
        .ports
        .iter()
        .map(|spec| spec.parse::<PortMapping>())
        .collect::<drowse_core::Result<Vec<_>>>()?;

    let mut new = NewEnvironment::new(args.name, args.image, args.dir);
    new.workdir = args.workdir;
    new.user = args.user;
    new.ports = ports;
    new.env = parse_env_pairs(&args.env)?;
    new.persistent = args.persistent;

    let record = ctx.lifecycle.create_environment(new).await?;
    println!("Created {} from {}", record.name, record.image);
    for mapping in &record.ports {
        println!("  {}", output::port_url(mapping));
    }
    println!("Enter it with 'drowse enter {}'", record.name);
    Ok(())
}

async fn autosleep(ctx: Context, args: AutosleepArgs) -> Result<()> {
    let mut settings = ctx.settings.autosleep;
    if let Some(timeout) = args.container_timeout {
        settings.container_timeout = timeout;
    }
    if let Some(timeout) = args.vm_timeout {
        settings.vm_timeout = timeout;
    }
    if let Some(interval) = args.poll_interval {
        settings.poll_interval = interval;
    }
    if args.no_stop_vm {
        settings.stop_vm = false;
    }

    let agent = Autosleep::new(ctx.lifecycle, settings);
    agent
        .run(CancellationToken::new())
        .await
        .context("autosleep agent failed")?;

    let stats = agent.stats();
    tracing::info!(
        cycles = stats.cycles(),
        environments_stopped = stats.environments_stopped(),
        vm_stops = stats.vm_stops(),
        failures = stats.stop_failures(),
        "Autosleep summary"
    );
    Ok(())
}
