mod cgroups;
mod config;
mod container;
mod error;
mod fs;
mod lifecycle;
mod state;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{CliOverrides, EnvOverrides, FileConfig};
use error::{Error, Result};
use lifecycle::LifecycleManager;
use state::StateStore;

/// A minimal container runtime built on Linux namespaces and cgroups v2
#[derive(Parser, Debug)]
#[command(name = "mun_os", author, version, about, long_about = None)]
struct Args {
    /// Print debug logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a container in the foreground
    Run(RunArgs),
    /// Start a container in the background
    Start(StartArgs),
    /// Stop a background container and remove its state
    Stop {
        name: String,
        /// Seconds to wait after SIGTERM before sending SIGKILL. The container's
        /// init only sees SIGTERM if the workload handles it, so other workloads
        /// are killed once this elapses
        #[arg(short, long, value_name = "SECS", default_value_t = lifecycle::DEFAULT_STOP_GRACE.as_secs())]
        time: u64,
    },
    /// List background containers
    List,
    /// Stop a background container and start it again from its config file
    Restart {
        name: String,
        /// Seconds to wait after SIGTERM before sending SIGKILL. The container's
        /// init only sees SIGTERM if the workload handles it, so other workloads
        /// are killed once this elapses
        #[arg(short, long, value_name = "SECS", default_value_t = lifecycle::DEFAULT_STOP_GRACE.as_secs())]
        time: u64,
    },
    /// Remove the state of a container whose process is gone
    #[command(alias = "remove")]
    Rm { name: String },
    /// Run a command inside a running background container
    Exec {
        name: String,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct LimitArgs {
    /// Memory limit in MB
    #[arg(long, value_name = "MB")]
    memory: Option<u64>,

    /// Maximum number of processes
    #[arg(long, value_name = "N")]
    pids: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Root filesystem for the container
    #[arg(long, value_name = "PATH")]
    rootfs: Option<PathBuf>,

    /// Hostname for the container
    #[arg(long)]
    hostname: Option<String>,

    #[command(flatten)]
    limits: LimitArgs,

    /// Command to execute in the container
    command: Option<String>,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// JSON config file
    #[arg(value_name = "CONFIG", required_unless_present = "config", conflicts_with = "config")]
    config_file: Option<PathBuf>,

    /// JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Container name, defaults to the config file name without extension
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    limits: LimitArgs,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match execute(args.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn execute(command: Command) -> Result<u8> {
    match command {
        Command::Run(args) => run(args),
        Command::Start(args) => start(args),
        Command::Stop { name, time } => {
            manager()?.stop(&name, Duration::from_secs(time))?;
            println!("Container '{}' stopped and state removed.", name);
            Ok(0)
        }
        Command::List => list(),
        Command::Restart { name, time } => {
            let env = EnvOverrides::from_env()?;
            let record = manager()?.restart(&name, &env, Duration::from_secs(time))?;
            println!("Container '{}' restarted (PID {}).", record.name, record.pid);
            Ok(0)
        }
        Command::Rm { name } => {
            manager()?.remove(&name)?;
            println!("Container '{}' removed.", name);
            Ok(0)
        }
        Command::Exec {
            name,
            command,
            args,
        } => Ok(exit_status(manager()?.exec(&name, &command, &args)?)),
    }
}

fn manager() -> Result<LifecycleManager> {
    Ok(LifecycleManager::new(StateStore::open_default()?))
}

fn run(args: RunArgs) -> Result<u8> {
    let file = args.config.as_deref().map(FileConfig::load).transpose()?;
    let cli = CliOverrides {
        hostname: args.hostname,
        rootfs_path: args.rootfs.as_deref().map(absolute).transpose()?,
        command: args.command,
        args: args.args,
        memory_limit_mb: args.limits.memory,
        pids_limit: args.limits.pids,
    };
    let spec = config::resolve(&cli, &EnvOverrides::from_env()?, file.as_ref())?;
    tracing::debug!(?spec, "resolved container spec");

    let code = manager()?.run(&spec)?;
    Ok(exit_status(code))
}

fn start(args: StartArgs) -> Result<u8> {
    let path = args
        .config
        .or(args.config_file)
        .ok_or_else(|| Error::config("start requires a config file"))?;
    let path = absolute(&path)?;
    let file = FileConfig::load(&path)?;
    let cli = CliOverrides {
        memory_limit_mb: args.limits.memory,
        pids_limit: args.limits.pids,
        ..Default::default()
    };
    let spec = config::resolve(&cli, &EnvOverrides::from_env()?, Some(&file))?;
    let name = args
        .name
        .unwrap_or_else(|| container_name(&path, &spec.hostname));

    let record = manager()?.start(&spec, &name, Some(&path))?;
    println!(
        "Container started in background: {} (PID {})",
        record.name, record.pid
    );
    Ok(0)
}

fn list() -> Result<u8> {
    let entries = manager()?.list()?;
    if entries.is_empty() {
        println!("No containers are running.");
        return Ok(0);
    }

    println!("{:<24} {:<10} {:<8} {}", "NAME", "STATUS", "PID", "CREATED");
    for entry in entries {
        println!(
            "{:<24} {:<10} {:<8} {}",
            entry.record.name,
            entry.status.to_string(),
            entry.record.pid,
            entry.record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(0)
}

/// Record name for a started container: the config file's stem, else its hostname.
fn container_name(config_path: &Path, hostname: &str) -> String {
    config_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| hostname.to_string())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| Error::config(format!("invalid path {:?}: {}", path, e)))
}

/// Exit status of the invocation for a workload exit code.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(error::EXIT_RUNTIME_FAILURE)
}
