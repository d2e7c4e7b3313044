use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fleet::manager::FleetManager;
use fleet_registry::{HostEntry, Registry};
use tracing_subscriber::EnvFilter;

/// fleet: smoke-test CLI over the remote execution fleet core.
///
/// This is a thin, explicitly out-of-scope operator surface — the
/// production integration point is [`fleet::manager::FleetManager`] used
/// as a library.
#[derive(Debug, Parser)]
#[command(name = "fleet")]
struct Cli {
    /// Path to the hosts registry JSON file.
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Path to the `fleet-remote` binary to deploy.
    #[arg(long)]
    remote_binary: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a new host without connecting.
    Add {
        name: String,
        ssh_host: String,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        #[arg(long)]
        ssh_key_path: Option<String>,
        #[arg(long, default_value_t = 8765)]
        remote_port: u16,
        #[arg(long)]
        auth_token: Option<String>,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Drop a host from the registry, tearing down any live session.
    Remove { name: String },
    /// Connect (or reconnect) to a host.
    Connect { name: String },
    /// Tear down a host's live session, keeping its registry entry.
    Disconnect { name: String },
    /// List every registered host and its live status.
    List,
    /// Run a shell command on a host, connecting implicitly first.
    Exec {
        name: String,
        command: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let registry_path = match cli.registry {
        Some(p) => p,
        None => Registry::default_path()?,
    };
    let registry = Registry::load(&registry_path)?;
    let manager = FleetManager::new(registry, cli.remote_binary);

    match cli.command {
        Command::Add { name, ssh_host, ssh_port, ssh_key_path, remote_port, auth_token, workspace } => {
            let mut entry = HostEntry::new(ssh_host);
            entry.ssh_port = ssh_port;
            entry.ssh_key_path = ssh_key_path;
            entry.remote_port = remote_port;
            entry.auth_token = auth_token;
            entry.workspace = workspace;
            manager.add(&name, entry).await?;
            println!("added {name}");
        }
        Command::Remove { name } => {
            let removed = manager.remove(&name).await?;
            println!("{}", if removed { format!("removed {name}") } else { format!("no such host: {name}") });
        }
        Command::Connect { name } => {
            let session_id = manager.connect(&name).await?;
            println!("connected {name} (session: {session_id})");
        }
        Command::Disconnect { name } => {
            let disconnected = manager.disconnect(&name).await?;
            println!("{}", if disconnected { format!("disconnected {name}") } else { format!("{name} was not connected") });
        }
        Command::List => {
            for host in manager.list_hosts().await {
                println!(
                    "{:<20} {:<30} {:<10} {}",
                    host.name,
                    host.ssh_host,
                    if host.connected { "connected" } else { "disconnected" },
                    host.workspace.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Exec { name, command, timeout_secs } => {
            let result = manager.exec(&name, &command, Duration::from_secs(timeout_secs)).await?;
            if let Some(output) = &result.output {
                print!("{output}");
            }
            if let Some(error) = &result.error {
                eprintln!("{error}");
            }
            std::process::exit(if result.success { 0 } else { 1 });
        }
    }

    Ok(())
}
