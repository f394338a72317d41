use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use tunnel_forward::config::Config;
use tunnel_forward::store::{ForwardingMode, RuleStore};
use tunnel_forward::Forwarder;

#[derive(Parser, Debug)]
#[command(name = "tunnel-forward")]
#[command(author, version, about = "Port forwarding over site-to-site tunnels", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "FORWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Rule store directory
    #[arg(long, env = "FORWARD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List known tunnels
    Tunnels,
    /// Register a tunnel or change its remote forward IP
    Tunnel {
        name: String,
        #[arg(long)]
        remote_ip: String,
    },
    /// Show configured forwards and their state
    List,
    /// Forward ports, e.g. "80,443" or "8000-8010"
    Add { tunnel: String, ports: String },
    /// Stop forwarding ports
    Remove { tunnel: String, ports: String },
    /// Show or switch the forwarding mode (none, relay, haproxy, socat)
    Mode { mode: Option<ForwardingMode> },
    /// Regenerate and reload backend configuration
    Reload,
    /// Start every configured forward
    Start,
    /// Stop every running forward; rules are kept
    Stop,
    Restart,
    /// Start all forwards and keep them up until interrupted
    Run,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = &cli.state_dir {
        cfg.state_dir = dir.clone();
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        cfg.tracing_level()
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    let store = Arc::new(
        RuleStore::open(&cfg.state_dir)
            .with_context(|| format!("Failed to open rule store {}", cfg.state_dir.display()))?,
    );
    let forwarder = Forwarder::init(store.clone(), cfg)?;

    match cli.command {
        Command::Tunnels => {
            for record in store.all_tunnels()? {
                let ip = record.remote_forward_ip.as_deref().unwrap_or("-");
                let ports = record
                    .forwarded_ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                println!("{:<16} {:<16} {}", record.name, ip, ports);
            }
        }
        Command::Tunnel { name, remote_ip } => {
            store.set_remote_ip(&name, &remote_ip)?;
            println!("Tunnel {} forwards to {}", name, remote_ip);
        }
        Command::List => {
            let forwards = forwarder.list_forwards().await?;
            if forwards.is_empty() {
                println!("No port forwards configured");
            }
            for status in forwards {
                println!("{}", status);
            }
        }
        Command::Add { tunnel, ports } => {
            let report = forwarder.add_multiple(&tunnel, &ports).await?;
            println!("{}", report);
            if report.activated() == 0 {
                bail!("No ports were forwarded");
            }
        }
        Command::Remove { tunnel, ports } => {
            let report = forwarder.remove_multiple(&tunnel, &ports).await?;
            println!("{}", report);
            if !report.all_succeeded() {
                bail!("Some ports were not removed");
            }
        }
        Command::Mode { mode: None } => {
            println!("{}", forwarder.mode().await);
        }
        Command::Mode { mode: Some(mode) } => {
            let switch = forwarder.switch_mode(mode).await?;
            println!("{}", switch);
        }
        Command::Reload => println!("{}", forwarder.validate_and_reload().await?),
        Command::Start => println!("{}", forwarder.start_all().await?),
        Command::Stop => println!("{}", forwarder.stop_all().await?),
        Command::Restart => println!("{}", forwarder.restart_all().await?),
        Command::Run => run(&forwarder).await?,
    }

    Ok(())
}

/// Relay listeners live only as long as this process, so the daemon holds
/// them until Ctrl-C.
async fn run(forwarder: &Forwarder) -> anyhow::Result<()> {
    let mode = forwarder.mode().await;
    match forwarder.start_all().await {
        Ok(msg) => tracing::info!(mode = %mode, "{}", msg),
        Err(e) => tracing::warn!(error = %e, "Some forwards failed to start"),
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received");
        }

        res = terminate() => {
            res.context("Failed to listen for SIGTERM")?;
            tracing::info!("Terminate signal received");
        }
    }

    let msg = forwarder.stop_all().await?;
    tracing::info!("{}", msg);
    Ok(())
}

#[cfg(unix)]
async fn terminate() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> std::io::Result<()> {
    std::future::pending().await
}
