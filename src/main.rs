use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use espwizard_rs::config::{Config, ConfigOverrides};
use espwizard_rs::daemon::{run_daemon_with_shutdown, DaemonOptions};
use espwizard_rs::dispatch::{Command, UdpCommandDispatcher};
use espwizard_rs::link_core::{Core, CoreSettings};
use espwizard_rs::peer::parse_ipv4;
use espwizard_rs::telemetry::LinkStats;
use tokio::sync::Notify;

#[derive(Parser, Debug)]
#[command(name = "espwizard-rs", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the link core and local control API
    Daemon {
        /// Control API address (defaults to client_url from config)
        #[arg(long = "http-addr")]
        http_addr: Option<String>,
        /// Start the device listener on this IP immediately
        #[arg(long = "bind-ip")]
        bind_ip: Option<String>,
    },
    /// Broadcast the discovery probe and print the devices that answer
    Discover {
        #[arg(long)]
        broadcast: String,
        /// How long to collect replies
        #[arg(long = "wait-ms", default_value_t = 2000)]
        wait_ms: u64,
    },
    /// Send one command to a device as a datagram
    Send {
        #[arg(long)]
        host: String,
        #[arg(long)]
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { http_addr, bind_ip } => {
            let cfg = Config::load_with_overrides(
                &cli.config,
                ConfigOverrides {
                    bind_ip: bind_ip.clone(),
                    ..Default::default()
                },
            )?;
            let bind_ip = match bind_ip.as_deref() {
                Some(ip) => Some(parse_ipv4(ip).context("--bind-ip")?),
                None => None,
            };
            run_daemon(cfg, http_addr, bind_ip).await?;
        }
        Commands::Discover { broadcast, wait_ms } => {
            let cfg = Config::load(&cli.config)?;
            espwizard_rs::logging::init_log_file_quiet(&cli_log_path(&cfg))?;
            let broadcast = parse_ipv4(&broadcast).context("--broadcast")?;
            discover(&cfg, broadcast, Duration::from_millis(wait_ms)).await?;
        }
        Commands::Send { host, command } => {
            let cfg = Config::load(&cli.config)?;
            espwizard_rs::logging::init_log_file_quiet(&cli_log_path(&cfg))?;
            let host = parse_ipv4(&host).context("--host")?;
            let command = Command::parse(&command).context("--command")?;
            let mut udp =
                UdpCommandDispatcher::open(cfg.discovery_port, Arc::new(LinkStats::default()))
                    .await
                    .context("open command socket")?;
            let sent = udp.send(host, &command).await;
            udp.close().await;
            sent.with_context(|| format!("send {command} to {host}"))?;
            println!("sent {command} to {host}:{}", cfg.discovery_port);
        }
    }

    Ok(())
}

async fn run_daemon(
    cfg: Config,
    http_addr: Option<String>,
    bind_ip: Option<std::net::Ipv4Addr>,
) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            espwizard_rs::logging::info("interrupt received, shutting down");
            signal.notify_waiters();
        }
    });

    run_daemon_with_shutdown(
        cfg,
        DaemonOptions {
            http_addr,
            start_listener: bind_ip.is_some(),
            bind_ip,
            ..Default::default()
        },
        shutdown,
    )
    .await
}

async fn discover(cfg: &Config, broadcast: std::net::Ipv4Addr, wait: Duration) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    let (core, join) = Core::spawn(CoreSettings::from_config(cfg), shutdown.clone());

    core.begin_search(Some(broadcast))
        .await
        .with_context(|| format!("discovery on {broadcast}"))?;
    tokio::time::sleep(wait).await;
    let peers = core.peers().await.context("read discovered peers")?;
    core.cancel_search().await.context("cancel discovery")?;

    println!("{}", serde_json::to_string_pretty(&peers)?);

    shutdown.notify_waiters();
    join.await.context("join core task")?;
    Ok(())
}

// One-shot commands log beside the daemon log without truncating it.
fn cli_log_path(cfg: &Config) -> PathBuf {
    cfg.log_path().with_file_name("espwizard-cli.log")
}
