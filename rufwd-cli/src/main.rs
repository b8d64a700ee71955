//! Rufwd CLI
//!
//! A command-line front end for the rufwd DNS forwarder.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rufwd_engine::{
    Config, LocallyServedNetworks, MemoryHookRegistry, Server, StaticLeases, DEFAULT_HOOK_ID,
};

/// Rufwd - a DNS forwarder for home networks
#[derive(Parser)]
#[command(name = "rufwd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rufwd.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DNS server until interrupted, SIGHUP reloads the configuration
    Run,

    /// Validate the configuration file and exit
    Check,

    /// Resolve a client address to its hostname the way the server does
    Ptr {
        /// Address to look up
        ip: IpAddr,
    },

    /// Resolve a hostname through the configured upstreams
    Resolve {
        /// Hostname to look up
        host: String,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "rufwd.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli.log_level.as_deref();

    match cli.command {
        Commands::GenConfig { output } => {
            init_logging(level.unwrap_or("info"));
            generate_config(&output)
        }
        Commands::Run => {
            let config = setup(&cli.config, level)?;
            run_server(cli.config, config).await
        }
        Commands::Check => {
            setup(&cli.config, level)?;
            println!("Configuration {:?} is valid", cli.config);
            Ok(())
        }
        Commands::Ptr { ip } => lookup_ptr(setup(&cli.config, level)?, ip).await,
        Commands::Resolve { host } => resolve_host(setup(&cli.config, level)?, &host).await,
    }
}

/// Load the configuration, then start logging at its level unless overridden
fn setup(path: &Path, level: Option<&str>) -> Result<Config> {
    let config = load_config(path)?;
    init_logging(level.unwrap_or(&config.log_level));
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // The engine logs through `log`, the fmt subscriber picks it up via tracing-log
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_server(config: &Config) -> Result<(Server, Arc<StaticLeases>)> {
    let classifier = LocallyServedNetworks::with_networks(&config.local_networks)
        .context("Invalid local networks")?;
    let leases = Arc::new(StaticLeases::new(config.leases.clone()));

    let server = Server::builder()
        .autohost_tld(config.autohost_tld.clone())
        .classifier(Arc::new(classifier))
        .dhcp(leases.clone())
        .hook_registry(Arc::new(MemoryHookRegistry::new()), DEFAULT_HOOK_ID)
        .build()
        .context("Failed to create DNS server")?;

    Ok((server, leases))
}

async fn run_server(config_path: PathBuf, config: Config) -> Result<()> {
    info!("Starting rufwd...");

    let (server, leases) = build_server(&config)?;
    server
        .prepare(config.dns.clone())
        .await
        .context("Failed to prepare DNS server")?;
    server.start().await.context("Failed to start DNS server")?;

    info!("Configuration loaded from {:?}", config_path);
    for addr in server.local_addrs().await {
        info!("Serving DNS on {}", addr);
    }

    wait_for_shutdown(&server, &leases, config, &config_path).await?;

    info!("Shutting down...");
    server.close().await;

    Ok(())
}

/// Reload on SIGHUP until SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_shutdown(
    server: &Server,
    leases: &StaticLeases,
    mut running: Config,
    config_path: &Path,
) -> Result<()> {
    use signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading {:?}", config_path);
                reload(server, leases, &mut running, config_path).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _server: &Server,
    _leases: &StaticLeases,
    _running: Config,
    _config_path: &Path,
) -> Result<()> {
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}

#[cfg(unix)]
async fn reload(server: &Server, leases: &StaticLeases, running: &mut Config, config_path: &Path) {
    let fresh = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Keeping the running configuration: {:#}", e);
            return;
        }
    };

    for key in restart_required(running, &fresh) {
        warn!("Change to {} takes effect after a restart", key);
    }

    if fresh.leases != running.leases {
        info!("Reloading {} static leases", fresh.leases.len());
        leases.replace(fresh.leases.clone());
    }

    let result = server.reconfigure(fresh.dns.clone()).await;
    *running = fresh;
    if let Err(e) = result {
        // Listeners are down at this point, nothing serves until the next reload
        error!("{}", e);
        return;
    }

    info!("Configuration reloaded");
}

/// Settings baked into the server at build time, which a reload cannot change
fn restart_required(running: &Config, fresh: &Config) -> Vec<&'static str> {
    let mut keys = Vec::new();
    if running.local_networks != fresh.local_networks {
        keys.push("local_networks");
    }
    if !running.autohost_tld.eq_ignore_ascii_case(&fresh.autohost_tld) {
        keys.push("autohost_tld");
    }
    keys
}

async fn lookup_ptr(config: Config, ip: IpAddr) -> Result<()> {
    let (server, _) = build_server(&config)?;
    server
        .prepare(config.dns)
        .await
        .context("Failed to prepare DNS server")?;

    match server.exchange(ip).await.with_context(|| format!("PTR lookup for {} failed", ip))? {
        Some(host) => println!("{}", host),
        None => println!("Client address resolution is disabled"),
    }

    server.close().await;
    Ok(())
}

async fn resolve_host(config: Config, host: &str) -> Result<()> {
    let (server, _) = build_server(&config)?;
    server
        .prepare(config.dns)
        .await
        .context("Failed to prepare DNS server")?;

    let ips = server
        .resolve(host)
        .await
        .with_context(|| format!("Failed to resolve {}", host))?;
    for ip in ips {
        println!("{}", ip);
    }

    server.close().await;
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the upstream and listen addresses before running.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rufwd_engine::{DhcpLeases, Lease};

    #[test]
    fn test_restart_required() {
        let running = Config::default();
        assert!(restart_required(&running, &running.clone()).is_empty());

        let mut fresh = running.clone();
        fresh.autohost_tld = running.autohost_tld.to_uppercase();
        fresh.leases.push(Lease::new("nas", "192.168.1.30".parse().unwrap()));
        fresh.dns.ratelimit = 5;
        assert!(restart_required(&running, &fresh).is_empty());

        fresh.autohost_tld = "home".to_string();
        fresh.local_networks.push("10.8.0.0/16".to_string());
        assert_eq!(restart_required(&running, &fresh), vec!["local_networks", "autohost_tld"]);
    }

    #[test]
    fn test_build_server_shares_leases() {
        let mut config = Config::default();
        config.leases.push(Lease::new("printer", "192.168.1.20".parse().unwrap()));

        let (_server, leases) = build_server(&config).unwrap();
        assert_eq!(leases.leases(), config.leases);

        let fresh = vec![Lease::new("nas", "192.168.1.30".parse().unwrap())];
        leases.replace(fresh.clone());
        assert_eq!(leases.leases(), fresh);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_applies_leases() {
        let dir = std::env::temp_dir().join(format!("rufwd-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rufwd.toml");

        let mut running = Config::default();
        running.dns.udp_listen_addrs = vec!["127.0.0.1:0".parse().unwrap()];
        running.dns.tcp_listen_addrs = Vec::new();
        running.dns.upstream_dns = vec!["127.0.0.1:9".to_string()];
        running.dns.local_ptr_resolvers = vec!["127.0.0.1:9".to_string()];
        running.dns.resolve_clients = false;

        let (server, leases) = build_server(&running).unwrap();
        server.prepare(running.dns.clone()).await.unwrap();
        server.start().await.unwrap();

        std::fs::write(
            &path,
            r#"
[dns]
udp_listen_addrs = ["127.0.0.1:0"]
tcp_listen_addrs = []
upstream_dns = ["127.0.0.1:9"]
local_ptr_resolvers = ["127.0.0.1:9"]
resolve_clients = false

[[leases]]
hostname = "nas"
ip = "192.168.1.30"
"#,
        )
        .unwrap();

        reload(&server, &leases, &mut running, &path).await;
        assert!(server.is_running().await);
        assert_eq!(leases.leases(), vec![Lease::new("nas", "192.168.1.30".parse().unwrap())]);
        assert_eq!(running.leases, leases.leases());

        server.close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
