//! Tunnel Hub Binary
//!
//! Usage: tunnel-hub [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate a sample configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use tunnelhub::config::{ProxyConfig, ProxyConfigFile, DEFAULT_LISTEN_ADDR};
use tunnelhub::tunnel::{SealedTunnel, TunnelCredentials, UserId};
use tunnelhub::Acceptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG=debug shows per-session events
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_proxy(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Tunnel Hub - local SOCKS5 front end for a sealed tunnel

USAGE:
    tunnel-hub [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Generate a sample configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration:
        tunnel-hub --generate > hub.toml

    Run the proxy:
        tunnel-hub --config hub.toml

    Point applications at the SOCKS5 listener (default {}).
"#,
        DEFAULT_LISTEN_ADDR
    );
}

fn generate_config() -> anyhow::Result<()> {
    let user_id = UserId::random();
    let config = ProxyConfig::new(
        DEFAULT_LISTEN_ADDR,
        "tunnel.example.com:443",
        TunnelCredentials::new(user_id.to_string()),
    );
    let config_file = ProxyConfigFile::from_config(&config);

    println!("# Tunnel Hub Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!("# Set remote_addr to your tunnel endpoint and share user_id with it.");
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);

    Ok(())
}

async fn run_proxy(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let config_file: ProxyConfigFile = toml::from_str(&content)?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    let connector = SealedTunnel::new(&config.credentials)?;
    tracing::info!(
        "Tunneling to {} (security: {:?})",
        config.remote_addr,
        connector.security()
    );

    let acceptor = Acceptor::bind(&config, Arc::new(connector)).await?;
    let metrics = acceptor.metrics();

    tokio::select! {
        result = acceptor.run() => {
            if let Err(e) = result {
                tracing::warn!("Acceptor stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    println!("{}", metrics.format_report());
    Ok(())
}
