use anyhow::{Result, bail};
use clap::Parser;
use cloakproxy::{ServerConfig, Socks5Server};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS5 proxy with an optional encrypted client transport", long_about = None)]
struct Args {
    /// Listener host
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Listener port
    #[arg(short, long, default_value_t = 1080)]
    port: u16,

    /// Cipher key; enables the encrypted client transport when set
    #[arg(short, long)]
    key: Option<String>,

    /// Compress client traffic with zlib
    #[arg(short, long)]
    zlib: bool,

    /// Idle timeout in seconds (0 disables)
    #[arg(short, long, default_value_t = 300)]
    timeout: u64,

    /// Credential entry in user:password form (repeatable)
    #[arg(long = "user")]
    users: Vec<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = ServerConfig {
        key: args.key.map(String::into_bytes).unwrap_or_default(),
        zlib: args.zlib,
        timeout: Duration::from_secs(args.timeout),
        verbose: args.verbose,
    };

    if !config.key.is_empty() {
        info!("encrypted client transport enabled");
    }
    if config.zlib {
        info!("zlib compression enabled");
    }

    // Instantiate the dispatcher with its own seeded generator
    let (server, handle) = Socks5Server::new(config, StdRng::from_entropy());
    let dispatcher = tokio::spawn(server.run());

    // Feed credential entries through the admin surface
    for entry in &args.users {
        let Some((username, password)) = entry.split_once(':') else {
            bail!("credential entries take the form user:password, got {entry:?}");
        };
        handle.add_user(username, password).await?;
    }

    handle.publish_on(&args.host, args.port).await?;

    Ok(dispatcher.await??)
}
