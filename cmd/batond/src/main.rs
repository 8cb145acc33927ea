//! batond - chat daemon with live upgrade
//!
//! Starting a second batond on the same state directory while one is
//! running moves every listener and client connection into the new process;
//! the old one exits once the new one has acknowledged.
//!
//! Usage:
//!     batond [--listen 127.0.0.1:6667 ...] [--state-dir /tmp/batond] [--name baton]
//!
//! Upgrade:
//!     batond --state-dir /tmp/batond &    # new binary, same directory
//!
//! Signals: SIGINT/SIGTERM shut down, SIGUSR1 logs the task table.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use baton_chat::{Exit, Server, ServerConfig};
use baton_runtime::{Runtime, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "batond", version, about = "Chat daemon with live process handover")]
struct Args {
    /// Address to listen on; repeat for several. Unused when taking over.
    #[arg(short, long)]
    listen: Vec<SocketAddr>,

    /// Directory for baton.lock and baton.sock
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Server name used as the source of replies
    #[arg(long)]
    name: Option<String>,

    /// Do not install signal handlers
    #[arg(long)]
    no_signals: bool,
}

impl Args {
    fn server_config(self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if !self.listen.is_empty() {
            config.listen = self.listen;
        }
        if let Some(dir) = self.state_dir {
            config.state_dir = dir;
        }
        if let Some(name) = self.name {
            config.server_name = name;
        }
        config.handle_signals = !self.no_signals;
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    baton_core::kprint::init();

    let config = Args::parse().server_config();
    let state_dir = config.state_dir.clone();

    let runtime = Runtime::new(RuntimeConfig::from_env()).context("invalid runtime configuration")?;
    let server = Server::start(&runtime.handle(), config)
        .with_context(|| format!("failed to start with state in {}", state_dir.display()))?;
    tracing::info!("batond {} serving on {:?}", env!("CARGO_PKG_VERSION"), server.local_addrs());

    let exit = runtime
        .block_on(server.serve())
        .context("runtime stopped")?
        .context("server failed")?;

    match exit {
        // The successor owns the sockets; leave without touching them
        Exit::HandedOver => process::exit(0),
        Exit::Shutdown => {
            tracing::info!("shut down cleanly");
            Ok(())
        }
    }
}
