// Voodoo daemon: serves the clock factory over TCP, or talks to one as a client.

mod clock;
mod config;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use voodoo_core::Id;
use voodoo_net::{Client, Server};

use crate::clock::{RemoteClock, TimeOfDay};

#[derive(Parser, Debug)]
#[command(name = "voodoo-server", version, about = "Voodoo RPC daemon")]
struct Cli {
    /// TCP port (overrides config and VOODOO_PORT).
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Config file to read instead of the default locations.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections until SIGINT/SIGTERM (default).
    Serve {
        /// Address to bind.
        #[arg(long)]
        bind: Option<IpAddr>,
    },
    /// Create a clock on a running server and print its time.
    Clock {
        /// Server host.
        #[arg(long)]
        host: Option<String>,
        /// Identifier of the clock factory.
        #[arg(long, default_value_t = 1)]
        factory: u64,
        /// Set the clock to HH:MM:SS before reading it.
        #[arg(long)]
        set: Option<TimeOfDay>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => {
            let ip = match bind {
                Some(ip) => ip,
                None => cfg
                    .bind
                    .parse()
                    .with_context(|| format!("invalid bind address {:?}", cfg.bind))?,
            };
            serve(SocketAddr::new(ip, cfg.port)).await
        }
        Command::Clock { host, factory, set } => {
            let host = host.unwrap_or(cfg.host);
            query_clock(&host, cfg.port, Id::new(factory), set).await
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let server = Arc::new(Server::new());
    let factory = clock::register(server.host())?;
    let local = server.listen_on(addr).await?;
    tracing::info!(
        %local,
        clock_factory = %factory,
        "voodoo-server {} listening",
        env!("CARGO_PKG_VERSION")
    );

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    shutdown_signal().await?;
    tracing::info!("shutting down");
    server.stop();
    runner.await.context("dispatch task panicked")??;
    server.join().await?;
    Ok(())
}

async fn query_clock(
    host: &str,
    port: u16,
    factory: Id,
    set: Option<TimeOfDay>,
) -> anyhow::Result<()> {
    let client = Client::new();
    client
        .connect(host, port)
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;
    let clock = RemoteClock::create(&client, factory).await?;
    if let Some(time) = set {
        clock.set_time(time).await?;
    }
    println!("{}", clock.time().await?);
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn clock_subcommand_parses_time() {
        let cli = Cli::parse_from(["voodoo-server", "clock", "--set", "06:30:00", "-p", "6001"]);
        assert_eq!(cli.port, Some(6001));
        match cli.command {
            Some(Command::Clock { set, factory, host }) => {
                assert_eq!(set, TimeOfDay::new(6, 30, 0));
                assert_eq!(factory, 1);
                assert!(host.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn serve_is_default() {
        let cli = Cli::parse_from(["voodoo-server", "--debug"]);
        assert!(cli.debug);
        assert!(cli.command.is_none());
    }
}
