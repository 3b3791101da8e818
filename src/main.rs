//! Interactive ledger node.
//!
//! Starts a TCP host, prints the address other nodes can dial, and keeps the
//! local ledger in sync with every connected peer. Each line typed on stdin
//! becomes a new block.
//!
//! # Usage
//!
//! ```bash
//! # terminal 1
//! cargo run -- -l 10000
//! # terminal 2, using the address printed by terminal 1
//! cargo run -- -l 10001 -d /ip4/127.0.0.1/tcp/10000/p2p/<peer-id>
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use peerchain::{
    listen, open_stream, resolve, ChainPolicy, Ledger, LinePrompt, PeerDirectory, PeerIdentity,
    SharedLedger, SharedSource, SyncConfig, SyncHandler, SyncSession, TcpHost, LEDGER_PROTOCOL,
    PERMANENT_ADDR_TTL,
};

/// CLI arguments for a ledger node.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Port to listen on; 0 picks a free port
    #[arg(short = 'l', long = "listen-port", default_value_t = 0)]
    listen_port: u16,
    /// Interface to listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen_host: IpAddr,
    /// Multiaddr of a peer to dial, ending in /p2p/<peer-id>
    #[arg(short = 'd', long = "dial")]
    dial: Option<String>,
    /// Seed for a deterministic identity; random when omitted
    #[arg(long)]
    seed: Option<u64>,
    /// Seconds between two broadcasts of the local ledger
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    broadcast_secs: u64,
    /// Rule deciding whether a received ledger replaces the local one
    #[arg(long, value_enum, default_value_t = ChainPolicy::Longest)]
    chain_policy: ChainPolicy,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let local_peer = match args.seed {
        Some(seed) => PeerIdentity::from_seed(seed).context("failed to derive seeded identity")?,
        None => PeerIdentity::generate(),
    };
    let directory = PeerDirectory::new();
    let host = Arc::new(
        TcpHost::bind(
            SocketAddr::new(args.listen_host, args.listen_port),
            local_peer,
            directory.clone(),
            &[LEDGER_PROTOCOL],
        )
        .await
        .context("failed to bind listener")?,
    );

    println!("Node started");
    println!("  Peer id : {local_peer}");
    println!("  Address : {}", host.full_addr());
    println!(
        "Run `peerchain -l <port> -d {}` on another node to connect.",
        host.full_addr()
    );

    let config = SyncConfig {
        broadcast_interval: Duration::from_secs(args.broadcast_secs),
        chain_policy: args.chain_policy,
        ..SyncConfig::default()
    };
    let ledger = SharedLedger::new(Ledger::genesis());
    let source = SharedSource::new(LinePrompt::stdio());
    let shutdown = CancellationToken::new();

    spawn_ctrl_c(shutdown.clone());
    spawn_ledger_printer(ledger.clone(), shutdown.clone());

    let handler = SyncHandler::new(ledger.clone(), config.clone(), shutdown.clone())
        .with_source(source.clone());
    let listener = tokio::spawn({
        let host = host.clone();
        let shutdown = shutdown.clone();
        async move {
            let result = listen(host, LEDGER_PROTOCOL, Arc::new(handler), shutdown.clone()).await;
            shutdown.cancel();
            result
        }
    });

    if let Some(target) = args.dial.as_deref() {
        let (peer, addr) = resolve(target)?;
        directory.remember(peer, addr, PERMANENT_ADDR_TTL).await;
        let stream = open_stream(host.as_ref(), &peer, LEDGER_PROTOCOL)
            .await
            .context("failed to open stream")?;

        let session = SyncSession::new(stream, ledger.clone(), config).with_source(source);
        let session_shutdown = shutdown.child_token();
        tokio::spawn(async move {
            session.run(session_shutdown).await;
        });
    }

    shutdown.cancelled().await;
    info!("shutting down");
    match listener.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).context("listener failed"),
        Err(err) => Err(err).context("listener task panicked"),
    }
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for ctrl-c");
            return;
        }
        shutdown.cancel();
    });
}

/// Print the whole ledger every time it changes.
fn spawn_ledger_printer(ledger: SharedLedger, shutdown: CancellationToken) {
    let mut changes = ledger.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let snapshot = ledger.snapshot().await;
            match serde_json::to_string_pretty(&snapshot) {
                Ok(pretty) => println!("\x1b[32m{pretty}\x1b[0m\n> "),
                Err(err) => error!(%err, "failed to render ledger"),
            }
        }
    });
}
