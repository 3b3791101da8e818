//! # peerchain
//!
//! Direct peer-to-peer replication of an append-only ledger. Two nodes open a
//! single tagged stream to each other and keep their ledgers in sync with no
//! coordinator: each side periodically broadcasts its whole ledger, pushes
//! locally produced blocks immediately, and adopts any strictly longer ledger
//! it receives.
//!
//! The crate is split into small modules that build on one another:
//!
//! - [`address`]: multiaddr resolution into a [`PeerIdentity`] and a routable
//!   address.
//! - [`directory`]: the process-wide [`PeerDirectory`] of known addresses.
//! - [`net`]: the [`Host`] transport seam, [`open_stream`], and the TCP host.
//! - [`server`]: the accept loop, [`listen`], and [`SyncHandler`].
//! - [`sync`]: the duplex [`SyncSession`] and the [`SharedLedger`] handle.
//! - [`ledger`]: blocks, chain rules, and the merge decision.
//! - [`framing`]: newline-delimited JSON wire messages.
//! - [`input`]: sources of locally produced records.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use peerchain::{
//!     open_stream, resolve, Ledger, PeerDirectory, PeerIdentity, SharedLedger, SyncConfig,
//!     SyncSession, TcpHost, LEDGER_PROTOCOL, PERMANENT_ADDR_TTL,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn launch(target: &str) -> Result<()> {
//! let directory = PeerDirectory::new();
//! let host = TcpHost::bind(
//!     "127.0.0.1:0".parse()?,
//!     PeerIdentity::generate(),
//!     directory.clone(),
//!     &[LEDGER_PROTOCOL],
//! )
//! .await?;
//!
//! let (peer, addr) = resolve(target)?;
//! directory.remember(peer, addr, PERMANENT_ADDR_TTL).await;
//! let stream = open_stream(&host, &peer, LEDGER_PROTOCOL).await?;
//!
//! let ledger = SharedLedger::new(Ledger::genesis());
//! SyncSession::new(stream, ledger, SyncConfig::default())
//!     .run(CancellationToken::new())
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod directory;
pub mod error;
pub mod framing;
pub mod input;
pub mod ledger;
pub mod net;
pub mod server;
pub mod sync;

pub use address::{resolve, PeerIdentity};
pub use config::{ChainPolicy, SyncConfig};
pub use directory::{PeerDirectory, PERMANENT_ADDR_TTL};
pub use error::{AddressError, DialError, Error, Result};
pub use input::{ExtensionSource, LinePrompt, SharedSource};
pub use ledger::{Block, ChainRule, Extension, Ledger, LongestChain, LongestValidChain};
pub use net::{open_stream, Host, PeerStream, TcpHost, LEDGER_PROTOCOL};
pub use server::{listen, StreamHandler, SyncHandler};
pub use sync::{SessionReport, SharedLedger, SyncSession};
