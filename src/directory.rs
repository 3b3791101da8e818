//! Process-wide record of the addresses each known peer can be reached on.

use std::collections::HashMap;
use std::sync::Arc;

use multiaddr::Multiaddr;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::address::PeerIdentity;

/// TTL for addresses that should outlive the process.
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

#[derive(Debug, Clone)]
struct KnownAddr {
    addr: Multiaddr,
    /// `None` when the TTL runs past anything `Instant` can represent.
    expires_at: Option<Instant>,
}

impl KnownAddr {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Shared map from peer identity to known addresses.
///
/// Cloning yields another handle onto the same map. Writers are serialized
/// against concurrent readers, so the directory can be consulted by dialing
/// tasks while new peers are being remembered.
#[derive(Clone, Debug, Default)]
pub struct PeerDirectory {
    entries: Arc<RwLock<HashMap<PeerIdentity, Vec<KnownAddr>>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` is reachable on `addr` for `ttl`.
    ///
    /// Remembering an address twice keeps a single entry; the later expiry of
    /// the two wins.
    pub async fn remember(&self, peer: PeerIdentity, addr: Multiaddr, ttl: Duration) {
        let expires_at = Instant::now().checked_add(ttl);
        let mut entries = self.entries.write().await;
        let known = entries.entry(peer).or_default();

        match known.iter_mut().find(|entry| entry.addr == addr) {
            Some(entry) => {
                entry.expires_at = match (entry.expires_at, expires_at) {
                    (Some(current), Some(candidate)) => Some(current.max(candidate)),
                    _ => None,
                };
            }
            None => {
                debug!(%peer, %addr, "remembering peer address");
                known.push(KnownAddr { addr, expires_at });
            }
        }
    }

    /// Unexpired addresses for `peer`, oldest first.
    pub async fn addresses_of(&self, peer: &PeerIdentity) -> Vec<Multiaddr> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(peer)
            .map(|known| {
                known
                    .iter()
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| entry.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identities that currently have at least one live address.
    pub async fn peers(&self) -> Vec<PeerIdentity> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut peers: Vec<PeerIdentity> = entries
            .iter()
            .filter(|(_, known)| known.iter().any(|entry| entry.is_live(now)))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }
}
