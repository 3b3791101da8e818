#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{timeout, Duration};

use peerchain::net::{BoxedStream, InboundStream};
use peerchain::{
    DialError, Error, Extension, Host, Ledger, PeerDirectory, PeerIdentity, PeerStream,
    SharedLedger, LEDGER_PROTOCOL,
};

pub const PIPE_CAPACITY: usize = 1 << 20;
pub const WAIT: Duration = Duration::from_secs(5);

struct Listener {
    protocols: Vec<String>,
    queue: mpsc::Sender<InboundStream>,
}

/// In-process stand-in for the network: hosts register here and dial each other by identity.
#[derive(Default)]
pub struct MemoryRegistry {
    hosts: RwLock<HashMap<PeerIdentity, Listener>>,
}

impl MemoryRegistry {
    async fn register(&self, peer: PeerIdentity, listener: Listener) {
        let mut hosts = self.hosts.write().await;
        hosts.insert(peer, listener);
    }

    pub async fn unregister(&self, peer: &PeerIdentity) {
        let mut hosts = self.hosts.write().await;
        hosts.remove(peer);
    }
}

pub struct MemoryHost {
    local_peer: PeerIdentity,
    slot: u64,
    directory: PeerDirectory,
    registry: Arc<MemoryRegistry>,
    incoming: Mutex<mpsc::Receiver<InboundStream>>,
    dials: Mutex<Vec<(PeerIdentity, String)>>,
}

impl MemoryHost {
    pub async fn new(registry: Arc<MemoryRegistry>, slot: u64, protocols: &[&str]) -> Arc<Self> {
        let local_peer = PeerIdentity::from_seed(slot).expect("seeded identity");
        let (queue, incoming) = mpsc::channel(16);
        registry
            .register(
                local_peer,
                Listener {
                    protocols: protocols.iter().map(|p| p.to_string()).collect(),
                    queue,
                },
            )
            .await;
        Arc::new(Self {
            local_peer,
            slot,
            directory: PeerDirectory::new(),
            registry,
            incoming: Mutex::new(incoming),
            dials: Mutex::new(Vec::new()),
        })
    }

    /// `/memory/<slot>/p2p/<id>`, the address other memory hosts dial.
    pub fn full_addr(&self) -> Multiaddr {
        Multiaddr::empty()
            .with(Protocol::Memory(self.slot))
            .with(Protocol::P2p(*self.local_peer.peer_id()))
    }

    pub async fn dial_calls(&self) -> Vec<(PeerIdentity, String)> {
        let dials = self.dials.lock().await;
        dials.clone()
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer(&self) -> PeerIdentity {
        self.local_peer
    }

    fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    async fn dial(&self, peer: &PeerIdentity, protocol: &str) -> Result<BoxedStream, DialError> {
        {
            let mut dials = self.dials.lock().await;
            dials.push((*peer, protocol.to_string()));
        }
        if self.directory.addresses_of(peer).await.is_empty() {
            return Err(DialError::NoKnownAddress);
        }

        let queue = {
            let hosts = self.registry.hosts.read().await;
            let listener = hosts.get(peer).ok_or_else(|| {
                DialError::Unreachable(io::Error::from(io::ErrorKind::ConnectionRefused))
            })?;
            if !listener.protocols.iter().any(|p| p == protocol) {
                return Err(DialError::ProtocolRejected(protocol.to_string()));
            }
            listener.queue.clone()
        };

        let (local, remote) = duplex(PIPE_CAPACITY);
        queue
            .send(InboundStream {
                peer: self.local_peer,
                protocol: protocol.to_string(),
                stream: Box::new(remote),
            })
            .await
            .map_err(|_| DialError::Unreachable(io::Error::from(io::ErrorKind::BrokenPipe)))?;
        Ok(Box::new(local))
    }

    async fn accept(&self) -> Result<InboundStream, Error> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .ok_or_else(|| Error::StreamClosed(io::Error::from(io::ErrorKind::BrokenPipe)))
    }
}

/// A ledger of `len` blocks on the shared genesis; `tag` varies the contents.
pub fn ledger_with(tag: &str, len: usize) -> Ledger {
    if len == 0 {
        return Ledger::from_blocks(Vec::new());
    }
    let mut ledger = Ledger::genesis();
    for n in 1..len {
        ledger = ledger
            .extend(&Extension::on_tip(format!("{tag}-{n}")), n as u64)
            .expect("extend on tip");
    }
    ledger
}

pub fn ledger_of_len(len: usize) -> Ledger {
    ledger_with("block", len)
}

/// A session-side stream to `remote` and the raw far end of the same pipe.
pub fn piped_stream(remote: PeerIdentity) -> (PeerStream, DuplexStream) {
    let (near, far) = duplex(PIPE_CAPACITY);
    (PeerStream::new(remote, LEDGER_PROTOCOL, Box::new(near)), far)
}

/// Wait until the shared ledger reaches `len` blocks.
pub async fn wait_for_len(ledger: &SharedLedger, len: usize) -> bool {
    let mut changes = ledger.subscribe();
    let reached = async {
        loop {
            if ledger.len().await == len {
                return;
            }
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };
    timeout(WAIT, reached).await.is_ok()
}
