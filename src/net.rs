//! Stream establishment over a pluggable host transport.
//!
//! This module provides the [`Host`] seam, the [`PeerStream`] wrapper consumed
//! by the sync loop, the client-side [`open_stream`] entry point, and
//! [`TcpHost`], a plain TCP implementation of [`Host`].
//!
//! # Protocol negotiation
//!
//! Every stream is tagged with a protocol id such as [`LEDGER_PROTOCOL`]. Over
//! TCP the dialer opens with `<protocol> <dialer-id>\n`; the listener answers
//! `<protocol> <listener-id>\n` when it serves that protocol and `na\n`
//! otherwise. The dialer refuses the stream unless the listener identifies as
//! the peer it meant to reach.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use tokio::io::{split, AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::address::{with_identity, PeerIdentity};
use crate::directory::PeerDirectory;
use crate::error::{DialError, Error, Result};
use crate::framing::{read_handshake_line, write_handshake_line};

/// Protocol id for ledger synchronization streams.
pub const LEDGER_PROTOCOL: &str = "/p2p/1.0.0";

/// Time allowed for either side of the protocol handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener reply for an unsupported protocol.
const REJECT: &str = "na";

/// Inbound connections waiting for [`Host::accept`].
const ACCEPT_BACKLOG: usize = 64;

/// Raw bidirectional byte stream handed out by a [`Host`].
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn RawStream>;

/// A stream opened by a remote peer.
pub struct InboundStream {
    pub peer: PeerIdentity,
    pub protocol: String,
    pub stream: BoxedStream,
}

/// Transport capability: dial a known peer or accept streams from others.
///
/// Implementations read dial addresses from [`Host::directory`].
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn local_peer(&self) -> PeerIdentity;

    fn directory(&self) -> &PeerDirectory;

    /// Open a raw stream to `peer` negotiated for `protocol`.
    async fn dial(&self, peer: &PeerIdentity, protocol: &str) -> Result<BoxedStream, DialError>;

    /// Wait for the next negotiated inbound stream.
    async fn accept(&self) -> Result<InboundStream>;
}

pub type BufferedReader = BufReader<ReadHalf<BoxedStream>>;
pub type BufferedWriter = BufWriter<WriteHalf<BoxedStream>>;

/// A negotiated stream to one peer, split into buffered read and write halves.
pub struct PeerStream {
    peer: PeerIdentity,
    protocol: String,
    reader: BufferedReader,
    writer: BufferedWriter,
}

impl PeerStream {
    pub fn new(peer: PeerIdentity, protocol: impl Into<String>, stream: BoxedStream) -> Self {
        let (read, write) = split(stream);
        Self {
            peer,
            protocol: protocol.into(),
            reader: BufReader::new(read),
            writer: BufWriter::new(write),
        }
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn into_parts(self) -> (BufferedReader, BufferedWriter) {
        (self.reader, self.writer)
    }
}

impl From<InboundStream> for PeerStream {
    fn from(inbound: InboundStream) -> Self {
        PeerStream::new(inbound.peer, inbound.protocol, inbound.stream)
    }
}

/// Open a `protocol` stream to `peer`, which must already be in the host's directory.
pub async fn open_stream<H>(host: &H, peer: &PeerIdentity, protocol: &str) -> Result<PeerStream>
where
    H: Host + ?Sized,
{
    if host.directory().addresses_of(peer).await.is_empty() {
        return Err(Error::dial_failed(peer, DialError::NoKnownAddress));
    }

    info!(%peer, protocol, "opening stream");
    debug!(known = ?host.directory().peers().await, "directory before dial");
    let stream = host
        .dial(peer, protocol)
        .await
        .map_err(|reason| Error::dial_failed(peer, reason))?;
    Ok(PeerStream::new(*peer, protocol, stream))
}

/// Socket addresses a multiaddr of the form `/{ip4,ip6,dns,dns4,dns6}/<host>/tcp/<port>` points at.
///
/// Other shapes yield an empty list.
pub async fn socket_addrs(addr: &Multiaddr) -> io::Result<Vec<SocketAddr>> {
    let mut components = addr.iter();
    let (Some(host), Some(Protocol::Tcp(port))) = (components.next(), components.next()) else {
        return Ok(Vec::new());
    };

    let resolved = match host {
        Protocol::Ip4(ip) => vec![SocketAddr::from((ip, port))],
        Protocol::Ip6(ip) => vec![SocketAddr::from((ip, port))],
        Protocol::Dns(name) => lookup_host((&*name, port)).await?.collect(),
        Protocol::Dns4(name) => lookup_host((&*name, port))
            .await?
            .filter(SocketAddr::is_ipv4)
            .collect(),
        Protocol::Dns6(name) => lookup_host((&*name, port))
            .await?
            .filter(SocketAddr::is_ipv6)
            .collect(),
        _ => Vec::new(),
    };
    Ok(resolved)
}

/// Multiaddr for a bound socket: `/ip4/<ip>/tcp/<port>` or the ip6 equivalent.
pub fn tcp_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::from(addr.ip()).with(Protocol::Tcp(addr.port()))
}

/// [`Host`] over plain TCP.
///
/// Binding spawns a background acceptor that negotiates each connection on
/// its own task and queues the successful ones for [`Host::accept`]. The
/// acceptor stops when the host is dropped.
pub struct TcpHost {
    local_peer: PeerIdentity,
    local_addr: SocketAddr,
    directory: PeerDirectory,
    incoming: Mutex<mpsc::Receiver<InboundStream>>,
    acceptor: JoinHandle<()>,
}

impl TcpHost {
    /// Listen on `addr` for streams tagged with any of `protocols`.
    pub async fn bind(
        addr: SocketAddr,
        local_peer: PeerIdentity,
        directory: PeerDirectory,
        protocols: &[&str],
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let protocols: Arc<Vec<String>> =
            Arc::new(protocols.iter().map(|p| p.to_string()).collect());
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        let acceptor = tokio::spawn(run_acceptor(listener, local_peer, protocols, tx));
        info!(%local_addr, peer = %local_peer, "tcp host listening");

        Ok(Self {
            local_peer,
            local_addr,
            directory,
            incoming: Mutex::new(rx),
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address other peers dial: listen address plus `/p2p/<local id>`.
    pub fn full_addr(&self) -> Multiaddr {
        with_identity(&tcp_multiaddr(self.local_addr), &self.local_peer)
    }

    async fn connect(&self, peer: &PeerIdentity) -> Result<TcpStream, DialError> {
        let mut last_error = None;
        for addr in self.directory.addresses_of(peer).await {
            let targets = match socket_addrs(&addr).await {
                Ok(targets) => targets,
                Err(err) => {
                    debug!(%addr, %err, "address lookup failed");
                    last_error = Some(err);
                    continue;
                }
            };
            for target in targets {
                match TcpStream::connect(target).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => {
                        debug!(%target, %err, "connect failed");
                        last_error = Some(err);
                    }
                }
            }
        }
        Err(match last_error {
            Some(err) => DialError::Unreachable(err),
            None => DialError::NoKnownAddress,
        })
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl Host for TcpHost {
    fn local_peer(&self) -> PeerIdentity {
        self.local_peer
    }

    fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    async fn dial(&self, peer: &PeerIdentity, protocol: &str) -> Result<BoxedStream, DialError> {
        let mut stream = self.connect(peer).await?;
        let greeting = format!("{protocol} {}", self.local_peer);

        let reply = timeout(HANDSHAKE_TIMEOUT, async {
            write_handshake_line(&mut stream, &greeting).await?;
            read_handshake_line(&mut stream).await
        })
        .await
        .map_err(|_| DialError::Handshake("timed out".into()))?
        .map_err(|err| DialError::Handshake(err.to_string()))?;

        if reply == REJECT {
            return Err(DialError::ProtocolRejected(protocol.to_string()));
        }
        let (answered, remote) = split_handshake(&reply)?;
        if answered != protocol {
            return Err(DialError::Handshake(format!(
                "asked for {protocol}, listener answered {answered}"
            )));
        }
        if remote != *peer {
            return Err(DialError::IdentityMismatch { actual: remote });
        }
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<InboundStream> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(|| {
            Error::StreamClosed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tcp acceptor stopped",
            ))
        })
    }
}

fn split_handshake(line: &str) -> Result<(&str, PeerIdentity), DialError> {
    let (protocol, peer) = line
        .split_once(' ')
        .ok_or_else(|| DialError::Handshake(format!("malformed handshake line {line:?}")))?;
    let peer = PeerIdentity::decode(peer)
        .map_err(|err| DialError::Handshake(format!("bad peer id in handshake: {err}")))?;
    Ok((protocol, peer))
}

async fn run_acceptor(
    listener: TcpListener,
    local_peer: PeerIdentity,
    protocols: Arc<Vec<String>>,
    queue: mpsc::Sender<InboundStream>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "tcp accept failed");
                continue;
            }
        };
        let protocols = protocols.clone();
        let pending = queue.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, negotiate(stream, local_peer, &protocols)).await {
                Ok(Ok(Some(inbound))) => {
                    debug!(%remote_addr, peer = %inbound.peer, "inbound stream negotiated");
                    // A send error means the host was dropped.
                    let _ = pending.send(inbound).await;
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => debug!(%remote_addr, %err, "inbound handshake failed"),
                Err(_) => debug!(%remote_addr, "inbound handshake timed out"),
            }
        });
        if queue.is_closed() {
            return;
        }
    }
}

async fn negotiate(
    mut stream: TcpStream,
    local_peer: PeerIdentity,
    protocols: &[String],
) -> io::Result<Option<InboundStream>> {
    let greeting = read_handshake_line(&mut stream).await?;
    let (protocol, peer) = split_handshake(&greeting)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    if !protocols.iter().any(|supported| supported == protocol) {
        debug!(%peer, protocol, "rejecting unsupported protocol");
        write_handshake_line(&mut stream, REJECT).await?;
        return Ok(None);
    }

    write_handshake_line(&mut stream, &format!("{protocol} {local_peer}")).await?;
    Ok(Some(InboundStream {
        peer,
        protocol: protocol.to_string(),
        stream: Box::new(stream),
    }))
}
