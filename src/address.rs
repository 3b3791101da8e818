//! Address resolution: multiaddr strings to (peer identity, routable address).
//!
//! A dial target such as `/ip4/1.2.3.4/tcp/4001/p2p/QmNnoo...` carries two
//! things at once: where to connect and who is expected on the other end.
//! [`resolve`] splits them apart by decapsulating the `/p2p/<id>` fragment
//! from the parsed address. The legacy `/ipfs/<id>` spelling is accepted and
//! treated identically.

use std::fmt;
use std::str::FromStr;

use libp2p_identity::{DecodingError, Keypair, ParseError, PeerId};
use multiaddr::{Multiaddr, Protocol};

use crate::error::{AddressError, Error, Result};

/// Identity of a participant, encoded on the wire as a base58 multihash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerIdentity(PeerId);

impl PeerIdentity {
    /// Fresh identity backed by a random ed25519 key pair.
    pub fn generate() -> Self {
        Self(Keypair::generate_ed25519().public().to_peer_id())
    }

    /// Deterministic identity: the same seed always yields the same peer.
    pub fn from_seed(seed: u64) -> std::result::Result<Self, DecodingError> {
        let mut secret = *iroh_blake3::hash(&seed.to_le_bytes()).as_bytes();
        let keypair = Keypair::ed25519_from_bytes(&mut secret)?;
        Ok(Self(keypair.public().to_peer_id()))
    }

    /// Decode the base58 text form, as announced by a remote during a handshake.
    pub fn decode(text: &str) -> std::result::Result<Self, ParseError> {
        PeerId::from_str(text).map(Self)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.0
    }
}

impl From<PeerId> for PeerIdentity {
    fn from(id: PeerId) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Split a dial target into the peer it names and the address to reach it on.
///
/// ```
/// let (peer, addr) = peerchain::resolve(
///     "/ip4/1.2.3.4/tcp/4001/ipfs/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
/// )
/// .unwrap();
/// assert_eq!(peer.to_string(), "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN");
/// assert_eq!(addr.to_string(), "/ip4/1.2.3.4/tcp/4001");
/// ```
///
/// Fails with [`Error::InvalidAddress`] when the string is not a multiaddr,
/// does not carry exactly one identity component, or has nothing routable in
/// front of it.
pub fn resolve(address: &str) -> Result<(PeerIdentity, Multiaddr)> {
    let invalid = |source| Error::invalid_address(address, source);

    let parsed: Multiaddr = address
        .parse()
        .map_err(|err| invalid(AddressError::Parse(err)))?;

    let identities: Vec<PeerId> = parsed
        .iter()
        .filter_map(|component| match component {
            Protocol::P2p(id) => Some(id),
            _ => None,
        })
        .collect();
    let peer = match identities.as_slice() {
        [id] => PeerIdentity(*id),
        [] => return Err(invalid(AddressError::MissingIdentity)),
        many => return Err(invalid(AddressError::MultipleIdentities(many.len()))),
    };

    let routable = decapsulate(&parsed, &identity_fragment(&peer));
    if routable.is_empty() {
        return Err(invalid(AddressError::NoRoutablePrefix));
    }
    Ok((peer, routable))
}

/// The `/p2p/<id>` fragment naming `peer`.
pub fn identity_fragment(peer: &PeerIdentity) -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2p(peer.0))
}

/// Full dialable address: `addr` followed by the identity of `peer`.
pub fn with_identity(addr: &Multiaddr, peer: &PeerIdentity) -> Multiaddr {
    addr.clone().with(Protocol::P2p(peer.0))
}

/// Remove the last occurrence of `suffix` from `addr`, together with every
/// component that follows it.
///
/// When `suffix` does not occur in `addr`, `addr` is returned unchanged.
pub fn decapsulate(addr: &Multiaddr, suffix: &Multiaddr) -> Multiaddr {
    let outer: Vec<Protocol<'_>> = addr.iter().collect();
    let inner: Vec<Protocol<'_>> = suffix.iter().collect();
    if inner.is_empty() || inner.len() > outer.len() {
        return addr.clone();
    }

    let start = (0..=outer.len() - inner.len())
        .rev()
        .find(|&at| outer[at..at + inner.len()] == inner[..]);
    match start {
        Some(at) => outer[..at].iter().cloned().collect(),
        None => addr.clone(),
    }
}
