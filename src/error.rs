//! Error kinds surfaced by the resolver, the establisher, and the sync loop.

use std::io;

use thiserror::Error;

use crate::address::PeerIdentity;

/// Top-level error for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The address string could not be turned into a dialable peer.
    #[error("invalid address `{address}`: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddressError,
    },
    /// A stream to the peer could not be established.
    #[error("failed to dial {peer}: {reason}")]
    DialFailed {
        peer: PeerIdentity,
        #[source]
        reason: DialError,
    },
    /// The stream ended or failed mid-operation.
    #[error("stream closed: {0}")]
    StreamClosed(#[source] io::Error),
    /// A line received from the peer was not a valid ledger snapshot.
    #[error("failed to decode wire message: {0}")]
    DecodeFailed(#[from] serde_json::Error),
    /// A line received from the peer ran past the frame limit.
    #[error("wire message longer than {limit} bytes")]
    FrameTooLong { limit: usize },
    /// The local ledger could not be serialized for sending.
    #[error("failed to encode wire message: {0}")]
    EncodeFailed(#[source] serde_json::Error),
    /// A producer extension did not build on the current tip.
    #[error("extension rejected: expected parent {expected}, got {actual}")]
    ExtensionRejected { expected: String, actual: String },
    /// The tip index is `u64::MAX`; no block can follow it.
    #[error("ledger tip at index {tip} cannot be extended")]
    IndexExhausted { tip: u64 },
}

/// Why an address failed to resolve.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("malformed multiaddr: {0}")]
    Parse(#[from] multiaddr::Error),
    #[error("no peer identity component")]
    MissingIdentity,
    #[error("expected one peer identity component, found {0}")]
    MultipleIdentities(usize),
    #[error("no routable address in front of the peer identity")]
    NoRoutablePrefix,
}

/// Why a dial attempt failed.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("no known address")]
    NoKnownAddress,
    #[error("unreachable: {0}")]
    Unreachable(#[source] io::Error),
    #[error("protocol {0} rejected")]
    ProtocolRejected(String),
    #[error("remote identified as {actual}")]
    IdentityMismatch { actual: PeerIdentity },
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl Error {
    pub(crate) fn invalid_address(address: &str, source: AddressError) -> Self {
        Error::InvalidAddress {
            address: address.to_string(),
            source,
        }
    }

    pub(crate) fn dial_failed(peer: &PeerIdentity, reason: DialError) -> Self {
        Error::DialFailed {
            peer: *peer,
            reason,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
