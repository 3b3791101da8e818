use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Error;
use crate::input::SharedSource;
use crate::net::{Host, PeerStream};
use crate::sync::{SharedLedger, SyncSession};

/// Invoked once for every inbound stream negotiated for the listened protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: PeerStream) -> Result<()>;
}

/// Accept streams for `protocol` until `shutdown` fires.
///
/// Each matching stream is handed to `handler` on its own task; streams
/// negotiated for other protocols are dropped. Returns early only if the
/// host stops accepting.
pub async fn listen<H>(
    host: Arc<H>,
    protocol: &str,
    handler: Arc<dyn StreamHandler>,
    shutdown: CancellationToken,
) -> Result<(), Error>
where
    H: Host + ?Sized,
{
    info!(protocol, peer = %host.local_peer(), "listening for streams");
    loop {
        let inbound = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            inbound = host.accept() => inbound?,
        };
        if inbound.protocol != protocol {
            debug!(peer = %inbound.peer, protocol = %inbound.protocol, "ignoring stream for other protocol");
            continue;
        }

        info!(peer = %inbound.peer, "accepted stream");
        let handler = handler.clone();
        tokio::spawn(async move {
            let stream = PeerStream::from(inbound);
            let peer = *stream.peer();
            if let Err(err) = handler.handle(stream).await {
                warn!(%peer, "stream handler failed: {err:#}");
            }
        });
    }
}

/// Runs a [`SyncSession`] on every accepted stream, all sharing one ledger.
#[derive(Clone)]
pub struct SyncHandler {
    ledger: SharedLedger,
    source: Option<SharedSource>,
    config: SyncConfig,
    shutdown: CancellationToken,
}

impl SyncHandler {
    pub fn new(ledger: SharedLedger, config: SyncConfig, shutdown: CancellationToken) -> Self {
        Self {
            ledger,
            source: None,
            config,
            shutdown,
        }
    }

    /// Feed the producer of every accepted session from `source`.
    pub fn with_source(mut self, source: SharedSource) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandler")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl StreamHandler for SyncHandler {
    async fn handle(&self, stream: PeerStream) -> Result<()> {
        let mut session = SyncSession::new(stream, self.ledger.clone(), self.config.clone());
        if let Some(source) = &self.source {
            session = session.with_source(source.clone());
        }
        session.run(self.shutdown.child_token()).await;
        Ok(())
    }
}
