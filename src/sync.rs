//! Duplex ledger synchronization over one peer stream.
//!
//! A [`SyncSession`] runs three activities on a single [`PeerStream`]:
//!
//! - **broadcaster**: writes a snapshot of the local ledger every
//!   `broadcast_interval`, starting immediately;
//! - **producer**: appends records arriving from a [`SharedSource`] and writes
//!   the new ledger right away;
//! - **reader**: decodes every incoming line and merges it into the local
//!   ledger according to the configured [`ChainPolicy`](crate::config::ChainPolicy).
//!
//! Both writers go through one [`MessageSink`], so their messages never
//! interleave. The ledger is shared through [`SharedLedger`], which swaps the
//! whole ledger under a write lock.
//!
//! Shutdown is cooperative. The reader reaching end of stream closes the whole
//! session; a failed write closes only the write side, leaving the reader to
//! drain whatever the peer still sends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::address::PeerIdentity;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::framing::{decode_message, encode_message, read_frame_limited};
use crate::input::SharedSource;
use crate::ledger::{merge, unix_now, ChainRule, Extension, Ledger, MergeOutcome};
use crate::net::PeerStream;

/// Handle onto the ledger shared by every activity of a process.
///
/// Clones refer to the same ledger. Every replacement publishes the new length
/// to [`SharedLedger::subscribe`] receivers.
#[derive(Clone)]
pub struct SharedLedger {
    inner: Arc<RwLock<Ledger>>,
    changes: Arc<watch::Sender<usize>>,
}

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        let (changes, _) = watch::channel(ledger.len());
        Self {
            inner: Arc::new(RwLock::new(ledger)),
            changes: Arc::new(changes),
        }
    }

    /// Point-in-time copy of the ledger.
    pub async fn snapshot(&self) -> Ledger {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Receives the ledger length after every replacement.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.changes.subscribe()
    }

    /// Offer a received ledger; it replaces the local one if `rule` prefers it.
    pub async fn merge(&self, candidate: Ledger, rule: &dyn ChainRule) -> MergeOutcome {
        let mut ledger = self.inner.write().await;
        let outcome = merge(&mut ledger, candidate, rule);
        if let MergeOutcome::Replaced { new_len, .. } = outcome {
            self.changes.send_replace(new_len);
        }
        outcome
    }

    /// Append one block built from `extension` and return the new ledger.
    pub async fn extend(&self, extension: &Extension, timestamp: u64) -> Result<Ledger> {
        let mut ledger = self.inner.write().await;
        let extended = ledger.extend(extension, timestamp)?;
        *ledger = extended.clone();
        self.changes.send_replace(extended.len());
        Ok(extended)
    }
}

/// Serialized write access to one stream.
///
/// Messages are encoded before the lock is taken; the lock covers the write
/// and the flush, so each message reaches the wire as one uninterrupted line.
pub struct MessageSink<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for MessageSink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<W> MessageSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, ledger: &Ledger) -> Result<()> {
        let line = encode_message(ledger)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(Error::StreamClosed)?;
        writer.flush().await.map_err(Error::StreamClosed)
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(Error::StreamClosed)
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    messages_sent: AtomicU64,
    merges_applied: AtomicU64,
    candidates_ignored: AtomicU64,
    decode_failures: AtomicU64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters collected over the lifetime of one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub peer: PeerIdentity,
    pub messages_sent: u64,
    pub merges_applied: u64,
    pub candidates_ignored: u64,
    pub decode_failures: u64,
}

/// The three sync activities bound to one stream.
pub struct SyncSession {
    stream: PeerStream,
    ledger: SharedLedger,
    source: Option<SharedSource>,
    config: SyncConfig,
}

impl SyncSession {
    pub fn new(stream: PeerStream, ledger: SharedLedger, config: SyncConfig) -> Self {
        Self {
            stream,
            ledger,
            source: None,
            config,
        }
    }

    /// Also run the producer, fed from `source`.
    pub fn with_source(mut self, source: SharedSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Run until the stream closes or `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> SessionReport {
        let peer = *self.stream.peer();
        let span = info_span!("sync", %peer);
        self.supervise(shutdown, peer).instrument(span).await
    }

    async fn supervise(self, shutdown: CancellationToken, peer: PeerIdentity) -> SessionReport {
        let session = shutdown.child_token();
        let writes = session.child_token();
        let stats = Arc::new(SessionStats::default());
        let rule = self.config.chain_policy.rule();

        let (reader, writer) = self.stream.into_parts();
        let sink = MessageSink::new(writer);
        let mut tasks = JoinSet::new();

        info!(policy = ?self.config.chain_policy, "sync session started");
        tasks.spawn(
            broadcast(
                self.ledger.clone(),
                sink.clone(),
                self.config.broadcast_interval,
                writes.clone(),
                stats.clone(),
            )
            .in_current_span(),
        );
        if let Some(source) = self.source {
            tasks.spawn(
                produce(
                    self.ledger.clone(),
                    sink.clone(),
                    source,
                    writes.clone(),
                    stats.clone(),
                )
                .in_current_span(),
            );
        }
        tasks.spawn(
            receive(
                reader,
                self.ledger.clone(),
                rule,
                self.config.max_message_len,
                session.clone(),
                stats.clone(),
            )
            .in_current_span(),
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(%err, "sync activity panicked");
                session.cancel();
            }
        }

        if let Err(err) = sink.shutdown().await {
            debug!(%err, "write side already closed");
        }

        let report = SessionReport {
            peer,
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            merges_applied: stats.merges_applied.load(Ordering::Relaxed),
            candidates_ignored: stats.candidates_ignored.load(Ordering::Relaxed),
            decode_failures: stats.decode_failures.load(Ordering::Relaxed),
        };
        info!(?report, "sync session finished");
        report
    }
}

/// Periodic broadcaster: one snapshot per tick until the write side closes.
async fn broadcast<W>(
    ledger: SharedLedger,
    sink: MessageSink<W>,
    period: time::Duration,
    writes: CancellationToken,
    stats: Arc<SessionStats>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = writes.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = ledger.snapshot().await;
        match sink.send(&snapshot).await {
            Ok(()) => {
                SessionStats::bump(&stats.messages_sent);
                debug!(len = snapshot.len(), "broadcast ledger");
            }
            Err(err) => {
                warn!(%err, "broadcast failed; closing write side");
                writes.cancel();
                break;
            }
        }
    }
}

/// Interactive producer: append each extension, then send the new ledger.
async fn produce<W>(
    ledger: SharedLedger,
    sink: MessageSink<W>,
    source: SharedSource,
    writes: CancellationToken,
    stats: Arc<SessionStats>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = writes.cancelled() => break,
            next = source.next_extension() => next,
        };
        let Some(extension) = next else {
            debug!("input source exhausted");
            break;
        };

        let extended = match ledger.extend(&extension, unix_now()).await {
            Ok(extended) => extended,
            Err(err) => {
                warn!(%err, "dropping extension");
                continue;
            }
        };
        info!(len = extended.len(), "appended local block");

        if let Err(err) = sink.send(&extended).await {
            warn!(%err, "sending new ledger failed; closing write side");
            writes.cancel();
            break;
        }
        SessionStats::bump(&stats.messages_sent);
    }
}

/// Continuous reader: merge every decodable message until the stream closes.
async fn receive<R>(
    mut reader: R,
    ledger: SharedLedger,
    rule: Arc<dyn ChainRule>,
    max_message_len: usize,
    session: CancellationToken,
    stats: Arc<SessionStats>,
) where
    R: AsyncBufRead + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            _ = session.cancelled() => return,
            frame = read_frame_limited(&mut reader, max_message_len) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("peer closed the stream");
                break;
            }
            Err(err @ Error::FrameTooLong { .. }) => {
                SessionStats::bump(&stats.decode_failures);
                warn!(%err, "skipping oversized message");
                continue;
            }
            Err(err) => {
                warn!(%err, "reading from stream failed");
                break;
            }
        };
        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let candidate = match decode_message(&frame) {
            Ok(candidate) => candidate,
            Err(err) => {
                SessionStats::bump(&stats.decode_failures);
                warn!(%err, bytes = frame.len(), "skipping malformed message");
                continue;
            }
        };

        match ledger.merge(candidate, rule.as_ref()).await {
            MergeOutcome::Replaced {
                previous_len,
                new_len,
            } => {
                SessionStats::bump(&stats.merges_applied);
                info!(previous_len, new_len, "adopted longer ledger from peer");
            }
            MergeOutcome::Kept {
                local_len,
                candidate_len,
            } => {
                SessionStats::bump(&stats.candidates_ignored);
                debug!(local_len, candidate_len, "kept local ledger");
            }
        }
    }
    session.cancel();
}
