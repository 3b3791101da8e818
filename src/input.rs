//! Sources of new ledger records for the interactive producer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::ledger::Extension;

const PROMPT: &[u8] = b"> ";

/// Blocking source of extensions; `None` means no more input will arrive.
#[async_trait]
pub trait ExtensionSource: Send + 'static {
    async fn next_extension(&mut self) -> Option<Extension>;
}

#[async_trait]
impl ExtensionSource for mpsc::Receiver<Extension> {
    async fn next_extension(&mut self) -> Option<Extension> {
        self.recv().await
    }
}

/// Reads one record per line, printing a prompt before each read.
///
/// Surrounding whitespace is trimmed and blank lines are skipped. Every line
/// becomes an extension of the tip current at the time it is applied.
///
/// A read interrupted by cancellation keeps the bytes it already consumed;
/// the next call continues the same line without prompting again.
pub struct LinePrompt<R, W> {
    reader: R,
    prompt: W,
    pending: Vec<u8>,
}

impl<R, W> LinePrompt<R, W> {
    pub fn new(reader: R, prompt: W) -> Self {
        Self {
            reader,
            prompt,
            pending: Vec::new(),
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.prompt)
    }
}

impl LinePrompt<BufReader<Stdin>, Stdout> {
    /// Prompt on stdout, read from stdin.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R, W> LinePrompt<R, W>
where
    W: AsyncWrite + Unpin,
{
    async fn show_prompt(&mut self) -> io::Result<()> {
        self.prompt.write_all(PROMPT).await?;
        self.prompt.flush().await
    }
}

#[async_trait]
impl<R, W> ExtensionSource for LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn next_extension(&mut self) -> Option<Extension> {
        loop {
            if self.pending.is_empty() {
                if let Err(err) = self.show_prompt().await {
                    warn!(%err, "failed to print prompt");
                }
            }
            let read = match self.reader.read_until(b'\n', &mut self.pending).await {
                Ok(read) => read,
                Err(err) => {
                    warn!(%err, "failed to read input");
                    return None;
                }
            };

            let at_eof = read == 0 || self.pending.last() != Some(&b'\n');
            let line = std::mem::take(&mut self.pending);
            let data = String::from_utf8_lossy(&line);
            let data = data.trim();
            if !data.is_empty() {
                return Some(Extension::on_tip(data));
            }
            if at_eof {
                return None;
            }
        }
    }
}

/// One input source shared by every session of a process.
///
/// Each extension is handed to exactly one caller.
#[derive(Clone)]
pub struct SharedSource {
    inner: Arc<Mutex<Box<dyn ExtensionSource>>>,
}

impl SharedSource {
    pub fn new(source: impl ExtensionSource) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(source))),
        }
    }

    pub async fn next_extension(&self) -> Option<Extension> {
        let mut source = self.inner.lock().await;
        source.next_extension().await
    }
}
