//! Runtime knobs for sync sessions.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;

use crate::framing::MAX_MESSAGE_LEN;
use crate::ledger::{ChainRule, LongestChain, LongestValidChain};

/// Default period between two broadcasts of the local ledger.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Which rule decides whether a received ledger replaces the local one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ChainPolicy {
    /// Strictly longer ledger wins; contents are not checked.
    #[default]
    Longest,
    /// Strictly longer ledger wins if it verifies and shares the local genesis.
    LongestValid,
}

impl ChainPolicy {
    pub fn rule(self) -> Arc<dyn ChainRule> {
        match self {
            ChainPolicy::Longest => Arc::new(LongestChain),
            ChainPolicy::LongestValid => Arc::new(LongestValidChain),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub broadcast_interval: Duration,
    pub chain_policy: ChainPolicy,
    /// Longest line accepted from a peer; longer lines are skipped.
    pub max_message_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            chain_policy: ChainPolicy::default(),
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}
