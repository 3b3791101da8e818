//! The replicated ledger: blocks, chain rules, and the merge decision.
//!
//! - **Blocks**: [`Block`] links to its predecessor through `prev_hash`; the
//!   hash is BLAKE3 over every other field.
//! - **Ledger**: [`Ledger`] is an append-only sequence of blocks rooted at a
//!   deterministic genesis shared by every fresh node.
//! - **Chain rules**: [`ChainRule`] decides whether a received ledger should
//!   replace the local one. [`LongestChain`] is the length-only rule;
//!   [`LongestValidChain`] additionally checks integrity and a shared root.
//! - **Merge**: [`merge`] applies a rule and replaces the local ledger
//!   wholesale, never partially.

use std::time::{SystemTime, UNIX_EPOCH};

use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload recorded in the genesis block.
pub const GENESIS_DATA: &str = "genesis";

/// One record of the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Seconds since the unix epoch at creation time.
    pub timestamp: u64,
    pub data: String,
    pub hash: String,
    pub prev_hash: String,
}

impl Block {
    /// The root every fresh ledger starts from.
    pub fn genesis() -> Self {
        Self::sealed(0, 0, GENESIS_DATA.to_string(), String::new())
    }

    /// A block following `prev`, or `None` once `prev.index` is `u64::MAX`.
    pub fn next(prev: &Block, data: String, timestamp: u64) -> Option<Self> {
        let index = prev.index.checked_add(1)?;
        Some(Self::sealed(index, timestamp, data, prev.hash.clone()))
    }

    fn sealed(index: u64, timestamp: u64, data: String, prev_hash: String) -> Self {
        let hash = compute_hash(index, timestamp, &data, &prev_hash);
        Self {
            index,
            timestamp,
            data,
            hash,
            prev_hash,
        }
    }

    /// Whether `hash` matches the block's contents.
    pub fn is_sealed(&self) -> bool {
        self.hash == compute_hash(self.index, self.timestamp, &self.data, &self.prev_hash)
    }

    /// Whether this block correctly extends `prev`.
    pub fn follows(&self, prev: &Block) -> bool {
        prev.index.checked_add(1) == Some(self.index)
            && self.prev_hash == prev.hash
            && self.is_sealed()
    }
}

/// Hex BLAKE3 digest of a block's fields, length-prefixed so that no two
/// distinct field tuples share an encoding.
pub fn compute_hash(index: u64, timestamp: u64, data: &str, prev_hash: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(&index.to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// A request from the interactive producer to append one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    pub data: String,
    /// Hash of the block this extension builds on; `None` means the current tip.
    pub parent: Option<String>,
}

impl Extension {
    /// Extension on top of whatever the tip is when it is applied.
    pub fn on_tip(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            parent: None,
        }
    }
}

/// Ordered, append-only sequence of blocks.
///
/// Serializes as a bare JSON array of blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    blocks: Vec<Block>,
}

impl Ledger {
    /// A ledger holding only the genesis block.
    pub fn genesis() -> Self {
        Self {
            blocks: vec![Block::genesis()],
        }
    }

    /// Wrap blocks without checking them; see [`Ledger::verify`].
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn root(&self) -> Option<&Block> {
        self.blocks.first()
    }

    /// A new ledger equal to this one plus a block carrying `extension.data`.
    ///
    /// Fails with [`Error::ExtensionRejected`] when the extension names a
    /// parent other than the current tip, and with [`Error::IndexExhausted`]
    /// when the tip already carries the largest index.
    pub fn extend(&self, extension: &Extension, timestamp: u64) -> Result<Ledger> {
        let tip_hash = self.tip().map(|tip| tip.hash.as_str()).unwrap_or_default();
        if let Some(parent) = &extension.parent {
            if parent != tip_hash {
                return Err(Error::ExtensionRejected {
                    expected: tip_hash.to_string(),
                    actual: parent.clone(),
                });
            }
        }

        let block = match self.tip() {
            Some(tip) => Block::next(tip, extension.data.clone(), timestamp)
                .ok_or(Error::IndexExhausted { tip: tip.index })?,
            None => Block::sealed(0, timestamp, extension.data.clone(), String::new()),
        };
        let mut blocks = self.blocks.clone();
        blocks.push(block);
        Ok(Ledger { blocks })
    }

    /// Every block is sealed and links to its predecessor.
    pub fn verify(&self) -> bool {
        let Some(root) = self.root() else {
            return true;
        };
        root.is_sealed()
            && self
                .blocks
                .windows(2)
                .all(|pair| pair[1].follows(&pair[0]))
    }
}

/// Decides whether a received ledger should replace the local one.
pub trait ChainRule: Send + Sync + 'static {
    fn prefers(&self, local: &Ledger, candidate: &Ledger) -> bool;
}

/// Strictly longer wins; ties keep the local ledger. Contents are not checked.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongestChain;

impl ChainRule for LongestChain {
    fn prefers(&self, local: &Ledger, candidate: &Ledger) -> bool {
        candidate.len() > local.len()
    }
}

/// [`LongestChain`], restricted to candidates that verify and share the local root.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongestValidChain;

impl ChainRule for LongestValidChain {
    fn prefers(&self, local: &Ledger, candidate: &Ledger) -> bool {
        LongestChain.prefers(local, candidate)
            && candidate.verify()
            && (local.is_empty() || local.root() == candidate.root())
    }
}

/// Result of offering a candidate ledger to [`merge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Replaced { previous_len: usize, new_len: usize },
    Kept { local_len: usize, candidate_len: usize },
}

/// Replace `local` with `candidate` when `rule` prefers it.
pub fn merge(local: &mut Ledger, candidate: Ledger, rule: &dyn ChainRule) -> MergeOutcome {
    if rule.prefers(local, &candidate) {
        let previous_len = local.len();
        *local = candidate;
        MergeOutcome::Replaced {
            previous_len,
            new_len: local.len(),
        }
    } else {
        MergeOutcome::Kept {
            local_len: local.len(),
            candidate_len: candidate.len(),
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
