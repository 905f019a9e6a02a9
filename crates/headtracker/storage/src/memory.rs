//! In-memory chain history.

use crate::{HeadStorageReader, HeadStorageWriter, SavedBlock, StorageError};
use alloy_primitives::B256;
use kona_headtracker_types::{ChainHead, Log};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, trace};

/// Bounded, in-memory record of the chain state already processed by the tracker.
///
/// Heads are indexed by hash and by number; several competing heads may share a number while a
/// reorg is being resolved. Processed blocks are kept for `history_depth` heights, and never
/// below the finalized block recorded with the latest one, so reorg resolution can always walk
/// down to finality. Logs are indexed by block number and are retained independently of the
/// heads. A single [`RwLock`] guards the whole history so every write is atomic.
#[derive(Debug)]
pub struct InMemoryHeadSaver<H> {
    history_depth: u64,
    log_retention: u64,
    inner: RwLock<ChainHistory<H>>,
}

#[derive(Debug)]
struct ChainHistory<H> {
    heads: HashMap<B256, SavedBlock<H>>,
    /// Hashes per block number, in insertion order.
    by_number: BTreeMap<u64, Vec<B256>>,
    latest: Option<B256>,
    logs: BTreeMap<u64, Vec<Log>>,
}

impl<H> Default for ChainHistory<H> {
    fn default() -> Self {
        Self {
            heads: HashMap::new(),
            by_number: BTreeMap::new(),
            latest: None,
            logs: BTreeMap::new(),
        }
    }
}

impl<H: ChainHead> InMemoryHeadSaver<H> {
    /// Creates an empty saver that keeps the `history_depth` most recent block heights.
    ///
    /// Logs are kept until they are removed with their block by
    /// [`HeadStorageWriter::delete_from`].
    pub fn new(history_depth: u64) -> Self {
        Self {
            history_depth: history_depth.max(1),
            log_retention: 0,
            inner: RwLock::new(ChainHistory::default()),
        }
    }

    /// Drops logs of blocks more than `log_retention` blocks below the finalized block recorded
    /// with the latest saved block. Zero keeps every log.
    pub const fn with_log_retention(mut self, log_retention: u64) -> Self {
        self.log_retention = log_retention;
        self
    }

    /// Returns the configured retention window.
    pub const fn history_depth(&self) -> u64 {
        self.history_depth
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ChainHistory<H>>, StorageError> {
        self.inner.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ChainHistory<H>>, StorageError> {
        self.inner.write().map_err(|_| StorageError::LockPoisoned)
    }
}

impl<H: ChainHead> ChainHistory<H> {
    fn latest_block(&self) -> Option<&SavedBlock<H>> {
        self.latest.and_then(|hash| self.heads.get(&hash))
    }

    fn latest_number(&self) -> Option<u64> {
        self.latest_block().map(|b| b.head.block_number())
    }

    /// Lowest height inside the `history_depth` window ending at the latest head.
    fn window_start(&self, history_depth: u64) -> u64 {
        self.latest_number().map_or(0, |latest| (latest + 1).saturating_sub(history_depth))
    }

    fn insert(&mut self, block: SavedBlock<H>) {
        let hash = block.head.block_hash();
        let number = block.head.block_number();
        if self.heads.contains_key(&hash) {
            trace!(
                target: "headtracker::storage",
                block_number = number,
                %hash,
                "Head already stored"
            );
            return;
        }

        let at_number = self.by_number.entry(number).or_default();
        if !at_number.is_empty() {
            debug!(
                target: "headtracker::storage",
                block_number = number,
                %hash,
                competitors = at_number.len(),
                "Storing competing head at known height"
            );
        }
        at_number.push(hash);
        self.heads.insert(hash, block);

        if self.latest_number().is_none_or(|latest| number > latest) {
            self.latest = Some(hash);
        }
    }

    fn insert_logs(&mut self, logs: Vec<Log>) {
        for log in logs {
            let at_number = self.logs.entry(log.block_number).or_default();
            if at_number.iter().any(|existing| existing.id() == log.id()) {
                continue;
            }
            let pos = at_number.partition_point(|existing| existing.log_index <= log.log_index);
            at_number.insert(pos, log);
        }
    }

    fn evict_heads(&mut self, cutoff: u64) {
        if cutoff == 0 {
            return;
        }
        let retained = self.by_number.split_off(&cutoff);
        let evicted = std::mem::replace(&mut self.by_number, retained);
        for hash in evicted.into_values().flatten() {
            self.heads.remove(&hash);
        }
    }

    fn evict_logs(&mut self, log_retention: u64) {
        if log_retention == 0 {
            return;
        }
        let Some(finalized) = self.latest_block().map(|b| b.finalized_block_number) else {
            return;
        };
        let cutoff = finalized.saturating_sub(log_retention);
        if cutoff > 0 {
            self.logs = self.logs.split_off(&cutoff);
        }
    }

    fn truncate(&mut self, block_number: u64) {
        for hash in self.by_number.split_off(&block_number).into_values().flatten() {
            self.heads.remove(&hash);
        }
        self.logs.retain(|number, _| *number < block_number);

        self.latest = self
            .by_number
            .last_key_value()
            .and_then(|(_, hashes)| hashes.last().copied());
    }

    fn chain(&self, block_hash: B256) -> Vec<H> {
        let mut chain = Vec::new();
        let mut next = self.heads.get(&block_hash);
        while let Some(block) = next {
            chain.push(block.head.clone());
            next = self.heads.get(&block.head.parent_hash());
        }
        chain
    }
}

impl<H: ChainHead> HeadStorageReader for InMemoryHeadSaver<H> {
    type Head = H;

    fn latest_block(&self) -> Result<Option<SavedBlock<H>>, StorageError> {
        let history = self.read()?;
        Ok(history.latest.and_then(|hash| history.heads.get(&hash)).cloned())
    }

    fn block_by_number(&self, block_number: u64) -> Result<Option<SavedBlock<H>>, StorageError> {
        let history = self.read()?;
        Ok(history
            .by_number
            .get(&block_number)
            .and_then(|hashes| hashes.last())
            .and_then(|hash| history.heads.get(hash))
            .cloned())
    }

    fn head_by_hash(&self, block_hash: B256) -> Result<Option<H>, StorageError> {
        Ok(self.read()?.heads.get(&block_hash).map(|block| block.head.clone()))
    }

    fn chain(&self, block_hash: B256) -> Result<Vec<H>, StorageError> {
        Ok(self.read()?.chain(block_hash))
    }

    fn latest_chain(&self) -> Result<Vec<H>, StorageError> {
        let history = self.read()?;
        Ok(history.latest.map(|hash| history.chain(hash)).unwrap_or_default())
    }

    fn logs_by_block_hash(&self, block_hash: B256) -> Result<Vec<Log>, StorageError> {
        Ok(self
            .read()?
            .logs
            .values()
            .flatten()
            .filter(|log| log.block_hash == block_hash)
            .cloned()
            .collect())
    }

    fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<Log>, StorageError> {
        if from > to {
            return Err(StorageError::InvalidRange { from, to });
        }
        Ok(self.read()?.logs.range(from..=to).flat_map(|(_, logs)| logs.iter().cloned()).collect())
    }
}

impl<H: ChainHead> HeadStorageWriter for InMemoryHeadSaver<H> {
    fn store_block_logs(&self, block: SavedBlock<H>, logs: Vec<Log>) -> Result<(), StorageError> {
        let mut history = self.write()?;
        history.insert(block);
        history.insert_logs(logs);

        let finalized = history.latest_block().map_or(0, |b| b.finalized_block_number);
        let cutoff = history.window_start(self.history_depth).min(finalized);
        history.evict_heads(cutoff);
        history.evict_logs(self.log_retention);
        Ok(())
    }

    fn store_logs(&self, logs: Vec<Log>) -> Result<(), StorageError> {
        self.write()?.insert_logs(logs);
        Ok(())
    }

    fn add_heads(
        &self,
        history_depth: u64,
        blocks: Vec<SavedBlock<H>>,
    ) -> Result<(), StorageError> {
        let mut history = self.write()?;
        for block in blocks {
            history.insert(block);
        }
        let cutoff = history.window_start(history_depth.max(1));
        history.evict_heads(cutoff);
        history.evict_logs(self.log_retention);
        Ok(())
    }

    fn delete_from(&self, block_number: u64) -> Result<(), StorageError> {
        self.write()?.truncate(block_number);
        Ok(())
    }
}
