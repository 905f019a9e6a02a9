use derive_more::Constructor;

/// A processed head together with the finality information observed when it was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Constructor)]
pub struct SavedBlock<H> {
    /// The saved head.
    pub head: H,
    /// The latest finalized block number at the time the head was saved.
    ///
    /// Reorg resolution never walks below this number when starting from this block.
    pub finalized_block_number: u64,
}
