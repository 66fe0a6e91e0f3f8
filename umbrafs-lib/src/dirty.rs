//! Dirty sets: groups of blocks that reach the storage layer atomically

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::Block;
use crate::wait::WaitQueue;

/// A dirtier holds the set for membership changes; excludes writeback
pub(crate) const SET_DIRTYING: u32 = 1 << 0;
/// The set is populated and queued for writeback
pub(crate) const SET_DIRTY: u32 = 1 << 1;
/// The set's blocks are being written back; excludes dirtying
pub(crate) const SET_WRITEBACK: u32 = 1 << 2;

/// A group of dirty blocks committed to storage together
pub(crate) struct DirtySet {
    state: AtomicU32,
    /// Stamped from the process-wide counter when SET_DIRTY is first set;
    /// determines writeback dispatch order
    dirty_seq: AtomicU64,
    /// Cardinality of the block list
    size: AtomicUsize,
    /// Blocks submitted and not yet completed during writeback
    submitted: AtomicUsize,
    /// First write error observed during the current writeback, negative errno
    write_err: AtomicI32,
    /// Members in order of entry
    blocks: Mutex<Vec<Arc<Block>>>,
    pub(crate) wait: WaitQueue,
}

impl DirtySet {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            dirty_seq: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
            write_err: AtomicI32::new(0),
            blocks: Mutex::new(Vec::new()),
            wait: WaitQueue::new(),
        }
    }

    pub fn set_state(&self, bits: u32) -> u32 {
        self.state.fetch_or(bits, Ordering::AcqRel)
    }

    /// Test-and-set of one state bit; true when this caller won
    pub fn test_and_set_state(&self, bit: u32) -> bool {
        self.state.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn clear_state_wake(&self, bits: u32) {
        self.state.fetch_and(!bits, Ordering::Release);
        self.wait.wake_all();
    }

    pub fn state_contains(&self, bits: u32) -> bool {
        self.state.load(Ordering::Acquire) & bits != 0
    }

    pub fn wait_state_clear(&self, bit: u32) {
        self.wait.wait_until(|| !self.state_contains(bit));
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn add_size(&self, n: usize) {
        self.size.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub_size(&self, n: usize) {
        self.size.fetch_sub(n, Ordering::AcqRel);
    }

    pub fn dirty_seq(&self) -> u64 {
        self.dirty_seq.load(Ordering::Acquire)
    }

    pub fn stamp_dirty_seq(&self, seq: u64) {
        self.dirty_seq.store(seq, Ordering::Release);
    }

    pub fn submitted_add(&self, n: usize) {
        self.submitted.fetch_add(n, Ordering::AcqRel);
    }

    /// Drop one submitted block; true when this was the last outstanding one
    pub fn submitted_dec(&self) -> bool {
        self.submitted.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn record_write_err(&self, errno: i32) {
        // Keep the first error
        let _ = self
            .write_err
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn take_write_err(&self) -> i32 {
        self.write_err.swap(0, Ordering::AcqRel)
    }

    /// Append a block to the member list
    pub fn push_block(&self, block: Arc<Block>) {
        self.blocks.lock().unwrap().push(block);
        self.add_size(1);
    }

    /// Remove one block from the member list (merge unwind path)
    pub fn remove_block(&self, block: &Arc<Block>) {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(pos) = blocks.iter().position(|b| Arc::ptr_eq(b, block)) {
            blocks.remove(pos);
            self.sub_size(1);
        }
    }

    /// Move every member out, emptying the set
    pub fn take_blocks(&self) -> Vec<Arc<Block>> {
        let mut blocks = self.blocks.lock().unwrap();
        let drained = std::mem::take(&mut *blocks);
        self.size.store(0, Ordering::Release);
        drained
    }

    /// Splice `drained` members onto the end of this set's list
    pub fn extend_blocks(&self, drained: Vec<Arc<Block>>) {
        let n = drained.len();
        self.blocks.lock().unwrap().extend(drained);
        self.add_size(n);
    }

    /// Snapshot of the member list
    pub fn blocks_snapshot(&self) -> Vec<Arc<Block>> {
        self.blocks.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for DirtySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtySet")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("dirty_seq", &self.dirty_seq.load(Ordering::Relaxed))
            .field("size", &self.size.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    #[test]
    fn test_set_state_bits() {
        let set = DirtySet::new();
        assert!(set.test_and_set_state(SET_DIRTYING));
        assert!(!set.test_and_set_state(SET_DIRTYING));
        set.clear_state_wake(SET_DIRTYING);
        assert!(set.test_and_set_state(SET_DIRTYING));
    }

    #[test]
    fn test_size_tracks_block_list() {
        let set = DirtySet::new();
        let a = Arc::new(Block::new(1, Page::zeroed().unwrap()));
        let b = Arc::new(Block::new(2, Page::zeroed().unwrap()));
        set.push_block(a.clone());
        set.push_block(b.clone());
        assert_eq!(set.size(), 2);
        assert_eq!(set.blocks_snapshot().len(), set.size());

        set.remove_block(&a);
        assert_eq!(set.size(), 1);

        let drained = set.take_blocks();
        assert_eq!(drained.len(), 1);
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn test_first_write_error_is_kept() {
        let set = DirtySet::new();
        set.record_write_err(-5);
        set.record_write_err(-28);
        assert_eq!(set.take_write_err(), -5);
        assert_eq!(set.take_write_err(), 0);
    }
}
