//! Cached block: state machine, buffer and dirty-set back-reference

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;

use crate::dirty::DirtySet;
use crate::page::Page;
use crate::wait::WaitQueue;

bitflags! {
    /// Caller intent for `acquire`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcquireFlags: u32 {
        /// Initialize the buffer to zero and mark it up to date even if the
        /// block was never read
        const NEW = 1 << 0;
        /// Shared read intent
        const READ = 1 << 1;
        /// Intent to modify the buffer before `dirty_end`
        const WRITE = 1 << 2;
    }
}

/// A read is in flight; the buffer may be rewritten by completion
pub(crate) const BLK_READING: u32 = 1 << 0;
/// The buffer holds valid contents; set exactly once per residency
pub(crate) const BLK_UPTODATE: u32 = 1 << 1;
/// The block saw an I/O error; sticky for the current residency
pub(crate) const BLK_ERROR: u32 = 1 << 2;
/// The block belongs to a dirty set awaiting writeback
pub(crate) const BLK_DIRTY: u32 = 1 << 3;

/// One cached block
pub(crate) struct Block {
    bnr: u64,
    state: AtomicU32,
    /// Negative errno of the last failed I/O, 0 when none
    err: AtomicI32,
    /// Outstanding pins: caller references and in-flight I/O
    refs: AtomicUsize,
    /// Epoch at which the last pin was dropped; reclaim eligibility
    idle_epoch: AtomicU64,
    data: RwLock<Arc<Page>>,
    /// Back-reference to the owning dirty set. This is the one authoritative
    /// place for the block-to-set mapping.
    set: Mutex<Option<Arc<DirtySet>>>,
    pub(crate) wait: WaitQueue,
}

impl Block {
    pub fn new(bnr: u64, page: Page) -> Self {
        Self {
            bnr,
            state: AtomicU32::new(0),
            err: AtomicI32::new(0),
            refs: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
            data: RwLock::new(Arc::new(page)),
            set: Mutex::new(None),
            wait: WaitQueue::new(),
        }
    }

    pub fn bnr(&self) -> u64 {
        self.bnr
    }

    /// Atomically set `bits`, returning the previous state word
    pub fn set_state(&self, bits: u32) -> u32 {
        self.state.fetch_or(bits, Ordering::AcqRel)
    }

    /// Test-and-set of a single state bit; true when this caller won
    pub fn test_and_set_state(&self, bit: u32) -> bool {
        self.state.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Clear `bits` and wake everyone waiting on this block
    pub fn clear_state_wake(&self, bits: u32) {
        self.state.fetch_and(!bits, Ordering::Release);
        self.wait.wake_all();
    }

    pub fn state_contains(&self, bits: u32) -> bool {
        self.state.load(Ordering::Acquire) & bits != 0
    }

    /// Block until the given state bit clears
    pub fn wait_state_clear(&self, bit: u32) {
        self.wait.wait_until(|| !self.state_contains(bit));
    }

    pub fn store_err(&self, errno: i32) {
        self.err.store(errno, Ordering::Release);
    }

    pub fn err(&self) -> i32 {
        self.err.load(Ordering::Acquire)
    }

    /// Shared view of the current buffer, valid while the caller holds it
    pub fn buffer(&self) -> Arc<Page> {
        self.data.read().unwrap().clone()
    }

    /// Install a freshly read buffer, dropping the old one
    pub fn install_buffer(&self, page: Page) {
        *self.data.write().unwrap() = Arc::new(page);
    }

    /// Mutate the buffer contents. Snapshots handed out earlier (for
    /// example to an in-flight write) keep the old contents; the block gets
    /// a private copy to modify.
    pub fn update_buffer<F: FnOnce(&mut [u8])>(&self, f: F) {
        let mut guard = self.data.write().unwrap();
        f(Arc::make_mut(&mut *guard).as_mut_slice());
    }

    /// Zero the buffer in place
    pub fn zero_buffer(&self) {
        let mut guard = self.data.write().unwrap();
        Arc::make_mut(&mut *guard).fill(0);
    }

    pub fn pin(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin; true when this was the last one
    pub fn unpin(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn mark_idle(&self, epoch: u64) {
        self.idle_epoch.store(epoch, Ordering::Release);
    }

    pub fn idle_epoch(&self) -> u64 {
        self.idle_epoch.load(Ordering::Acquire)
    }

    /// Current dirty-set back-reference
    pub fn set_ref(&self) -> Option<Arc<DirtySet>> {
        self.set.lock().unwrap().clone()
    }

    /// Install `set` as the back-reference if the block has none. Returns
    /// the pre-existing set on contention.
    pub fn set_if_none(&self, set: &Arc<DirtySet>) -> Result<(), Arc<DirtySet>> {
        let mut guard = self.set.lock().unwrap();
        match &*guard {
            Some(existing) => Err(existing.clone()),
            None => {
                *guard = Some(set.clone());
                Ok(())
            }
        }
    }

    /// Rewrite the back-reference during a merge
    pub fn replace_set(&self, set: Option<Arc<DirtySet>>) {
        *self.set.lock().unwrap() = set;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("bnr", &self.bnr)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_flags_are_distinct() {
        assert!(!AcquireFlags::NEW.intersects(AcquireFlags::READ | AcquireFlags::WRITE));
        assert!(!AcquireFlags::READ.intersects(AcquireFlags::WRITE));
    }

    #[test]
    fn test_state_test_and_set() {
        let block = Block::new(1, Page::zeroed().unwrap());
        assert!(block.test_and_set_state(BLK_READING));
        assert!(!block.test_and_set_state(BLK_READING));
        assert!(block.state_contains(BLK_READING));
        block.clear_state_wake(BLK_READING);
        assert!(!block.state_contains(BLK_READING));
    }

    #[test]
    fn test_buffer_copy_on_write() {
        let block = Block::new(1, Page::zeroed().unwrap());
        let snapshot = block.buffer();
        block.update_buffer(|buf| buf[0] = 0xAA);
        // The snapshot taken before the update keeps the old contents
        assert_eq!(snapshot.as_slice()[0], 0);
        assert_eq!(block.buffer().as_slice()[0], 0xAA);
    }

    #[test]
    fn test_pin_unpin() {
        let block = Block::new(1, Page::zeroed().unwrap());
        block.pin();
        block.pin();
        assert!(!block.unpin());
        assert!(block.unpin());
    }
}
