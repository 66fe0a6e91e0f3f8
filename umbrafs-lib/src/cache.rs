//! Concurrent block cache: read-through lookup, dirty tracking, grouped
//! writeback and deferred reclamation
//!
//! The cache is a sharded hash table of blocks driven by two dedicated
//! workers. The submission worker feeds the transport under queue-depth
//! pacing; the writeback worker turns dirty sets into submissions. All
//! public entry points are safe to call from any number of threads.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;

use log::{debug, trace, warn};

use crate::block::{AcquireFlags, Block, BLK_DIRTY, BLK_ERROR, BLK_READING, BLK_UPTODATE};
use crate::dirty::{DirtySet, SET_DIRTY, SET_DIRTYING, SET_WRITEBACK};
use crate::error::{UmbraFSError, UmbraFSResult};
use crate::format::constants;
use crate::page::{Page, PagePool, PoolStats};
use crate::transport::{BlockOp, BlockTransport};
use crate::wait::WaitQueue;

const SHARD_COUNT: usize = 64;
const SHARD_MASK: u64 = (SHARD_COUNT - 1) as u64;

/// Tunables of one cache instance. The defaults match the constants in
/// `format::constants`; tests shrink them to exercise the limits.
#[derive(Debug, Clone)]
pub struct CacheTuning {
    /// Admission threshold for new dirtying callers
    pub dirty_limit: usize,
    /// Dirty backlog that triggers background writeback
    pub writeback_thresh: usize,
    /// Maximum blocks in one dirty set
    pub set_limit: usize,
    /// Free pages kept by the page pool
    pub max_free_pages: usize,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            dirty_limit: constants::DIRTY_LIMIT,
            writeback_thresh: constants::WRITEBACK_THRESH,
            set_limit: constants::SET_LIMIT,
            max_free_pages: 256,
        }
    }
}

/// Cache counters, exposed for observation
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub cached_blocks: usize,
    pub nr_dirty: usize,
    pub nr_writeback: usize,
    pub nr_submitted: usize,
    pub dirty_seq: u64,
    pub writeback_seq: u64,
    pub sync_seq: u64,
    pub pool: PoolStats,
}

/// Kick endpoint of a worker: a pending flag paired with a wakeup
struct Kick {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Kick {
    fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn kick(&self) {
        *self.pending.lock().unwrap() = true;
        self.cond.notify_one();
    }

    /// Wait for the next kick; false once shutdown is requested
    fn wait(&self, shutdown: &AtomicBool) -> bool {
        let mut pending = self.pending.lock().unwrap();
        while !*pending && !shutdown.load(Ordering::Acquire) {
            pending = self.cond.wait(pending).unwrap();
        }
        *pending = false;
        !shutdown.load(Ordering::Acquire)
    }
}

struct SyncState {
    /// Latched writeback error, negative errno; held while waiters exist
    err: i32,
    waiters: usize,
}

pub(crate) struct CacheInner {
    tuning: CacheTuning,
    shards: Vec<RwLock<HashMap<u64, Arc<Block>>>>,
    pool: Arc<PagePool>,
    transport: OnceLock<Box<dyn BlockTransport>>,
    queue_depth: AtomicUsize,

    nr_dirty: AtomicUsize,
    nr_writeback: AtomicUsize,
    nr_submitted: AtomicUsize,
    dirty_seq: AtomicU64,
    writeback_seq: AtomicU64,
    sync_seq: AtomicU64,
    epoch: AtomicU64,

    submit_pending: Mutex<VecDeque<Arc<Block>>>,
    writeback_pending: Mutex<VecDeque<Arc<DirtySet>>>,
    reclaim_pending: Mutex<Vec<Arc<Block>>>,

    submit_kick: Kick,
    writeback_kick: Kick,
    /// Waiters on dirty admission and on sync progress
    threshold: WaitQueue,
    sync_state: Mutex<SyncState>,

    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Completion entry point handed to transports. Completions arriving after
/// the cache is gone are dropped.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Weak<CacheInner>,
}

impl CompletionHandle {
    /// Deliver the end of one I/O. `err` is zero on success, otherwise the
    /// negative errno. Read completions may carry a freshly filled buffer
    /// to install under the block.
    pub fn end_io(&self, bnr: u64, fresh: Option<Page>, err: i32) {
        if let Some(inner) = self.inner.upgrade() {
            end_io(&inner, bnr, fresh, err);
        }
    }
}

/// A pinned reference to a cached block. The buffer stays resident and
/// readable for as long as the reference lives; dropping it releases the
/// pin.
pub struct BlockRef {
    inner: Arc<CacheInner>,
    block: Arc<Block>,
}

impl BlockRef {
    pub fn bnr(&self) -> u64 {
        self.block.bnr()
    }

    /// Shared view of the block contents
    pub fn buffer(&self) -> Arc<Page> {
        self.block.buffer()
    }

    /// Mutate the block contents in place. Only valid under write intent
    /// between `dirty_begin` and `dirty_end`; an in-flight writeback keeps
    /// its own snapshot of the old contents.
    pub fn update<F: FnOnce(&mut [u8])>(&self, f: F) {
        self.block.update_buffer(f);
    }

    pub(crate) fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        self.block.pin();
        Self {
            inner: self.inner.clone(),
            block: self.block.clone(),
        }
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        put_block(&self.inner, &self.block);
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockRef(bnr={})", self.bnr())
    }
}

/// The block cache. Wrap it in an `Arc` to share across threads; dropping
/// the instance shuts the workers down.
pub struct BlockCache {
    inner: Arc<CacheInner>,
}

impl BlockCache {
    /// Build a cache over the transport produced by `make_transport`. The
    /// factory receives the completion handle the transport must feed.
    pub fn new<F>(tuning: CacheTuning, make_transport: F) -> UmbraFSResult<Self>
    where
        F: FnOnce(CompletionHandle) -> UmbraFSResult<Box<dyn BlockTransport>>,
    {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        let pool = Arc::new(PagePool::new(tuning.max_free_pages));
        let inner = Arc::new(CacheInner {
            tuning,
            shards,
            pool,
            transport: OnceLock::new(),
            queue_depth: AtomicUsize::new(1),
            nr_dirty: AtomicUsize::new(0),
            nr_writeback: AtomicUsize::new(0),
            nr_submitted: AtomicUsize::new(0),
            dirty_seq: AtomicU64::new(0),
            writeback_seq: AtomicU64::new(0),
            sync_seq: AtomicU64::new(0),
            epoch: AtomicU64::new(1),
            submit_pending: Mutex::new(VecDeque::new()),
            writeback_pending: Mutex::new(VecDeque::new()),
            reclaim_pending: Mutex::new(Vec::new()),
            submit_kick: Kick::new(),
            writeback_kick: Kick::new(),
            threshold: WaitQueue::new(),
            sync_state: Mutex::new(SyncState { err: 0, waiters: 0 }),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let handle = CompletionHandle {
            inner: Arc::downgrade(&inner),
        };
        let transport = make_transport(handle)?;
        inner
            .queue_depth
            .store(transport.queue_depth().max(1), Ordering::Release);
        if inner.transport.set(transport).is_err() {
            return Err(UmbraFSError::InvalidArgument);
        }

        let mut workers = inner.workers.lock().unwrap();
        {
            let inner = inner.clone();
            workers.push(std::thread::spawn(move || submit_worker(&inner)));
        }
        {
            let inner = inner.clone();
            workers.push(std::thread::spawn(move || writeback_worker(&inner)));
        }
        drop(workers);

        Ok(Self { inner })
    }

    /// Completion handle of this cache, for transports constructed late
    pub fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Page pool shared with transports
    pub fn pool(&self) -> Arc<PagePool> {
        self.inner.pool.clone()
    }

    /// Acquire a reference to block `bnr` whose buffer is ready to read.
    ///
    /// `NEW` initializes the buffer to zero without reading; `READ` and
    /// `WRITE` declare the caller's intent and are mutually exclusive.
    /// Missing blocks are read through the transport; every concurrent
    /// acquirer of the same missing block waits on the one submission.
    pub fn acquire(&self, bnr: u64, flags: AcquireFlags) -> UmbraFSResult<BlockRef> {
        let inner = &self.inner;

        if flags.is_empty() || flags.contains(AcquireFlags::READ | AcquireFlags::WRITE) {
            return Err(UmbraFSError::InvalidArgument);
        }

        let block = lookup_or_insert(inner, bnr)?;
        let r = BlockRef {
            inner: inner.clone(),
            block,
        };

        if flags.contains(AcquireFlags::NEW) && !r.block.state_contains(BLK_UPTODATE) {
            r.block.zero_buffer();
            r.block.set_state(BLK_UPTODATE);
            r.block.wait.wake_all();
        }

        if r.block.state_contains(BLK_ERROR) {
            return Err(UmbraFSError::Io(r.block.err()));
        }

        if !r.block.state_contains(BLK_UPTODATE) {
            if r.block.test_and_set_state(BLK_READING) {
                // This caller owns the read: pin for the in-flight I/O and
                // hand the block to the submission worker
                r.block.pin();
                inner.submit_pending.lock().unwrap().push_back(r.block.clone());
                inner.submit_kick.kick();
                trace!("read-through submit bnr={}", bnr);
            }
            r.block.wait_state_clear(BLK_READING);
            if r.block.state_contains(BLK_ERROR) {
                return Err(UmbraFSError::Io(r.block.err()));
            }
        }

        if flags.contains(AcquireFlags::WRITE) && !r.block.state_contains(BLK_DIRTY) {
            wait_dirty_admission(inner);
        }

        Ok(r)
    }

    /// Bracket opening for modifying a batch of write-acquired blocks.
    /// Merges the blocks into exactly one dirty set and leaves that set
    /// leased to the caller until the matching `dirty_end`.
    pub fn dirty_begin(&self, refs: &[BlockRef]) -> UmbraFSResult<()> {
        dirty_begin(&self.inner, refs)
    }

    /// Close the modification bracket opened by `dirty_begin`
    pub fn dirty_end(&self, refs: &[BlockRef]) {
        if refs.is_empty() {
            return;
        }
        let set = refs[0]
            .block()
            .set_ref()
            .expect("dirty_end without matching dirty_begin");
        set.clear_state_wake(SET_DIRTYING);
        self.inner.writeback_kick.kick();
    }

    /// Wait until every block that was dirty at call time has been written
    /// back, or until one of them fails. Concurrent callers share a failure.
    pub fn sync(&self) -> UmbraFSResult<()> {
        let target = self.inner.dirty_seq.load(Ordering::Acquire);
        sync_up_to(&self.inner, target)
    }

    /// Remove unreferenced blocks whose last pin was dropped at least one
    /// epoch ago. Returns the number of blocks reclaimed.
    pub fn reclaim(&self) -> usize {
        reclaim(&self.inner)
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let cached_blocks = inner
            .shards
            .iter()
            .map(|s| s.read().unwrap().len())
            .sum();
        CacheStats {
            cached_blocks,
            nr_dirty: inner.nr_dirty.load(Ordering::Acquire),
            nr_writeback: inner.nr_writeback.load(Ordering::Acquire),
            nr_submitted: inner.nr_submitted.load(Ordering::Acquire),
            dirty_seq: inner.dirty_seq.load(Ordering::Acquire),
            writeback_seq: inner.writeback_seq.load(Ordering::Acquire),
            sync_seq: inner.sync_seq.load(Ordering::Acquire),
            pool: inner.pool.stats(),
        }
    }

    /// Stop the workers and the transport. Dirty blocks still cached are
    /// lost; call `sync` first when they matter.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(t) = inner.transport.get() {
            t.shutdown();
        }
        inner.submit_kick.kick();
        inner.writeback_kick.kick();
        inner.threshold.wake_all();
        let workers = std::mem::take(&mut *inner.workers.lock().unwrap());
        for w in workers {
            let _ = w.join();
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn shard_of(inner: &CacheInner, bnr: u64) -> &RwLock<HashMap<u64, Arc<Block>>> {
    &inner.shards[(bnr & SHARD_MASK) as usize]
}

fn lookup_raw(inner: &CacheInner, bnr: u64) -> Option<Arc<Block>> {
    shard_of(inner, bnr).read().unwrap().get(&bnr).cloned()
}

/// Find `bnr`, inserting a fresh block on miss. The returned block carries
/// one new pin, taken while the shard lock is held so that a concurrent
/// reclaim cannot free it.
fn lookup_or_insert(inner: &CacheInner, bnr: u64) -> UmbraFSResult<Arc<Block>> {
    {
        let map = shard_of(inner, bnr).read().unwrap();
        if let Some(b) = map.get(&bnr) {
            b.pin();
            return Ok(b.clone());
        }
    }

    let page = inner.pool.alloc()?;
    let fresh = Arc::new(Block::new(bnr, page));
    let mut map = shard_of(inner, bnr).write().unwrap();
    match map.entry(bnr) {
        Entry::Occupied(e) => {
            // Lost the insertion race; the loser is dropped
            let b = e.get().clone();
            b.pin();
            Ok(b)
        }
        Entry::Vacant(v) => {
            fresh.pin();
            v.insert(fresh.clone());
            Ok(fresh)
        }
    }
}

/// Drop one pin; the block becomes a reclaim candidate when idle
fn put_block(inner: &CacheInner, block: &Arc<Block>) {
    if block.unpin() {
        block.mark_idle(inner.epoch.load(Ordering::Acquire));
        inner.reclaim_pending.lock().unwrap().push(block.clone());
    }
}

/// Advance the epoch and drop blocks that have been idle for a full one
fn reclaim(inner: &CacheInner) -> usize {
    let before = inner.epoch.fetch_add(1, Ordering::AcqRel);
    let candidates = std::mem::take(&mut *inner.reclaim_pending.lock().unwrap());
    let mut freed = 0;
    let mut keep = Vec::new();
    for block in candidates {
        if block.refs() != 0 {
            // Re-pinned since going idle; it re-registers when idle again
            continue;
        }
        if block.state_contains(BLK_DIRTY | BLK_READING) {
            keep.push(block);
            continue;
        }
        if block.idle_epoch() >= before {
            // Not yet a full epoch idle
            keep.push(block);
            continue;
        }
        let mut map = shard_of(inner, block.bnr()).write().unwrap();
        match map.get(&block.bnr()) {
            Some(b) if Arc::ptr_eq(b, &block) && block.refs() == 0 => {
                map.remove(&block.bnr());
                freed += 1;
            }
            _ => {}
        }
    }
    if !keep.is_empty() {
        inner.reclaim_pending.lock().unwrap().extend(keep);
    }
    if freed > 0 {
        debug!("reclaimed {} idle blocks", freed);
    }
    freed
}

fn latch_sync_err(inner: &CacheInner, errno: i32) {
    {
        let mut st = inner.sync_state.lock().unwrap();
        if st.waiters > 0 && st.err == 0 {
            st.err = errno;
        }
    }
    inner.threshold.wake_all();
}

/// Transport completion. A lookup miss here is a broken transport and
/// terminates the process.
pub(crate) fn end_io(inner: &Arc<CacheInner>, bnr: u64, fresh: Option<Page>, err: i32) {
    let block = lookup_raw(inner, bnr).expect("end_io for a block not in the cache");

    if err < 0 {
        warn!("I/O error on bnr={}: errno {}", bnr, err);
        block.set_state(BLK_ERROR);
        block.store_err(err);
    }

    if block.state_contains(BLK_READING) {
        // Read completion
        if err < 0 {
            latch_sync_err(inner, err);
        }
        if let Some(page) = fresh {
            block.install_buffer(page);
        }
        if err >= 0 {
            block.set_state(BLK_UPTODATE);
        }
        block.clear_state_wake(BLK_READING);
        inner.nr_submitted.fetch_sub(1, Ordering::AcqRel);
        put_block(inner, &block);
        inner.submit_kick.kick();
        return;
    }

    // Write completion. The set's bookkeeping (and on failure, its return
    // to the dirty queue) must settle before nr_writeback drops, so a sync
    // waiter never observes a quiet cache with the error still unlatched.
    inner.nr_submitted.fetch_sub(1, Ordering::AcqRel);
    let set = block
        .set_ref()
        .expect("write completion for a block without a dirty set");
    if err < 0 {
        set.record_write_err(err);
    }
    put_block(inner, &block);
    if set.submitted_dec() {
        writeback_complete(inner, &set);
    }
    inner.nr_writeback.fetch_sub(1, Ordering::AcqRel);
    inner.submit_kick.kick();
    inner.writeback_kick.kick();
    inner.threshold.wake_all();
}

/// Last write of a set finished: detach members on success, or return the
/// set to the dirty queue on failure so the data is retried rather than
/// silently dropped.
fn writeback_complete(inner: &Arc<CacheInner>, set: &Arc<DirtySet>) {
    let werr = set.take_write_err();
    if werr != 0 {
        set.clear_state_wake(SET_WRITEBACK);
        {
            let mut pending = inner.writeback_pending.lock().unwrap();
            let seq = inner.dirty_seq.fetch_add(1, Ordering::AcqRel) + 1;
            set.stamp_dirty_seq(seq);
            pending.push_back(set.clone());
        }
        latch_sync_err(inner, werr);
        inner.threshold.wake_all();
        return;
    }

    let blocks = set.take_blocks();
    let n = blocks.len();
    for b in &blocks {
        b.clear_state_wake(BLK_DIRTY);
        b.replace_set(None);
    }
    inner.nr_dirty.fetch_sub(n, Ordering::AcqRel);
    set.clear_state_wake(SET_DIRTY | SET_WRITEBACK);
    inner.threshold.wake_all();
}

fn wait_dirty_admission(inner: &CacheInner) {
    if inner.nr_dirty.load(Ordering::Acquire) < inner.tuning.dirty_limit {
        return;
    }
    inner.writeback_kick.kick();
    inner.threshold.wait_until(|| {
        inner.nr_dirty.load(Ordering::Acquire) < inner.tuning.dirty_limit
            || inner.shutdown.load(Ordering::Acquire)
    });
}

/// Wait until every set stamped up to `target` has left writeback, or until
/// a writeback error is latched for the waiters present.
pub(crate) fn sync_up_to(inner: &Arc<CacheInner>, target: u64) -> UmbraFSResult<()> {
    inner.sync_seq.fetch_max(target, Ordering::AcqRel);
    inner.sync_state.lock().unwrap().waiters += 1;
    inner.writeback_kick.kick();

    inner.threshold.wait_until(|| {
        if inner.sync_state.lock().unwrap().err != 0 {
            return true;
        }
        inner.writeback_seq.load(Ordering::Acquire) >= target
            && inner.nr_writeback.load(Ordering::Acquire) == 0
    });

    let mut st = inner.sync_state.lock().unwrap();
    let result = if st.err != 0 {
        Err(UmbraFSError::Io(st.err))
    } else {
        Ok(())
    };
    st.waiters -= 1;
    if st.waiters == 0 {
        // The latch clears when the last waiter departs
        st.err = 0;
    }
    result
}

/// Undo the additions of one merge pass and release the held leases
fn merge_unwind(
    large: Option<&Arc<DirtySet>>,
    other: Option<&Arc<DirtySet>>,
    added: &mut Vec<Arc<Block>>,
) {
    for b in added.drain(..) {
        if b.state_contains(BLK_DIRTY) {
            continue;
        }
        if let Some(s) = b.set_ref() {
            s.remove_block(&b);
        }
        b.replace_set(None);
    }
    if let Some(l) = large {
        l.clear_state_wake(SET_DIRTYING);
    }
    if let Some(o) = other {
        o.clear_state_wake(SET_DIRTYING);
    }
}

/// Merge the caller's write-acquired blocks into exactly one dirty set and
/// lease that set to the caller.
///
/// The walk accumulates into `large`. Foreign sets are leased via
/// SET_DIRTYING with full back-off on contention; merges that would
/// overflow the set limit force a sync of the stamped side and retry.
fn dirty_begin(inner: &Arc<CacheInner>, refs: &[BlockRef]) -> UmbraFSResult<()> {
    if refs.is_empty() {
        return Ok(());
    }
    if refs.len() > inner.tuning.set_limit {
        return Err(UmbraFSError::InvalidArgument);
    }

    'restart: loop {
        wait_dirty_admission(inner);

        let mut large: Option<Arc<DirtySet>> = None;
        let mut added: Vec<Arc<Block>> = Vec::new();

        for r in refs {
            let b = r.block();

            let small = match (b.set_ref(), large.clone()) {
                (Some(s), Some(l)) if Arc::ptr_eq(&s, &l) => continue,
                (Some(s), _) => s,
                (None, Some(l)) => {
                    if l.size() >= inner.tuning.set_limit {
                        // Full accumulator: flush it and try again
                        let seq = l.dirty_seq();
                        merge_unwind(Some(&l), None, &mut added);
                        sync_up_to(inner, seq)?;
                        continue 'restart;
                    }
                    match b.set_if_none(&l) {
                        Ok(()) => {
                            l.push_block(b.clone());
                            added.push(b.clone());
                            continue;
                        }
                        Err(existing) => existing,
                    }
                }
                (None, None) => {
                    let fresh = Arc::new(DirtySet::new());
                    fresh.set_state(SET_DIRTYING);
                    match b.set_if_none(&fresh) {
                        Ok(()) => {
                            fresh.push_block(b.clone());
                            added.push(b.clone());
                            large = Some(fresh);
                            continue;
                        }
                        Err(existing) => existing,
                    }
                }
            };

            if !small.test_and_set_state(SET_DIRTYING) {
                // Another dirtier holds the set: back off entirely
                merge_unwind(large.as_ref(), None, &mut added);
                small.wait_state_clear(SET_DIRTYING);
                continue 'restart;
            }

            if small.state_contains(SET_WRITEBACK) {
                small.clear_state_wake(SET_DIRTYING);
                merge_unwind(large.as_ref(), None, &mut added);
                small.wait_state_clear(SET_WRITEBACK);
                continue 'restart;
            }

            // The block may have moved while the lease was being taken: a
            // concurrent dirtier can merge `small` away and rewrite the
            // back-reference. Only the current mapping is authoritative.
            match b.set_ref() {
                Some(current) if Arc::ptr_eq(&current, &small) => {}
                _ => {
                    small.clear_state_wake(SET_DIRTYING);
                    merge_unwind(large.as_ref(), None, &mut added);
                    continue 'restart;
                }
            }

            let l = match large.take() {
                None => {
                    // b was already a member of `small`; it becomes the
                    // accumulator
                    large = Some(small);
                    continue;
                }
                Some(l) => l,
            };

            // Merge the smaller set into the bigger one
            let (l, s) = if small.size() > l.size() {
                (small, l)
            } else {
                (l, small)
            };

            if l.size() + s.size() > inner.tuning.set_limit {
                let seq = if l.dirty_seq() != 0 {
                    l.dirty_seq()
                } else {
                    s.dirty_seq()
                };
                merge_unwind(Some(&l), Some(&s), &mut added);
                sync_up_to(inner, seq)?;
                continue 'restart;
            }

            let drained = s.take_blocks();
            for moved in &drained {
                moved.replace_set(Some(l.clone()));
            }
            l.extend_blocks(drained);
            s.clear_state_wake(SET_DIRTY | SET_DIRTYING);
            large = Some(l);
        }

        let l = large.expect("non-empty dirty_begin without an accumulator");

        // Mark the members dirty, newest entries first
        let snapshot = l.blocks_snapshot();
        for b in snapshot.iter().rev() {
            if !b.state_contains(BLK_DIRTY) {
                b.set_state(BLK_DIRTY);
                inner.nr_dirty.fetch_add(1, Ordering::AcqRel);
            }
        }

        if !l.state_contains(SET_DIRTY) {
            l.set_state(SET_DIRTY);
            let mut pending = inner.writeback_pending.lock().unwrap();
            let seq = inner.dirty_seq.fetch_add(1, Ordering::AcqRel) + 1;
            l.stamp_dirty_seq(seq);
            pending.push_back(l.clone());
            drop(pending);
            inner.writeback_kick.kick();
        }

        // The SET_DIRTYING lease is handed to dirty_end
        return Ok(());
    }
}

fn should_writeback(inner: &CacheInner) -> bool {
    let qd = inner.queue_depth.load(Ordering::Acquire);
    let wb = inner.nr_writeback.load(Ordering::Acquire);
    if wb >= qd {
        return false;
    }
    if inner.sync_seq.load(Ordering::Acquire) > inner.writeback_seq.load(Ordering::Acquire) {
        return true;
    }
    let dirty = inner.nr_dirty.load(Ordering::Acquire);
    dirty.saturating_sub(wb) >= inner.tuning.writeback_thresh
}

fn writeback_worker(inner: &Arc<CacheInner>) {
    let mut fifo: VecDeque<Arc<DirtySet>> = VecDeque::new();
    loop {
        if !inner.writeback_kick.wait(&inner.shutdown) {
            break;
        }
        fifo.extend(inner.writeback_pending.lock().unwrap().drain(..));

        while let Some(set) = fifo.front().cloned() {
            if set.size() == 0 {
                // Merged away while queued; it still consumes a slot in the
                // writeback order
                fifo.pop_front();
                inner.writeback_seq.fetch_add(1, Ordering::AcqRel);
                inner.threshold.wake_all();
                continue;
            }

            if !should_writeback(inner) {
                break;
            }

            let prev = set.set_state(SET_WRITEBACK);
            if prev & SET_DIRTYING != 0 {
                // A dirtier holds the set; let it finish, then re-examine
                set.clear_state_wake(SET_WRITEBACK);
                set.wait_state_clear(SET_DIRTYING);
                break;
            }

            fifo.pop_front();
            let blocks = set.blocks_snapshot();
            if blocks.is_empty() {
                set.clear_state_wake(SET_WRITEBACK);
                inner.writeback_seq.fetch_add(1, Ordering::AcqRel);
                inner.threshold.wake_all();
                continue;
            }

            trace!(
                "writeback set seq={} size={}",
                set.dirty_seq(),
                blocks.len()
            );
            inner.nr_writeback.fetch_add(blocks.len(), Ordering::AcqRel);
            set.submitted_add(blocks.len());
            {
                let mut pending = inner.submit_pending.lock().unwrap();
                for b in blocks {
                    b.pin();
                    pending.push_back(b);
                }
            }
            inner.submit_kick.kick();
            inner.writeback_seq.fetch_add(1, Ordering::AcqRel);
            inner.threshold.wake_all();
        }
    }
}

fn submit_worker(inner: &Arc<CacheInner>) {
    let mut fifo: VecDeque<Arc<Block>> = VecDeque::new();
    loop {
        if !inner.submit_kick.wait(&inner.shutdown) {
            break;
        }
        fifo.extend(inner.submit_pending.lock().unwrap().drain(..));

        let transport = inner.transport.get().expect("transport bound at setup");
        let qd = inner.queue_depth.load(Ordering::Acquire);
        while inner.nr_submitted.load(Ordering::Acquire) < qd {
            let Some(b) = fifo.pop_front() else {
                break;
            };
            let reading = b.state_contains(BLK_READING);
            let (op, buf) = if reading {
                (BlockOp::GetRead, None)
            } else {
                (BlockOp::Write, Some(b.buffer()))
            };
            inner.nr_submitted.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = transport.submit_block(op, b.bnr(), buf) {
                let errno = e.errno().unwrap_or(-libc::EIO);
                end_io(inner, b.bnr(), None, errno);
            }
        }
    }
}
