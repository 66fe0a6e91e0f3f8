//! Transaction engine: acquire a batch of blocks, prepare them, commit
//! modifications atomically
//!
//! All fallibility lives in `prepare`, which runs while the blocks are
//! merely pinned. `commit` is infallible by contract and runs inside the
//! `dirty_begin` / `dirty_end` brackets, so a committed modification never
//! needs rolling back.

use log::trace;

use crate::block::AcquireFlags;
use crate::cache::{BlockCache, BlockRef};
use crate::error::UmbraFSResult;

/// Fallible preparation step, run against the acquired reference
pub type PrepareFn = Box<dyn Fn(&BlockRef) -> UmbraFSResult<()> + Send>;

/// Infallible commit step, run inside the dirty brackets
pub type CommitFn = Box<dyn Fn(&BlockRef) + Send>;

struct TxnEntry {
    bnr: u64,
    flags: AcquireFlags,
    prepare: Option<PrepareFn>,
    commit: Option<CommitFn>,
}

/// A reusable record of block operations executed as one atomic batch
///
/// `execute` acquires every entry in order, runs the prepares, then commits
/// all write entries inside one dirty bracket. `reset` releases the
/// references; the entry list survives, so the same transaction may run
/// again.
#[derive(Default)]
pub struct Transaction {
    entries: Vec<TxnEntry>,
    acquired: Vec<BlockRef>,
    writes: Vec<usize>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a read-only entry
    pub fn add_read(&mut self, bnr: u64) -> &mut Self {
        self.entries.push(TxnEntry {
            bnr,
            flags: AcquireFlags::READ,
            prepare: None,
            commit: None,
        });
        self
    }

    /// Add a write entry with an optional prepare and a commit
    pub fn add_write(
        &mut self,
        bnr: u64,
        flags: AcquireFlags,
        prepare: Option<PrepareFn>,
        commit: CommitFn,
    ) -> &mut Self {
        debug_assert!(flags.contains(AcquireFlags::WRITE));
        self.entries.push(TxnEntry {
            bnr,
            flags,
            prepare,
            commit: Some(commit),
        });
        self
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the transaction against `cache`. On any prepare failure every
    /// reference is released and nothing was modified.
    pub fn execute(&mut self, cache: &BlockCache) -> UmbraFSResult<()> {
        debug_assert!(self.acquired.is_empty(), "transaction not reset");

        for (index, entry) in self.entries.iter().enumerate() {
            let r = match cache.acquire(entry.bnr, entry.flags) {
                Ok(r) => r,
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            };
            if let Some(prepare) = &entry.prepare {
                if let Err(e) = prepare(&r) {
                    self.reset();
                    return Err(e);
                }
            }
            self.acquired.push(r);
            if entry.flags.contains(AcquireFlags::WRITE) {
                self.writes.push(index);
            }
        }

        if !self.writes.is_empty() {
            let write_refs: Vec<BlockRef> = self
                .writes
                .iter()
                .map(|&i| self.acquired[i].clone())
                .collect();
            if let Err(e) = cache.dirty_begin(&write_refs) {
                self.reset();
                return Err(e);
            }
            for &index in &self.writes {
                let commit = self.entries[index]
                    .commit
                    .as_ref()
                    .expect("write entry without commit");
                commit(&self.acquired[index]);
            }
            cache.dirty_end(&write_refs);
            trace!("transaction committed {} writes", self.writes.len());
        }

        Ok(())
    }

    /// Release every acquired reference, keeping the entry list
    pub fn reset(&mut self) {
        self.acquired.clear();
        self.writes.clear();
    }
}

/// Convenience: write `data` into block `bnr` as one single-entry
/// transaction
pub fn write_block(cache: &BlockCache, bnr: u64, data: &[u8]) -> UmbraFSResult<()> {
    let payload = data.to_vec();
    let mut txn = Transaction::new();
    txn.add_write(
        bnr,
        AcquireFlags::NEW | AcquireFlags::WRITE,
        None,
        Box::new(move |r| {
            r.update(|buf| {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
            });
        }),
    );
    txn.execute(cache)?;
    txn.reset();
    Ok(())
}

/// Convenience: read block `bnr` through the cache
pub fn read_block(cache: &BlockCache, bnr: u64) -> UmbraFSResult<Vec<u8>> {
    let r = cache.acquire(bnr, AcquireFlags::READ)?;
    let data = r.buffer().as_slice().to_vec();
    Ok(data)
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("entries", &self.entries.len())
            .field("acquired", &self.acquired.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}
