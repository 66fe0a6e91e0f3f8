//! Integration tests for the UmbraFS block-cache runtime

use std::sync::Arc;
use std::thread;

use umbrafs_lib::{
    constants, read_block, write_block, AcquireFlags, BlockCache, BlockTransport, CacheTuning,
    MemoryStore, MemoryTransport, Transaction, UmbraFSError,
};

const BLOCK_SIZE: usize = constants::BLOCK_SIZE;

/// Cache over a fresh memory transport
fn memory_cache(tuning: CacheTuning) -> (BlockCache, MemoryStore) {
    let store_slot = Arc::new(std::sync::Mutex::new(None));
    let slot = store_slot.clone();
    let cache = BlockCache::new(tuning, move |completions| {
        let transport = MemoryTransport::new(completions, 32);
        *slot.lock().unwrap() = Some(transport.store());
        Ok(Box::new(transport) as Box<dyn BlockTransport>)
    })
    .unwrap();
    let store = store_slot.lock().unwrap().take().unwrap();
    (cache, store)
}

fn pattern_txn(txn: &mut Transaction, bnr: u64, byte: u8) {
    txn.add_write(
        bnr,
        AcquireFlags::NEW | AcquireFlags::WRITE,
        None,
        Box::new(move |r| {
            r.update(|buf| buf.fill(byte));
        }),
    );
}

#[test]
fn test_read_through_returns_zeros() {
    let (cache, store) = memory_cache(CacheTuning::default());

    let r = cache.acquire(7, AcquireFlags::READ).unwrap();
    assert!(r.buffer().as_slice().iter().all(|&b| b == 0));
    drop(r);

    assert_eq!(store.reads(), 1);
    let stats = cache.stats();
    assert_eq!(stats.nr_submitted, 0);
    assert_eq!(stats.nr_dirty, 0);
}

#[test]
fn test_new_block_is_zeroed_and_resident() {
    let (cache, store) = memory_cache(CacheTuning::default());

    let r = cache
        .acquire(3, AcquireFlags::NEW | AcquireFlags::WRITE)
        .unwrap();
    assert!(r.buffer().as_slice().iter().all(|&b| b == 0));
    drop(r);

    // A NEW block never touches the transport
    assert_eq!(store.reads(), 0);

    // Re-acquiring hits the cached copy
    let r = cache.acquire(3, AcquireFlags::READ).unwrap();
    assert!(r.buffer().as_slice().iter().all(|&b| b == 0));
    assert_eq!(store.reads(), 0);
}

#[test]
fn test_concurrent_acquire_single_submission() {
    let (cache, store) = memory_cache(CacheTuning::default());
    store.write(5, &[0x5A; 16]);

    let cache = Arc::new(cache);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let r = cache.acquire(5, AcquireFlags::READ).unwrap();
            assert_eq!(&r.buffer().as_slice()[..16], &[0x5A; 16]);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Exactly one read reached the transport
    assert_eq!(store.reads(), 1);
}

#[test]
fn test_dirty_merge_and_sync() {
    let (cache, store) = memory_cache(CacheTuning::default());
    let cache = Arc::new(cache);

    let a = {
        let cache = cache.clone();
        thread::spawn(move || {
            let mut txn = Transaction::new();
            pattern_txn(&mut txn, 1, 0x11);
            pattern_txn(&mut txn, 2, 0x12);
            txn.execute(&cache).unwrap();
        })
    };
    let b = {
        let cache = cache.clone();
        thread::spawn(move || {
            let mut txn = Transaction::new();
            pattern_txn(&mut txn, 2, 0x22);
            pattern_txn(&mut txn, 3, 0x23);
            txn.execute(&cache).unwrap();
        })
    };
    a.join().unwrap();
    b.join().unwrap();

    // The intersecting batches merged into one set
    assert_eq!(cache.stats().dirty_seq, 1);
    assert_eq!(cache.stats().nr_dirty, 3);

    cache.sync().unwrap();

    let stats = cache.stats();
    assert_eq!(stats.nr_dirty, 0);
    assert_eq!(stats.nr_writeback, 0);
    assert_eq!(store.writes(), 3);

    assert_eq!(store.read(1).unwrap(), vec![0x11; BLOCK_SIZE]);
    assert_eq!(store.read(3).unwrap(), vec![0x23; BLOCK_SIZE]);
    let two = store.read(2).unwrap();
    assert!(two == vec![0x12; BLOCK_SIZE] || two == vec![0x22; BLOCK_SIZE]);
}

#[test]
fn test_disjoint_batches_do_not_merge() {
    let (cache, store) = memory_cache(CacheTuning::default());

    let mut txn = Transaction::new();
    pattern_txn(&mut txn, 1, 0xA1);
    pattern_txn(&mut txn, 2, 0xA2);
    txn.execute(&cache).unwrap();

    let mut txn = Transaction::new();
    pattern_txn(&mut txn, 10, 0xB1);
    pattern_txn(&mut txn, 11, 0xB2);
    txn.execute(&cache).unwrap();

    // Two sets, two dirty sequence numbers
    assert_eq!(cache.stats().dirty_seq, 2);
    assert_eq!(cache.stats().nr_dirty, 4);

    cache.sync().unwrap();
    assert_eq!(store.writes(), 4);
    assert_eq!(cache.stats().nr_dirty, 0);
}

#[test]
fn test_merge_overflow_forces_sync_of_larger_set() {
    let tuning = CacheTuning {
        set_limit: 4,
        ..CacheTuning::default()
    };
    let (cache, store) = memory_cache(tuning);

    let mut txn = Transaction::new();
    for bnr in 1..=4 {
        pattern_txn(&mut txn, bnr, 0x40 + bnr as u8);
    }
    txn.execute(&cache).unwrap();
    assert_eq!(cache.stats().dirty_seq, 1);

    // Touches block 4 of the full set: the merge cannot fit, so the full
    // set is synced first and the batch lands in a fresh set
    let mut txn = Transaction::new();
    for bnr in 4..=6 {
        pattern_txn(&mut txn, bnr, 0x60 + bnr as u8);
    }
    txn.execute(&cache).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.dirty_seq, 2);
    assert_eq!(stats.nr_dirty, 3);
    // The first set already reached the transport
    assert_eq!(store.writes(), 4);

    cache.sync().unwrap();
    assert_eq!(store.writes(), 7);
    assert_eq!(store.read(4).unwrap(), vec![0x64; BLOCK_SIZE]);
    assert_eq!(store.read(6).unwrap(), vec![0x66; BLOCK_SIZE]);
    assert_eq!(cache.stats().nr_dirty, 0);
}

#[test]
fn test_read_error_is_sticky_until_reclaim() {
    let (cache, store) = memory_cache(CacheTuning::default());
    store.fail_next_read(9, -libc_eio());

    let err = cache.acquire(9, AcquireFlags::READ).unwrap_err();
    assert_eq!(err, UmbraFSError::Io(-libc_eio()));

    // A second acquire sees the stored error without a new submission
    let err = cache.acquire(9, AcquireFlags::READ).unwrap_err();
    assert_eq!(err, UmbraFSError::Io(-libc_eio()));
    assert_eq!(store.reads(), 1);

    // After a full quiescence epoch the block is reclaimed and a fresh
    // acquire reads again
    cache.reclaim();
    cache.reclaim();
    let r = cache.acquire(9, AcquireFlags::READ).unwrap();
    assert!(r.buffer().as_slice().iter().all(|&b| b == 0));
    assert_eq!(store.reads(), 2);
}

#[test]
fn test_write_error_latches_sync_and_retries() {
    let (cache, store) = memory_cache(CacheTuning::default());
    store.fail_next_write(1, -libc_eio());

    write_block(&cache, 1, b"persist me").unwrap();
    let err = cache.sync().unwrap_err();
    assert_eq!(err, UmbraFSError::Io(-libc_eio()));

    // The data was kept dirty, not dropped; the next sync retries and
    // succeeds
    cache.sync().unwrap();
    let data = store.read(1).unwrap();
    assert_eq!(&data[..10], b"persist me");
    assert_eq!(cache.stats().nr_dirty, 0);
}

#[test]
fn test_unreferenced_block_survives_one_epoch() {
    let (cache, _store) = memory_cache(CacheTuning::default());

    let r = cache
        .acquire(42, AcquireFlags::NEW | AcquireFlags::READ)
        .unwrap();
    drop(r);
    assert_eq!(cache.stats().cached_blocks, 1);

    // First sweep: the idle epoch has not fully elapsed
    cache.reclaim();
    assert_eq!(cache.stats().cached_blocks, 1);

    // Second sweep frees it
    cache.reclaim();
    assert_eq!(cache.stats().cached_blocks, 0);
}

#[test]
fn test_pinned_block_is_never_reclaimed() {
    let (cache, _store) = memory_cache(CacheTuning::default());

    let r = cache
        .acquire(42, AcquireFlags::NEW | AcquireFlags::READ)
        .unwrap();
    cache.reclaim();
    cache.reclaim();
    cache.reclaim();
    assert_eq!(cache.stats().cached_blocks, 1);
    drop(r);
}

#[test]
fn test_empty_transaction_is_noop() {
    let (cache, store) = memory_cache(CacheTuning::default());
    let mut txn = Transaction::new();
    txn.execute(&cache).unwrap();
    assert_eq!(cache.stats().nr_dirty, 0);
    assert_eq!(store.writes(), 0);
}

#[test]
fn test_transaction_is_reusable_after_reset() {
    let (cache, store) = memory_cache(CacheTuning::default());

    let mut txn = Transaction::new();
    pattern_txn(&mut txn, 8, 0x88);
    txn.execute(&cache).unwrap();
    txn.reset();
    cache.sync().unwrap();

    txn.execute(&cache).unwrap();
    txn.reset();
    cache.sync().unwrap();

    assert_eq!(store.writes(), 2);
    assert_eq!(store.read(8).unwrap(), vec![0x88; BLOCK_SIZE]);
}

#[test]
fn test_failed_prepare_modifies_nothing() {
    let (cache, store) = memory_cache(CacheTuning::default());

    let mut txn = Transaction::new();
    pattern_txn(&mut txn, 1, 0x77);
    txn.add_write(
        2,
        AcquireFlags::NEW | AcquireFlags::WRITE,
        Some(Box::new(|_r| Err(UmbraFSError::InvalidArgument))),
        Box::new(|_r| unreachable!("commit after failed prepare")),
    );
    assert_eq!(
        txn.execute(&cache).unwrap_err(),
        UmbraFSError::InvalidArgument
    );

    cache.sync().unwrap();
    assert_eq!(store.writes(), 0);
    assert_eq!(cache.stats().nr_dirty, 0);
}

#[test]
fn test_dirty_pressure_drains_through_admission() {
    let tuning = CacheTuning {
        dirty_limit: 8,
        writeback_thresh: 4,
        ..CacheTuning::default()
    };
    let (cache, store) = memory_cache(tuning);

    // Far more dirty blocks than the admission limit; writeback keeps the
    // backlog below it and every write lands
    for bnr in 0..100u64 {
        write_block(&cache, bnr, &[(bnr & 0xFF) as u8]).unwrap();
    }
    cache.sync().unwrap();

    assert_eq!(cache.stats().nr_dirty, 0);
    assert!(store.writes() >= 100);
    for bnr in 0..100u64 {
        assert_eq!(store.read(bnr).unwrap()[0], (bnr & 0xFF) as u8);
    }
}

#[test]
fn test_acquire_rejects_bad_flags() {
    let (cache, _store) = memory_cache(CacheTuning::default());
    assert_eq!(
        cache.acquire(1, AcquireFlags::empty()).unwrap_err(),
        UmbraFSError::InvalidArgument
    );
    assert_eq!(
        cache
            .acquire(1, AcquireFlags::READ | AcquireFlags::WRITE)
            .unwrap_err(),
        UmbraFSError::InvalidArgument
    );
}

fn libc_eio() -> i32 {
    5
}
