//! Memory block transport: a RAM-backed store with failure injection
//!
//! Serves as a ramdisk and as the deterministic backend of the test suite.
//! Completions are delivered from a dedicated thread, never from the
//! submitting one, matching the behavior of the real transports.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::cache::CompletionHandle;
use crate::error::{UmbraFSError, UmbraFSResult};
use crate::format::constants::BLOCK_SIZE;
use crate::page::Page;
use crate::transport::{BlockOp, BlockTransport};

struct Request {
    op: BlockOp,
    bnr: u64,
    buf: Option<Arc<Page>>,
}

struct Shared {
    store: Mutex<HashMap<u64, Vec<u8>>>,
    queue: Mutex<VecDeque<Request>>,
    queue_cond: Condvar,
    /// bnr -> negative errno injected on the next matching read
    fail_reads: Mutex<HashMap<u64, i32>>,
    /// bnr -> negative errno injected on the next matching write
    fail_writes: Mutex<HashMap<u64, i32>>,
    reads: AtomicU64,
    writes: AtomicU64,
    shutdown: AtomicBool,
}

/// RAM-backed block transport
pub struct MemoryTransport {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    depth: usize,
}

impl MemoryTransport {
    /// Build the transport feeding `completions`, typically from the
    /// factory passed to `BlockCache::new`
    pub fn new(completions: CompletionHandle, depth: usize) -> Self {
        let shared = Arc::new(Shared {
            store: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            fail_reads: Mutex::new(HashMap::new()),
            fail_writes: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || worker(&shared, completions))
        };
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
            depth,
        }
    }

    /// Handle for seeding contents and injecting failures
    pub fn store(&self) -> MemoryStore {
        MemoryStore {
            shared: self.shared.clone(),
        }
    }
}

/// Shared view of a memory transport's backing store
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Current contents of `bnr`, if it was ever written
    pub fn read(&self, bnr: u64) -> Option<Vec<u8>> {
        self.shared.store.lock().unwrap().get(&bnr).cloned()
    }

    /// Seed `bnr` with `data`, zero-padded to one block
    pub fn write(&self, bnr: u64, data: &[u8]) {
        let mut block = vec![0u8; BLOCK_SIZE];
        let n = data.len().min(BLOCK_SIZE);
        block[..n].copy_from_slice(&data[..n]);
        self.shared.store.lock().unwrap().insert(bnr, block);
    }

    /// Fail the next read of `bnr` with `errno` (negative)
    pub fn fail_next_read(&self, bnr: u64, errno: i32) {
        self.shared.fail_reads.lock().unwrap().insert(bnr, errno);
    }

    /// Fail the next write of `bnr` with `errno` (negative)
    pub fn fail_next_write(&self, bnr: u64, errno: i32) {
        self.shared.fail_writes.lock().unwrap().insert(bnr, errno);
    }

    /// Total reads served
    pub fn reads(&self) -> u64 {
        self.shared.reads.load(Ordering::Acquire)
    }

    /// Total writes served
    pub fn writes(&self) -> u64 {
        self.shared.writes.load(Ordering::Acquire)
    }
}

fn worker(shared: &Arc<Shared>, completions: CompletionHandle) {
    loop {
        let request = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(r) = queue.pop_front() {
                    break r;
                }
                queue = shared.queue_cond.wait(queue).unwrap();
            }
        };

        match request.op {
            BlockOp::GetRead | BlockOp::GetWrite => {
                shared.reads.fetch_add(1, Ordering::AcqRel);
                if let Some(errno) = shared.fail_reads.lock().unwrap().remove(&request.bnr) {
                    completions.end_io(request.bnr, None, errno);
                    continue;
                }
                let mut page = match Page::zeroed() {
                    Ok(p) => p,
                    Err(_) => {
                        completions.end_io(request.bnr, None, -libc::ENOMEM);
                        continue;
                    }
                };
                if let Some(data) = shared.store.lock().unwrap().get(&request.bnr) {
                    page.copy_from(data);
                }
                completions.end_io(request.bnr, Some(page), 0);
            }
            BlockOp::Write => {
                shared.writes.fetch_add(1, Ordering::AcqRel);
                if let Some(errno) = shared.fail_writes.lock().unwrap().remove(&request.bnr) {
                    completions.end_io(request.bnr, None, errno);
                    continue;
                }
                let buf = request.buf.expect("write submission without a buffer");
                shared
                    .store
                    .lock()
                    .unwrap()
                    .insert(request.bnr, buf.as_slice().to_vec());
                completions.end_io(request.bnr, None, 0);
            }
        }
    }
}

impl BlockTransport for MemoryTransport {
    fn queue_depth(&self) -> usize {
        self.depth
    }

    fn submit_block(&self, op: BlockOp, bnr: u64, buf: Option<Arc<Page>>) -> UmbraFSResult<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(UmbraFSError::Io(-libc::ESHUTDOWN));
        }
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Request { op, bnr, buf });
        self.shared.queue_cond.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue_cond.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
