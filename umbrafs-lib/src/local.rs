//! Local block transport: asynchronous I/O against a device or image file
//!
//! A fixed pool of in-flight descriptors is tracked by two bitmaps on one
//! atomic word each: `empty` (slot available) and `submit` (slot filled,
//! awaiting the kernel). A submitter thread gathers filled descriptors and
//! issues one batched submit; a reaper thread blocks on completions and
//! feeds them back to the cache.
//!
//! The file is opened with O_DIRECT when possible, falling back to buffered
//! I/O on EINVAL. Hosts that refuse an AIO context (ENOSYS, EPERM) get a
//! synchronous batch engine with the same external behavior.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{info, warn};

use crate::cache::CompletionHandle;
use crate::error::{last_errno, UmbraFSError, UmbraFSResult};
use crate::format::constants::{BLOCK_SIZE, LOCAL_QUEUE_DEPTH};
use crate::page::{Page, PagePool};
use crate::transport::{BlockOp, BlockTransport};

type AioContext = libc::c_ulong;

/// One kernel submission descriptor, struct iocb of the AIO ABI
#[repr(C)]
#[derive(Clone, Copy)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

unsafe fn io_setup(nr: libc::c_long, ctx: *mut AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, nr, ctx)
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbs: *mut *mut Iocb) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbs)
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

/// Filled descriptor slot; ownership follows the bitmap protocol
#[derive(Default)]
struct DescSlot {
    bnr: u64,
    opcode: u16,
    /// Destination of an in-flight read
    read_page: Option<Page>,
    /// Source of an in-flight write; the snapshot pins the contents
    write_buf: Option<Arc<Page>>,
}

/// Completion record of the synchronous fallback engine
struct QueuedEvent {
    slot: usize,
    res: i64,
}

enum Engine {
    /// Kernel AIO context
    Native(AioContext),
    /// Synchronous batch execution with queued completions
    Queued {
        events: Mutex<VecDeque<QueuedEvent>>,
        cond: Condvar,
    },
}

struct Shared {
    /// Keeps the descriptor open for the lifetime of the transport
    file: File,
    slots: Vec<Mutex<DescSlot>>,
    /// Bit set: the slot is available to `submit_block`
    empty_bmap: AtomicU64,
    /// Bit set: the slot is filled and awaits the submitter
    submit_bmap: AtomicU64,
    submit_pending: Mutex<bool>,
    submit_cond: Condvar,
    engine: Engine,
    pool: PagePool,
    completions: CompletionHandle,
    shutdown: AtomicBool,
}

/// Block transport over a local device or image file
pub struct LocalTransport {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTransport {
    /// Open `path` and start the submitter and reaper
    pub fn new(path: &Path, completions: CompletionHandle) -> UmbraFSResult<Self> {
        let (file, direct) = open_device(path)?;

        let engine = match setup_aio() {
            Ok(ctx) => Engine::Native(ctx),
            Err(errno) => {
                warn!(
                    "AIO context unavailable (errno {}), using synchronous batches",
                    errno
                );
                Engine::Queued {
                    events: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                }
            }
        };
        info!(
            "local transport on {} (direct={}, queue_depth={})",
            path.display(),
            direct,
            LOCAL_QUEUE_DEPTH
        );

        let mut slots = Vec::with_capacity(LOCAL_QUEUE_DEPTH);
        for _ in 0..LOCAL_QUEUE_DEPTH {
            slots.push(Mutex::new(DescSlot::default()));
        }

        let shared = Arc::new(Shared {
            file,
            slots,
            empty_bmap: AtomicU64::new((1u64 << LOCAL_QUEUE_DEPTH) - 1),
            submit_bmap: AtomicU64::new(0),
            submit_pending: Mutex::new(false),
            submit_cond: Condvar::new(),
            engine,
            pool: PagePool::new(LOCAL_QUEUE_DEPTH),
            completions,
            shutdown: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        {
            let shared = shared.clone();
            threads.push(std::thread::spawn(move || submitter(&shared)));
        }
        {
            let shared = shared.clone();
            threads.push(std::thread::spawn(move || reaper(&shared)));
        }

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }
}

fn open_device(path: &Path) -> UmbraFSResult<(File, bool)> {
    let attempt = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(path);
    match attempt {
        Ok(file) => Ok((file, true)),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            info!("O_DIRECT refused on {}, using buffered I/O", path.display());
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok((file, false))
        }
        Err(e) => Err(e.into()),
    }
}

fn setup_aio() -> Result<AioContext, i32> {
    let mut ctx: AioContext = 0;
    let r = unsafe { io_setup(LOCAL_QUEUE_DEPTH as libc::c_long, &mut ctx) };
    if r < 0 {
        Err(last_errno())
    } else {
        Ok(ctx)
    }
}

impl BlockTransport for LocalTransport {
    fn queue_depth(&self) -> usize {
        LOCAL_QUEUE_DEPTH
    }

    fn submit_block(&self, op: BlockOp, bnr: u64, buf: Option<Arc<Page>>) -> UmbraFSResult<()> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(UmbraFSError::Io(-libc::ESHUTDOWN));
        }

        // Claim a free descriptor; the caller honors the queue depth, so an
        // exhausted pool is a broken invariant
        let idx = loop {
            let empty = shared.empty_bmap.load(Ordering::Acquire);
            assert!(empty != 0, "local transport descriptor pool exhausted");
            let idx = empty.trailing_zeros() as usize;
            let bit = 1u64 << idx;
            if shared.empty_bmap.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
                break idx;
            }
            // Lost the bit to a peer, try the next one
        };

        let bit = 1u64 << idx;
        if let Err(e) = fill_slot(shared, idx, op, bnr, buf) {
            // Hand the unused descriptor back before failing
            shared.empty_bmap.fetch_or(bit, Ordering::Release);
            return Err(e);
        }

        // Publish after the slot fields are in place
        shared.submit_bmap.fetch_or(bit, Ordering::Release);
        *shared.submit_pending.lock().unwrap() = true;
        shared.submit_cond.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        *shared.submit_pending.lock().unwrap() = true;
        shared.submit_cond.notify_all();
        if let Engine::Queued { cond, .. } = &shared.engine {
            cond.notify_all();
        }
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
        if let Engine::Native(ctx) = &shared.engine {
            unsafe { io_destroy(*ctx) };
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fill_slot(
    shared: &Shared,
    idx: usize,
    op: BlockOp,
    bnr: u64,
    buf: Option<Arc<Page>>,
) -> UmbraFSResult<()> {
    let mut slot = shared.slots[idx].lock().unwrap();
    slot.bnr = bnr;
    match op {
        BlockOp::GetRead | BlockOp::GetWrite => {
            slot.opcode = IOCB_CMD_PREAD;
            slot.read_page = Some(shared.pool.alloc()?);
            slot.write_buf = None;
        }
        BlockOp::Write => {
            slot.opcode = IOCB_CMD_PWRITE;
            slot.read_page = None;
            slot.write_buf = Some(buf.ok_or(UmbraFSError::InvalidArgument)?);
        }
    }
    Ok(())
}

/// Gather filled descriptors and hand them to the kernel in one batch
fn submitter(shared: &Arc<Shared>) {
    loop {
        {
            let mut pending = shared.submit_pending.lock().unwrap();
            while !*pending && !shared.shutdown.load(Ordering::Acquire) {
                pending = shared.submit_cond.wait(pending).unwrap();
            }
            *pending = false;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        loop {
            let bits = shared.submit_bmap.swap(0, Ordering::AcqRel);
            if bits == 0 {
                break;
            }
            submit_batch(shared, bits);
        }
    }
}

fn submit_batch(shared: &Arc<Shared>, bits: u64) {
    let mut iocbs: Vec<Iocb> = Vec::new();
    let mut idxs: Vec<usize> = Vec::new();

    for idx in 0..LOCAL_QUEUE_DEPTH {
        if bits & (1u64 << idx) == 0 {
            continue;
        }
        let slot = shared.slots[idx].lock().unwrap();
        let buf_ptr = match slot.opcode {
            IOCB_CMD_PREAD => slot.read_page.as_ref().map(|p| p.as_ptr()),
            _ => slot.write_buf.as_ref().map(|p| p.as_ptr()),
        }
        .expect("submitted slot without a buffer") as u64;
        iocbs.push(Iocb {
            aio_data: idx as u64,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: slot.opcode,
            aio_reqprio: 0,
            aio_fildes: shared.file.as_raw_fd() as u32,
            aio_buf: buf_ptr,
            aio_nbytes: BLOCK_SIZE as u64,
            aio_offset: (slot.bnr as i64) * BLOCK_SIZE as i64,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        });
        idxs.push(idx);
    }

    match &shared.engine {
        Engine::Native(ctx) => {
            let mut ptrs: Vec<*mut Iocb> = iocbs.iter_mut().map(|c| c as *mut Iocb).collect();
            let mut done = 0usize;
            while done < ptrs.len() {
                let r = unsafe {
                    io_submit(
                        *ctx,
                        (ptrs.len() - done) as libc::c_long,
                        ptrs.as_mut_ptr().add(done),
                    )
                };
                if r <= 0 {
                    let errno = if r < 0 { last_errno() } else { -libc::EIO };
                    warn!("io_submit failed: errno {}", errno);
                    for &idx in &idxs[done..] {
                        complete_slot(shared, idx, errno as i64);
                    }
                    return;
                }
                done += r as usize;
            }
        }
        Engine::Queued { events, cond } => {
            for (i, &idx) in idxs.iter().enumerate() {
                let res = sync_io(shared, &iocbs[i]);
                events.lock().unwrap().push_back(QueuedEvent { slot: idx, res });
                cond.notify_one();
            }
        }
    }
}

/// Execute one descriptor synchronously (fallback engine)
fn sync_io(shared: &Shared, iocb: &Iocb) -> i64 {
    let r = unsafe {
        match iocb.aio_lio_opcode {
            IOCB_CMD_PREAD => libc::pread(
                shared.file.as_raw_fd(),
                iocb.aio_buf as *mut libc::c_void,
                iocb.aio_nbytes as usize,
                iocb.aio_offset,
            ),
            _ => libc::pwrite(
                shared.file.as_raw_fd(),
                iocb.aio_buf as *const libc::c_void,
                iocb.aio_nbytes as usize,
                iocb.aio_offset,
            ),
        }
    };
    if r < 0 {
        last_errno() as i64
    } else {
        r as i64
    }
}

/// Block on completions and feed them to the cache
fn reaper(shared: &Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        match &shared.engine {
            Engine::Native(ctx) => {
                let mut events = [IoEvent {
                    data: 0,
                    obj: 0,
                    res: 0,
                    res2: 0,
                }; LOCAL_QUEUE_DEPTH];
                let mut timeout = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 100_000_000,
                };
                let n = unsafe {
                    io_getevents(
                        *ctx,
                        1,
                        LOCAL_QUEUE_DEPTH as libc::c_long,
                        events.as_mut_ptr(),
                        &mut timeout,
                    )
                };
                for ev in events.iter().take(n.max(0) as usize) {
                    complete_slot(shared, ev.data as usize, ev.res);
                }
            }
            Engine::Queued { events, cond } => {
                let event = {
                    let mut queue = events.lock().unwrap();
                    loop {
                        if shared.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        if let Some(ev) = queue.pop_front() {
                            break ev;
                        }
                        let (q, _timeout) = cond
                            .wait_timeout(queue, std::time::Duration::from_millis(100))
                            .unwrap();
                        queue = q;
                    }
                };
                complete_slot(shared, event.slot, event.res);
            }
        }
    }
}

/// Map the result, deliver the completion, then republish the empty bit so
/// the slot is only reusable after its buffers have been taken out
fn complete_slot(shared: &Arc<Shared>, idx: usize, res: i64) {
    let (bnr, opcode, read_page, write_buf) = {
        let mut slot = shared.slots[idx].lock().unwrap();
        (
            slot.bnr,
            slot.opcode,
            slot.read_page.take(),
            slot.write_buf.take(),
        )
    };
    drop(write_buf);

    let err = if res == BLOCK_SIZE as i64 {
        0
    } else if res < 0 {
        res as i32
    } else {
        -libc::EIO
    };

    if opcode == IOCB_CMD_PREAD {
        let (fresh, unused) = if err == 0 {
            (read_page, None)
        } else {
            (None, read_page)
        };
        if let Some(page) = unused {
            shared.pool.free(page);
        }
        shared.completions.end_io(bnr, fresh, err);
    } else {
        shared.completions.end_io(bnr, None, err);
    }

    shared.empty_bmap.fetch_or(1u64 << idx, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iocb_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn test_queue_depth_leaves_slop_bit() {
        assert_eq!(LOCAL_QUEUE_DEPTH, 63);
        let full: u64 = (1u64 << LOCAL_QUEUE_DEPTH) - 1;
        assert_eq!(full.count_ones(), 63);
    }
}
