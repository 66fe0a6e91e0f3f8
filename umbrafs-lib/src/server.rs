//! Device-serving side of the wire protocol
//!
//! A `BlockServer` answers GET_BLOCK and WRITE_BLOCK from a block cache and
//! can optionally answer GET_MANIFEST from a configured snapshot. It owns
//! the handler registrations on its messenger; the messenger itself (and
//! its listener) remain the caller's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::block::AcquireFlags;
use crate::cache::BlockCache;
use crate::error::{UmbraFSError, UmbraFSResult};
use crate::format::{
    GetBlockCtl, GetBlockResultCtl, GetManifestCtl, GetManifestResultCtl, MsgType, WireErr,
    WriteBlockCtl, WriteBlockResultCtl,
};
use crate::manifest::ManifestSnapshot;
use crate::messaging::{Message, Messenger};
use crate::transaction::write_block;

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    writes: AtomicU64,
    manifests: AtomicU64,
    failures: AtomicU64,
}

/// Request counters of one server
#[derive(Debug, Clone)]
pub struct BlockServerStats {
    pub gets: u64,
    pub writes: u64,
    pub manifests: u64,
    pub failures: u64,
}

/// Serves blocks out of a cache to remote clients
pub struct BlockServer {
    messenger: Messenger,
    counters: Arc<Counters>,
    serving_manifest: bool,
}

impl BlockServer {
    /// Install the block handlers on `messenger`, backed by `cache`
    pub fn new(messenger: Messenger, cache: Arc<BlockCache>) -> UmbraFSResult<Self> {
        let counters = Arc::new(Counters::default());

        {
            let cache = cache.clone();
            let counters = counters.clone();
            messenger.register_recv(
                MsgType::GetBlock,
                Arc::new(move |msgr, from, ctl, _data| {
                    let ctl = GetBlockCtl::decode(ctl)?;
                    counters.gets.fetch_add(1, Ordering::Relaxed);
                    let reply = match cache.acquire(ctl.bnr, AcquireFlags::READ) {
                        Ok(r) => Message::new(
                            MsgType::GetBlockResult,
                            GetBlockResultCtl {
                                bnr: ctl.bnr,
                                access: ctl.access,
                                err: WireErr::Ok,
                            }
                            .encode(),
                            Some(r.buffer()),
                        ),
                        Err(e) => {
                            counters.failures.fetch_add(1, Ordering::Relaxed);
                            warn!("get block {} failed: {}", ctl.bnr, e);
                            Message::new(
                                MsgType::GetBlockResult,
                                GetBlockResultCtl {
                                    bnr: ctl.bnr,
                                    access: ctl.access,
                                    err: WireErr::from_error(Some(e)),
                                }
                                .encode(),
                                None,
                            )
                        }
                    };
                    msgr.send(from, reply)
                }),
            )?;
        }

        {
            let cache = cache.clone();
            let counters = counters.clone();
            messenger.register_recv(
                MsgType::WriteBlock,
                Arc::new(move |msgr, from, ctl, data| {
                    let ctl = WriteBlockCtl::decode(ctl)?;
                    let data = data.ok_or(UmbraFSError::Protocol)?;
                    counters.writes.fetch_add(1, Ordering::Relaxed);
                    let err = match write_block(&cache, ctl.bnr, data.as_slice()) {
                        Ok(()) => WireErr::Ok,
                        Err(e) => {
                            counters.failures.fetch_add(1, Ordering::Relaxed);
                            warn!("write block {} failed: {}", ctl.bnr, e);
                            WireErr::from_error(Some(e))
                        }
                    };
                    let reply = Message::new(
                        MsgType::WriteBlockResult,
                        WriteBlockResultCtl { bnr: ctl.bnr, err }.encode(),
                        None,
                    );
                    msgr.send(from, reply)
                }),
            )?;
        }

        Ok(Self {
            messenger,
            counters,
            serving_manifest: false,
        })
    }

    /// Additionally answer GET_MANIFEST with `snapshot`
    pub fn serve_manifest(&mut self, snapshot: ManifestSnapshot) -> UmbraFSResult<()> {
        info!(
            "answering manifests: seq {} with {} servers",
            snapshot.seq,
            snapshot.servers.len()
        );
        let counters = self.counters.clone();
        self.messenger.register_recv(
            MsgType::GetManifest,
            Arc::new(move |msgr, from, ctl, _data| {
                let _request = GetManifestCtl::decode(ctl)?;
                counters.manifests.fetch_add(1, Ordering::Relaxed);
                let reply = match snapshot.encode_block() {
                    Ok(page) => Message::new(
                        MsgType::GetManifestResult,
                        GetManifestResultCtl {
                            seq_nr: snapshot.seq,
                            err: WireErr::Ok,
                        }
                        .encode(),
                        Some(Arc::new(page)),
                    ),
                    Err(e) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        Message::new(
                            MsgType::GetManifestResult,
                            GetManifestResultCtl {
                                seq_nr: snapshot.seq,
                                err: WireErr::from_error(Some(e)),
                            }
                            .encode(),
                            None,
                        )
                    }
                };
                msgr.send(from, reply)
            }),
        )?;
        self.serving_manifest = true;
        Ok(())
    }

    pub fn stats(&self) -> BlockServerStats {
        BlockServerStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            manifests: self.counters.manifests.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Remove this server's handlers. The messenger stays usable.
    pub fn shutdown(&self) {
        let _ = self.messenger.unregister_recv(MsgType::GetBlock);
        let _ = self.messenger.unregister_recv(MsgType::WriteBlock);
        if self.serving_manifest {
            let _ = self.messenger.unregister_recv(MsgType::GetManifest);
        }
    }
}
