//! Network block transport: blocks move to and from remote device servers
//! over the messaging substrate
//!
//! The manifest resolves each block number to the server owning it.
//! Submissions become GET_BLOCK / WRITE_BLOCK messages; the matching
//! *_RESULT receive handlers turn replies back into completions. When a
//! peer dies, its outstanding submissions fail with an I/O error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{trace, warn};

use crate::cache::CompletionHandle;
use crate::error::{UmbraFSError, UmbraFSResult};
use crate::format::constants::NET_QUEUE_DEPTH;
use crate::format::{
    Access, GetBlockCtl, GetBlockResultCtl, MsgType, WireErr, WriteBlockCtl, WriteBlockResultCtl,
};
use crate::manifest::Manifest;
use crate::messaging::{Message, Messenger};
use crate::page::Page;
use crate::transport::{BlockOp, BlockTransport};

fn wire_errno(err: WireErr) -> i32 {
    match err {
        WireErr::Ok => 0,
        WireErr::Io => -libc::EIO,
        WireErr::NoMemory => -libc::ENOMEM,
        WireErr::Unknown => -libc::EPROTO,
    }
}

/// Block transport over remote device servers
pub struct NetworkTransport {
    messenger: Messenger,
    manifest: Arc<Manifest>,
    /// In-flight submissions by block number, with the server they went to
    outstanding: Arc<Mutex<HashMap<u64, SocketAddr>>>,
    shutdown: AtomicBool,
}

impl NetworkTransport {
    /// Wire the transport into `messenger`, feeding `completions`
    pub fn new(
        messenger: Messenger,
        manifest: Arc<Manifest>,
        completions: CompletionHandle,
    ) -> UmbraFSResult<Self> {
        let outstanding: Arc<Mutex<HashMap<u64, SocketAddr>>> =
            Arc::new(Mutex::new(HashMap::new()));

        {
            let completions = completions.clone();
            let outstanding = outstanding.clone();
            messenger.register_recv(
                MsgType::GetBlockResult,
                Arc::new(move |_msgr, _from, ctl, data| {
                    let ctl = GetBlockResultCtl::decode(ctl)?;
                    outstanding.lock().unwrap().remove(&ctl.bnr);
                    match (ctl.err, data) {
                        (WireErr::Ok, Some(page)) => completions.end_io(ctl.bnr, Some(page), 0),
                        (WireErr::Ok, None) => {
                            completions.end_io(ctl.bnr, None, -libc::EPROTO)
                        }
                        (err, _) => completions.end_io(ctl.bnr, None, wire_errno(err)),
                    }
                    Ok(())
                }),
            )?;
        }
        {
            let completions = completions.clone();
            let outstanding = outstanding.clone();
            messenger.register_recv(
                MsgType::WriteBlockResult,
                Arc::new(move |_msgr, _from, ctl, _data| {
                    let ctl = WriteBlockResultCtl::decode(ctl)?;
                    outstanding.lock().unwrap().remove(&ctl.bnr);
                    completions.end_io(ctl.bnr, None, wire_errno(ctl.err));
                    Ok(())
                }),
            )?;
        }
        {
            // A dead peer fails everything still waiting on it
            let outstanding = outstanding.clone();
            messenger.set_peer_down_hook(Arc::new(move |addr| {
                let failed: Vec<u64> = {
                    let mut map = outstanding.lock().unwrap();
                    let failed: Vec<u64> = map
                        .iter()
                        .filter(|(_, a)| **a == addr)
                        .map(|(bnr, _)| *bnr)
                        .collect();
                    for bnr in &failed {
                        map.remove(bnr);
                    }
                    failed
                };
                if !failed.is_empty() {
                    warn!("peer {} down, failing {} submissions", addr, failed.len());
                }
                for bnr in failed {
                    completions.end_io(bnr, None, -libc::EIO);
                }
            }));
        }

        Ok(Self {
            messenger,
            manifest,
            outstanding,
            shutdown: AtomicBool::new(false),
        })
    }
}

impl BlockTransport for NetworkTransport {
    fn queue_depth(&self) -> usize {
        NET_QUEUE_DEPTH
    }

    fn submit_block(&self, op: BlockOp, bnr: u64, buf: Option<Arc<Page>>) -> UmbraFSResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(UmbraFSError::Io(-libc::ESHUTDOWN));
        }
        let server = self.manifest.server_for(bnr)?;
        let msg = match op {
            BlockOp::GetRead | BlockOp::GetWrite => {
                let access = if op == BlockOp::GetRead {
                    Access::Read
                } else {
                    Access::Write
                };
                let ctl = GetBlockCtl { bnr, access };
                Message::new(MsgType::GetBlock, ctl.encode(), None)
            }
            BlockOp::Write => {
                let buf = buf.ok_or(UmbraFSError::InvalidArgument)?;
                let ctl = WriteBlockCtl { bnr };
                Message::new(MsgType::WriteBlock, ctl.encode(), Some(buf))
            }
        };

        self.outstanding.lock().unwrap().insert(bnr, server);
        trace!("submit {:?} bnr={} to {}", op, bnr, server);
        if let Err(e) = self.messenger.send(server, msg) {
            self.outstanding.lock().unwrap().remove(&bnr);
            return Err(e);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.messenger.unregister_recv(MsgType::GetBlockResult);
        let _ = self.messenger.unregister_recv(MsgType::WriteBlockResult);
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
