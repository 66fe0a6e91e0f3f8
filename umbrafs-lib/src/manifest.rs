//! Manifest: the sequence-numbered mapping from block numbers to servers
//!
//! Within one snapshot the mapping is deterministic: the server at index
//! `bnr mod N` owns the block. Refreshing only ever moves to a strictly
//! newer sequence number.

use std::net::{SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{UmbraFSError, UmbraFSResult};
use crate::format::{GetManifestCtl, GetManifestResultCtl, MsgType, WireErr};
use crate::messaging::{Message, Messenger};
use crate::page::Page;

/// One observed state of the block-to-server mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    pub seq: u64,
    pub servers: Vec<SocketAddr>,
}

impl ManifestSnapshot {
    pub fn new(seq: u64, servers: Vec<SocketAddr>) -> Self {
        Self { seq, servers }
    }

    /// Load a snapshot from a JSON file:
    /// `{"seq": 1, "servers": ["127.0.0.1:8420"]}`
    pub fn load_json(path: &Path) -> UmbraFSResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let snapshot: ManifestSnapshot =
            serde_json::from_str(&contents).map_err(|_| UmbraFSError::InvalidArgument)?;
        Ok(snapshot)
    }

    /// Pack the snapshot into one block: count, then per-server IPv4
    /// address and port
    pub fn encode_block(&self) -> UmbraFSResult<Page> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_u16::<LittleEndian>(self.servers.len() as u16)
            .unwrap();
        for server in &self.servers {
            let v4 = match server {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => return Err(UmbraFSError::InvalidArgument),
            };
            buf.extend_from_slice(&v4.ip().octets());
            buf.write_u16::<LittleEndian>(v4.port()).unwrap();
        }
        if buf.len() > crate::format::constants::BLOCK_SIZE {
            return Err(UmbraFSError::InvalidArgument);
        }
        let mut page = Page::zeroed()?;
        page.copy_from(&buf);
        Ok(page)
    }

    /// Unpack a snapshot block received with sequence number `seq`
    pub fn decode_block(seq: u64, data: &[u8]) -> UmbraFSResult<Self> {
        use std::io::Read;

        let mut r = data;
        let count = r
            .read_u16::<LittleEndian>()
            .map_err(|_| UmbraFSError::Protocol)? as usize;
        if data.len() < 2 + count * 6 {
            return Err(UmbraFSError::Protocol);
        }
        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).map_err(|_| UmbraFSError::Protocol)?;
            let port = r
                .read_u16::<LittleEndian>()
                .map_err(|_| UmbraFSError::Protocol)?;
            servers.push(SocketAddr::V4(SocketAddrV4::new(octets.into(), port)));
        }
        Ok(Self { seq, servers })
    }
}

/// Shared, refreshable view of the current snapshot
pub struct Manifest {
    snapshot: RwLock<Arc<ManifestSnapshot>>,
}

impl Manifest {
    pub fn new(snapshot: ManifestSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<ManifestSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    pub fn seq(&self) -> u64 {
        self.snapshot.read().unwrap().seq
    }

    /// The server owning `bnr` under the current snapshot
    pub fn server_for(&self, bnr: u64) -> UmbraFSResult<SocketAddr> {
        let snapshot = self.snapshot.read().unwrap();
        if snapshot.servers.is_empty() {
            return Err(UmbraFSError::InvalidArgument);
        }
        let index = (bnr % snapshot.servers.len() as u64) as usize;
        Ok(snapshot.servers[index])
    }

    /// Install `fresh` if it is strictly newer. Returns whether it was
    /// installed.
    pub fn refresh(&self, fresh: ManifestSnapshot) -> bool {
        let mut current = self.snapshot.write().unwrap();
        if fresh.seq <= current.seq {
            return false;
        }
        info!(
            "manifest refreshed: seq {} -> {}, {} servers",
            current.seq,
            fresh.seq,
            fresh.servers.len()
        );
        *current = Arc::new(fresh);
        true
    }
}

struct FetchSlot {
    result: Mutex<Option<UmbraFSResult<ManifestSnapshot>>>,
    cond: Condvar,
}

/// Blocking manifest fetch over the messaging layer
///
/// Owns the GET_MANIFEST_RESULT handler of its messenger; create one per
/// client process.
pub struct ManifestClient {
    messenger: Messenger,
    slot: Arc<FetchSlot>,
}

impl ManifestClient {
    pub fn new(messenger: Messenger) -> UmbraFSResult<Self> {
        let slot = Arc::new(FetchSlot {
            result: Mutex::new(None),
            cond: Condvar::new(),
        });
        {
            let slot = slot.clone();
            messenger.register_recv(
                MsgType::GetManifestResult,
                Arc::new(move |_msgr, _from, ctl, data| {
                    let ctl = GetManifestResultCtl::decode(ctl)?;
                    let outcome = match (ctl.err, data) {
                        (WireErr::Ok, Some(page)) => {
                            ManifestSnapshot::decode_block(ctl.seq_nr, page.as_slice())
                        }
                        (WireErr::Ok, None) => Err(UmbraFSError::Protocol),
                        (err, _) => Err(err.to_error().unwrap_or(UmbraFSError::Protocol)),
                    };
                    let mut result = slot.result.lock().unwrap();
                    *result = Some(outcome);
                    slot.cond.notify_all();
                    Ok(())
                }),
            )?;
        }
        Ok(Self { messenger, slot })
    }

    /// Ask `server` for a snapshot newer than `have_seq` and wait for the
    /// answer
    pub fn fetch(
        &self,
        server: SocketAddr,
        have_seq: u64,
        timeout: Duration,
    ) -> UmbraFSResult<ManifestSnapshot> {
        {
            let mut result = self.slot.result.lock().unwrap();
            *result = None;
        }
        let ctl = GetManifestCtl { seq_nr: have_seq };
        self.messenger
            .send(server, Message::new(MsgType::GetManifest, ctl.encode(), None))?;

        let mut result = self.slot.result.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = result.take() {
                return outcome;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(UmbraFSError::Io(-libc::ETIMEDOUT));
            }
            let (guard, _) = self
                .slot
                .cond
                .wait_timeout(result, deadline - now)
                .unwrap();
            result = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new([127, 0, 0, 1].into(), port))
    }

    #[test]
    fn test_server_mapping_is_modulo() {
        let manifest = Manifest::new(ManifestSnapshot::new(1, vec![addr(1), addr(2), addr(3)]));
        assert_eq!(manifest.server_for(0).unwrap(), addr(1));
        assert_eq!(manifest.server_for(1).unwrap(), addr(2));
        assert_eq!(manifest.server_for(5).unwrap(), addr(3));
        assert_eq!(manifest.server_for(6).unwrap(), addr(1));
    }

    #[test]
    fn test_empty_manifest_is_invalid() {
        let manifest = Manifest::new(ManifestSnapshot::new(1, Vec::new()));
        assert_eq!(
            manifest.server_for(0),
            Err(UmbraFSError::InvalidArgument)
        );
    }

    #[test]
    fn test_refresh_requires_newer_seq() {
        let manifest = Manifest::new(ManifestSnapshot::new(5, vec![addr(1)]));
        assert!(!manifest.refresh(ManifestSnapshot::new(5, vec![addr(2)])));
        assert!(!manifest.refresh(ManifestSnapshot::new(4, vec![addr(2)])));
        assert!(manifest.refresh(ManifestSnapshot::new(6, vec![addr(2)])));
        assert_eq!(manifest.server_for(0).unwrap(), addr(2));
    }

    #[test]
    fn test_snapshot_block_roundtrip() {
        let snapshot = ManifestSnapshot::new(9, vec![addr(8420), addr(8421)]);
        let page = snapshot.encode_block().unwrap();
        let decoded = ManifestSnapshot::decode_block(9, page.as_slice()).unwrap();
        assert_eq!(decoded.seq, 9);
        assert_eq!(decoded.servers, snapshot.servers);
    }

    #[test]
    fn test_json_snapshot() {
        let json = r#"{"seq": 3, "servers": ["127.0.0.1:8420", "127.0.0.1:8421"]}"#;
        let snapshot: ManifestSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.seq, 3);
        assert_eq!(snapshot.servers.len(), 2);
        assert_eq!(snapshot.servers[0], addr(8420));
    }
}
