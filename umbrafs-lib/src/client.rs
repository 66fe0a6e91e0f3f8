//! Client mount: the cache, transport, messaging and manifest of one
//! client process wired together
//!
//! A mount either sits on a local device (no networking) or on the cluster
//! through the manifest. The network form shares its manifest with the
//! transport, so a refresh to a newer snapshot retargets subsequent
//! submissions without touching the cache.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::cache::{BlockCache, CacheTuning};
use crate::error::{UmbraFSError, UmbraFSResult};
use crate::local::LocalTransport;
use crate::manifest::{Manifest, ManifestClient, ManifestSnapshot};
use crate::messaging::Messenger;
use crate::net::NetworkTransport;
use crate::transport::BlockTransport;

/// One client process's view of the block address space
pub struct Mount {
    cache: Arc<BlockCache>,
    messenger: Option<Messenger>,
    manifest: Option<Arc<Manifest>>,
    manifest_client: Option<ManifestClient>,
    down: std::sync::atomic::AtomicBool,
}

impl Mount {
    /// Mount a local device or image file
    pub fn local(path: &Path, tuning: CacheTuning) -> UmbraFSResult<Self> {
        let path = path.to_path_buf();
        let cache = BlockCache::new(tuning, move |completions| {
            Ok(Box::new(LocalTransport::new(&path, completions)?) as Box<dyn BlockTransport>)
        })?;
        Ok(Self {
            cache: Arc::new(cache),
            messenger: None,
            manifest: None,
            manifest_client: None,
            down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Mount the cluster described by `snapshot`
    pub fn network(snapshot: ManifestSnapshot, tuning: CacheTuning) -> UmbraFSResult<Self> {
        if snapshot.servers.is_empty() {
            return Err(UmbraFSError::InvalidArgument);
        }
        let messenger = Messenger::new();
        let manifest = Arc::new(Manifest::new(snapshot));
        let net_messenger = messenger.clone();
        let net_manifest = manifest.clone();
        let cache = BlockCache::new(tuning, move |completions| {
            Ok(
                Box::new(NetworkTransport::new(net_messenger, net_manifest, completions)?)
                    as Box<dyn BlockTransport>,
            )
        })?;
        let manifest_client = ManifestClient::new(messenger.clone())?;
        Ok(Self {
            cache: Arc::new(cache),
            messenger: Some(messenger),
            manifest: Some(manifest),
            manifest_client: Some(manifest_client),
            down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// The block cache of this mount
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Shared handle to the cache, for worker threads
    pub fn cache_handle(&self) -> Arc<BlockCache> {
        self.cache.clone()
    }

    /// The messenger, when this mount is networked
    pub fn messenger(&self) -> Option<&Messenger> {
        self.messenger.as_ref()
    }

    /// Current manifest sequence number, when networked
    pub fn manifest_seq(&self) -> Option<u64> {
        self.manifest.as_ref().map(|m| m.seq())
    }

    /// Ask `server` for a newer manifest and install it if it is strictly
    /// newer. Returns whether the routing changed.
    pub fn refresh_manifest(
        &self,
        server: SocketAddr,
        timeout: Duration,
    ) -> UmbraFSResult<bool> {
        let (manifest, client) = match (&self.manifest, &self.manifest_client) {
            (Some(m), Some(c)) => (m, c),
            _ => return Err(UmbraFSError::NotSupported),
        };
        let have = manifest.seq();
        let fresh = client.fetch(server, have, timeout)?;
        let installed = manifest.refresh(fresh);
        if installed {
            info!("manifest advanced past seq {}", have);
        }
        Ok(installed)
    }

    /// Flush and tear the mount down; idempotent
    pub fn shutdown(&self) {
        if self.down.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        let _ = self.cache.sync();
        self.cache.shutdown();
        if let Some(messenger) = &self.messenger {
            messenger.shutdown();
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.shutdown();
    }
}
