//! UmbraFS block-cache runtime
//!
//! The client-side core of the UmbraFS network filesystem: a concurrent
//! cache of fixed-size blocks with read-through, grouped writeback and
//! atomic multi-block transactions, fed by pluggable block transports
//! (a local AIO engine, a network engine over the messaging substrate,
//! and a RAM-backed engine).

pub mod block;
pub mod cache;
pub mod client;
mod dirty;
pub mod error;
pub mod format;
pub mod local;
pub mod manifest;
pub mod mem;
pub mod messaging;
pub mod net;
pub mod page;
pub mod server;
pub mod transaction;
pub mod transport;
mod wait;

// Re-export the main types
pub use block::AcquireFlags;
pub use cache::{BlockCache, BlockRef, CacheStats, CacheTuning, CompletionHandle};
pub use client::Mount;
pub use error::{UmbraFSError, UmbraFSResult};
pub use format::{constants, Access, MsgHeader, MsgType, WireErr};
pub use local::LocalTransport;
pub use manifest::{Manifest, ManifestClient, ManifestSnapshot};
pub use mem::{MemoryStore, MemoryTransport};
pub use messaging::{Message, Messenger, MessengerStats};
pub use net::NetworkTransport;
pub use page::{Page, PagePool, PoolStats};
pub use server::{BlockServer, BlockServerStats};
pub use transaction::{read_block, write_block, Transaction};
pub use transport::{BlockOp, BlockTransport};

pub const UMBRAFS_VERSION: u32 = 0x00010000; // v0.1.0
