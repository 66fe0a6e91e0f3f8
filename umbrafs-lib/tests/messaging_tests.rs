//! Messaging, network transport, server and manifest integration tests

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use umbrafs_lib::{
    constants, read_block, write_block, BlockCache, BlockServer, BlockTransport, CacheTuning,
    ManifestSnapshot, MemoryStore, MemoryTransport, Messenger, MsgType, Mount, UmbraFSError,
};

/// A device server over a memory-backed cache
fn start_block_server() -> (Messenger, BlockServer, Arc<BlockCache>, MemoryStore, SocketAddr) {
    let store_slot = Arc::new(Mutex::new(None));
    let slot = store_slot.clone();
    let cache = Arc::new(
        BlockCache::new(CacheTuning::default(), move |completions| {
            let transport = MemoryTransport::new(completions, 32);
            *slot.lock().unwrap() = Some(transport.store());
            Ok(Box::new(transport) as Box<dyn BlockTransport>)
        })
        .unwrap(),
    );
    let store = store_slot.lock().unwrap().take().unwrap();

    let messenger = Messenger::new();
    let server = BlockServer::new(messenger.clone(), cache.clone()).unwrap();
    let addr = messenger.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    (messenger, server, cache, store, addr)
}

#[test]
fn test_network_read_and_write_roundtrip() {
    let (messenger, server, server_cache, store, addr) = start_block_server();

    let snapshot = ManifestSnapshot::new(1, vec![addr]);
    let mount = Mount::network(snapshot, CacheTuning::default()).unwrap();

    // Reading a never-written block returns zeros served by the remote
    let data = read_block(mount.cache(), 7).unwrap();
    assert!(data.iter().all(|&b| b == 0));

    // Writes travel to the server on sync
    write_block(mount.cache(), 3, b"over the wire").unwrap();
    mount.cache().sync().unwrap();

    // And come back on a fresh read after reclaim
    mount.cache().reclaim();
    mount.cache().reclaim();
    let data = read_block(mount.cache(), 3).unwrap();
    assert_eq!(&data[..13], b"over the wire");

    let stats = server.stats();
    assert_eq!(stats.gets, 2);
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.failures, 0);

    // The server's own cache pushes the block to its backing store
    server_cache.sync().unwrap();
    let stored = store.read(3).expect("block 3 reached the backing store");
    assert_eq!(&stored[..13], b"over the wire");
    assert_eq!(stored.len(), constants::BLOCK_SIZE);

    mount.shutdown();
    server.shutdown();
    messenger.shutdown();
}

#[test]
fn test_accept_rejects_duplicate_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let messenger = Messenger::new();

    // No handlers needed; the sockets stay silent
    let _client1 = TcpStream::connect(listen_addr).unwrap();
    let (accepted1, _) = listener.accept().unwrap();
    let _client2 = TcpStream::connect(listen_addr).unwrap();
    let (accepted2, _) = listener.accept().unwrap();

    let claimed: SocketAddr = "10.9.8.7:6543".parse().unwrap();
    messenger.accept(claimed, accepted1).unwrap();
    assert_eq!(
        messenger.accept(claimed, accepted2).unwrap_err(),
        UmbraFSError::PeerExists
    );

    assert_eq!(messenger.stats().peers, 1);
    messenger.shutdown();
}

#[test]
fn test_manifest_refresh_over_the_wire() {
    let (messenger, mut server, _server_cache, _store, addr) = start_block_server();
    let published = ManifestSnapshot::new(
        7,
        vec![addr, "127.0.0.1:8421".parse().unwrap()],
    );
    server.serve_manifest(published.clone()).unwrap();

    // The mount starts from a stale single-server snapshot and catches up
    let mount = Mount::network(
        ManifestSnapshot::new(1, vec![addr]),
        CacheTuning::default(),
    )
    .unwrap();
    assert_eq!(mount.manifest_seq(), Some(1));

    let installed = mount
        .refresh_manifest(addr, Duration::from_secs(5))
        .unwrap();
    assert!(installed);
    assert_eq!(mount.manifest_seq(), Some(7));

    // A second refresh finds nothing newer
    let installed = mount
        .refresh_manifest(addr, Duration::from_secs(5))
        .unwrap();
    assert!(!installed);

    assert_eq!(server.stats().manifests, 2);
    mount.shutdown();
    server.shutdown();
    messenger.shutdown();
}

#[test]
fn test_duplicate_handler_registration_is_an_error() {
    let messenger = Messenger::new();
    let handler: umbrafs_lib::messaging::RecvHandler = Arc::new(|_m, _a, _c, _d| Ok(()));
    messenger
        .register_recv(MsgType::GetBlock, handler.clone())
        .unwrap();
    assert_eq!(
        messenger.register_recv(MsgType::GetBlock, handler).unwrap_err(),
        UmbraFSError::InvalidArgument
    );
    messenger.unregister_recv(MsgType::GetBlock).unwrap();
    let handler: umbrafs_lib::messaging::RecvHandler = Arc::new(|_m, _a, _c, _d| Ok(()));
    messenger.register_recv(MsgType::GetBlock, handler).unwrap();
    messenger.shutdown();
}

#[test]
fn test_local_mount_through_client_api() {
    let path = std::env::temp_dir().join(format!("umbrafs-mount-{}.img", std::process::id()));
    {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(16 * constants::BLOCK_SIZE as u64).unwrap();
    }

    {
        let mount = Mount::local(&path, CacheTuning::default()).unwrap();
        write_block(mount.cache(), 2, b"local mount").unwrap();
        // Mount teardown syncs before stopping
    }

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[2 * constants::BLOCK_SIZE..2 * constants::BLOCK_SIZE + 11], b"local mount");
    let _ = std::fs::remove_file(&path);
}
