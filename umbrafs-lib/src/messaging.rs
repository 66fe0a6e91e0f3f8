//! Messaging substrate: peer table, per-peer send/receive threads and a
//! type-indexed dispatch table
//!
//! Every remote address maps to one peer. Outbound peers connect lazily on
//! first send; inbound peers are created by the listener. A peer runs a
//! sender thread draining its send queue and a receiver thread reading,
//! validating and dispatching messages. Any hard socket error shuts the
//! peer down idempotently; in-flight messages on that peer are discarded.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io::{IoSlice, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{debug, info, trace, warn};

use crate::error::{last_errno, UmbraFSError, UmbraFSResult};
use crate::format::constants::{LISTEN_BACKLOG, MSG_TYPE_COUNT};
use crate::format::{MsgHeader, MsgType};
use crate::page::Page;

/// Receive handler: called with the originating peer address, the control
/// payload and the data payload, if any
pub type RecvHandler =
    Arc<dyn Fn(&Messenger, SocketAddr, &[u8], Option<Page>) -> UmbraFSResult<()> + Send + Sync>;

/// Called when a peer is torn down, after its entry left the table
pub type PeerDownHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// One outbound message
pub struct Message {
    pub msg_type: MsgType,
    pub ctl: Vec<u8>,
    pub data: Option<Arc<Page>>,
}

impl Message {
    pub fn new(msg_type: MsgType, ctl: Vec<u8>, data: Option<Arc<Page>>) -> Self {
        Self { msg_type, ctl, data }
    }

    fn header(&self) -> MsgHeader {
        let data_size = self.data.as_ref().map(|p| p.as_slice().len()).unwrap_or(0);
        MsgHeader::new(self.msg_type, self.ctl.len(), data_size)
    }
}

struct Peer {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    sendq: Mutex<VecDeque<Message>>,
    send_cond: Condvar,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: Mutex::new(None),
            sendq: Mutex::new(VecDeque::new()),
            send_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }
}

struct MessengerInner {
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    handlers: RwLock<Vec<Option<RecvHandler>>>,
    listener: Mutex<Option<TcpListener>>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    peer_down: RwLock<Option<PeerDownHook>>,
    sent: AtomicU64,
    received: AtomicU64,
    shutdown: AtomicBool,
}

/// Messenger statistics
#[derive(Debug, Clone)]
pub struct MessengerStats {
    pub peers: usize,
    pub sent: u64,
    pub received: u64,
}

/// The messaging endpoint. Clones share one instance.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Messenger {
    pub fn new() -> Self {
        let mut handlers = Vec::with_capacity(MSG_TYPE_COUNT);
        handlers.resize_with(MSG_TYPE_COUNT, || None);
        Self {
            inner: Arc::new(MessengerInner {
                peers: RwLock::new(HashMap::new()),
                handlers: RwLock::new(handlers),
                listener: Mutex::new(None),
                listener_thread: Mutex::new(None),
                peer_down: RwLock::new(None),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Install the receive handler for `msg_type`. Installing a second
    /// handler for the same type is an error.
    pub fn register_recv(&self, msg_type: MsgType, handler: RecvHandler) -> UmbraFSResult<()> {
        let mut handlers = self.inner.handlers.write().unwrap();
        let slot = &mut handlers[msg_type as usize];
        if slot.is_some() {
            return Err(UmbraFSError::InvalidArgument);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Remove the receive handler for `msg_type`
    pub fn unregister_recv(&self, msg_type: MsgType) -> UmbraFSResult<()> {
        let mut handlers = self.inner.handlers.write().unwrap();
        let slot = &mut handlers[msg_type as usize];
        if slot.is_none() {
            return Err(UmbraFSError::InvalidArgument);
        }
        *slot = None;
        Ok(())
    }

    /// Hook invoked whenever a peer is torn down
    pub fn set_peer_down_hook(&self, hook: PeerDownHook) {
        *self.inner.peer_down.write().unwrap() = Some(hook);
    }

    /// Queue `msg` to the peer at `addr`, connecting first if needed
    pub fn send(&self, addr: SocketAddr, msg: Message) -> UmbraFSResult<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(UmbraFSError::Io(-libc::ESHUTDOWN));
        }
        let peer = self.outbound_peer(addr);
        if peer.shutdown.load(Ordering::Acquire) {
            return Err(UmbraFSError::Io(-libc::EPIPE));
        }
        peer.sendq.lock().unwrap().push_back(msg);
        peer.send_cond.notify_one();
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Adopt an accepted socket as the peer for `addr`. Rejects the socket
    /// when a peer for that address already exists.
    pub fn accept(&self, addr: SocketAddr, stream: TcpStream) -> UmbraFSResult<()> {
        let peer = {
            let mut peers = self.inner.peers.write().unwrap();
            match peers.entry(addr) {
                Entry::Occupied(_) => return Err(UmbraFSError::PeerExists),
                Entry::Vacant(v) => {
                    let peer = Arc::new(Peer::new(addr));
                    v.insert(peer.clone());
                    peer
                }
            }
        };
        debug!("accepted peer {}", addr);
        start_peer_io(&self.inner, &peer, stream);
        Ok(())
    }

    /// Bind `addr` and start accepting inbound peers
    pub fn listen(&self, addr: SocketAddrV4) -> UmbraFSResult<SocketAddr> {
        let listener = listen_socket(addr)?;
        let local = listener.local_addr()?;
        info!("listening on {}", local);
        {
            let accept_listener = listener.try_clone()?;
            let inner = self.inner.clone();
            let mut thread = self.inner.listener_thread.lock().unwrap();
            *self.inner.listener.lock().unwrap() = Some(listener);
            *thread = Some(std::thread::spawn(move || {
                listener_loop(&inner, accept_listener)
            }));
        }
        Ok(local)
    }

    /// Tear down every peer and stop the listener
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = inner.listener.lock().unwrap().take() {
            // Unblock the accept loop
            unsafe { libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR) };
        }
        if let Some(t) = inner.listener_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        let peers: Vec<Arc<Peer>> = inner.peers.read().unwrap().values().cloned().collect();
        for peer in peers {
            shutdown_peer(inner, &peer);
            let threads = std::mem::take(&mut *peer.threads.lock().unwrap());
            for t in threads {
                let _ = t.join();
            }
        }
    }

    pub fn stats(&self) -> MessengerStats {
        MessengerStats {
            peers: self.inner.peers.read().unwrap().len(),
            sent: self.inner.sent.load(Ordering::Relaxed),
            received: self.inner.received.load(Ordering::Relaxed),
        }
    }

    /// Find or create the peer for `addr`, connecting in the background
    fn outbound_peer(&self, addr: SocketAddr) -> Arc<Peer> {
        if let Some(peer) = self.inner.peers.read().unwrap().get(&addr) {
            return peer.clone();
        }
        let mut peers = self.inner.peers.write().unwrap();
        match peers.entry(addr) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                let peer = Arc::new(Peer::new(addr));
                v.insert(peer.clone());
                let inner = self.inner.clone();
                let connect_peer = peer.clone();
                let handle = std::thread::spawn(move || connector(&inner, &connect_peer));
                peer.threads.lock().unwrap().push(handle);
                peer
            }
        }
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an IPv4 listening socket with the configured backlog
fn listen_socket(addr: SocketAddrV4) -> UmbraFSResult<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(UmbraFSError::Io(last_errno()));
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = last_errno();
            libc::close(fd);
            return Err(UmbraFSError::Io(err));
        }
        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = last_errno();
            libc::close(fd);
            return Err(UmbraFSError::Io(err));
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn listener_loop(inner: &Arc<MessengerInner>, listener: TcpListener) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let messenger = Messenger {
                    inner: inner.clone(),
                };
                if let Err(e) = messenger.accept(peer_addr, stream) {
                    warn!("rejected connection from {}: {}", peer_addr, e);
                }
            }
            Err(_) => {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                // Transient accept failure; keep listening
            }
        }
    }
}

/// Connect an outbound peer, then hand the socket to the I/O threads
fn connector(inner: &Arc<MessengerInner>, peer: &Arc<Peer>) {
    match TcpStream::connect(peer.addr) {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            debug!("connected to {}", peer.addr);
            start_peer_io(inner, peer, stream);
        }
        Err(e) => {
            warn!("connect to {} failed: {}", peer.addr, e);
            shutdown_peer(inner, peer);
        }
    }
}

fn start_peer_io(inner: &Arc<MessengerInner>, peer: &Arc<Peer>, stream: TcpStream) {
    if peer.shutdown.load(Ordering::Acquire) {
        return;
    }
    let write_half = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => {
            shutdown_peer(inner, peer);
            return;
        }
    };
    let read_half = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => {
            shutdown_peer(inner, peer);
            return;
        }
    };
    *peer.stream.lock().unwrap() = Some(stream);

    let mut threads = peer.threads.lock().unwrap();
    {
        let inner = inner.clone();
        let peer = peer.clone();
        threads.push(std::thread::spawn(move || sender(&inner, &peer, write_half)));
    }
    {
        let inner = inner.clone();
        let peer = peer.clone();
        threads.push(std::thread::spawn(move || receiver(&inner, &peer, read_half)));
    }
}

/// Half-close the socket and drop the peer from the table. Safe to call
/// from the peer's own threads; idempotent.
fn shutdown_peer(inner: &Arc<MessengerInner>, peer: &Arc<Peer>) {
    if peer.shutdown.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!("shutting down peer {}", peer.addr);
    if let Some(stream) = peer.stream.lock().unwrap().as_ref() {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
    peer.send_cond.notify_all();
    {
        let mut peers = inner.peers.write().unwrap();
        if let Some(current) = peers.get(&peer.addr) {
            if Arc::ptr_eq(current, peer) {
                peers.remove(&peer.addr);
            }
        }
    }
    let hook = inner.peer_down.read().unwrap().clone();
    if let Some(hook) = hook {
        hook(peer.addr);
    }
}

/// Drain the peer's send queue, one vectored write per message
fn sender(inner: &Arc<MessengerInner>, peer: &Arc<Peer>, mut stream: TcpStream) {
    loop {
        let msg = {
            let mut queue = peer.sendq.lock().unwrap();
            loop {
                if peer.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(msg) = queue.pop_front() {
                    break msg;
                }
                queue = peer.send_cond.wait(queue).unwrap();
            }
        };
        if let Err(e) = write_message(&mut stream, &msg) {
            if !peer.shutdown.load(Ordering::Acquire) {
                warn!("send to {} failed: {}", peer.addr, e);
            }
            shutdown_peer(inner, peer);
            return;
        }
        trace!("sent {:?} to {}", msg.msg_type, peer.addr);
    }
}

fn write_message(stream: &mut TcpStream, msg: &Message) -> std::io::Result<()> {
    let header = msg.header().encode();
    let empty: &[u8] = &[];
    let data = msg.data.as_ref().map(|p| p.as_slice()).unwrap_or(empty);
    let slices = [
        IoSlice::new(&header),
        IoSlice::new(&msg.ctl),
        IoSlice::new(data),
    ];
    let total = header.len() + msg.ctl.len() + data.len();
    let mut written = stream.write_vectored(&slices)?;
    // Partial vectored writes finish sequentially
    while written < total {
        let (buf, offset) = if written < header.len() {
            (&header[..], written)
        } else if written < header.len() + msg.ctl.len() {
            (&msg.ctl[..], written - header.len())
        } else {
            (data, written - header.len() - msg.ctl.len())
        };
        let n = stream.write(&buf[offset..])?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    Ok(())
}

/// Read, validate and dispatch inbound messages until the socket dies
fn receiver(inner: &Arc<MessengerInner>, peer: &Arc<Peer>, mut stream: TcpStream) {
    loop {
        match read_message(inner, peer, &mut stream) {
            Ok(()) => {}
            Err(e) => {
                if !peer.shutdown.load(Ordering::Acquire) {
                    match e {
                        UmbraFSError::Protocol => {
                            warn!("protocol violation from {}", peer.addr)
                        }
                        _ => debug!("receive from {} ended: {}", peer.addr, e),
                    }
                }
                shutdown_peer(inner, peer);
                return;
            }
        }
    }
}

fn read_message(
    inner: &Arc<MessengerInner>,
    peer: &Arc<Peer>,
    stream: &mut TcpStream,
) -> UmbraFSResult<()> {
    let mut header_buf = [0u8; MsgHeader::SIZE];
    stream.read_exact(&mut header_buf)?;
    let header = MsgHeader::decode(&header_buf)?;

    let handler = {
        let handlers = inner.handlers.read().unwrap();
        match handlers[header.msg_type as usize].clone() {
            Some(h) => h,
            // A type nobody listens for is a protocol violation
            None => return Err(UmbraFSError::Protocol),
        }
    };

    let mut ctl = vec![0u8; header.ctl_size as usize];
    stream.read_exact(&mut ctl)?;

    let data = if header.data_size > 0 {
        let mut page = Page::zeroed()?;
        stream.read_exact(&mut page.as_mut_slice()[..header.data_size as usize])?;
        Some(page)
    } else {
        None
    };

    inner.received.fetch_add(1, Ordering::Relaxed);
    let messenger = Messenger {
        inner: inner.clone(),
    };
    let msg_type = MsgType::from_u8(header.msg_type)?;
    trace!("received {:?} from {}", msg_type, peer.addr);
    if let Err(e) = handler(&messenger, peer.addr, &ctl, data) {
        if e == UmbraFSError::Protocol {
            return Err(e);
        }
        warn!("handler for {:?} failed: {}", msg_type, e);
    }
    Ok(())
}
