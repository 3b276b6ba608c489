//! A software fabric: the [`Fabric`] interface emulated over TCP.
//!
//! The connection-management handshake, the two-sided send/receive pair
//! and the one-sided READ/WRITE all become small framed messages on a TCP
//! stream. One-sided operations are serviced by the passive side's
//! per-connection reader thread directly against the rkey registry, so
//! the passive application never participates, which is the contract a
//! real RNIC provides. The initiator's completion fires only once the remote
//! side has acknowledged placement, matching reliable-connection
//! semantics.

mod wire;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use self::wire::{read_frame, write_frame, Frame};
use super::{
    Access, ConnId, CqHandle, Event, EventKind, Fabric, MrHandle, QpCaps, QpHandle, Wc, WcOpcode,
    WcStatus,
};
use crate::error::FabricError;
use crate::proto::{BufferDescriptor, ConnParams, TransferMode};

/// How long an accepted stream may take to present its `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver-not-ready emulation: how long an inbound send waits for a
/// receive to be posted before it is dropped.
const RNR_DELAY: Duration = Duration::from_millis(5);
const RNR_RETRIES: u32 = 200;

type SharedBuf = Arc<Mutex<Box<[u8]>>>;

/// Poison-tolerant lock. A panicked holder leaves plain bytes behind,
/// which are still safe to read.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A region advertised for remote access, resolvable by rkey.
#[derive(Debug)]
struct RemoteEntry {
    addr: u64,
    access: Access,
    buf: SharedBuf,
}

type Registry = Arc<Mutex<HashMap<u32, RemoteEntry>>>;

/// State shared between the fabric and a connection's helper threads.
#[derive(Debug)]
struct ConnShared {
    id: u64,
    writer: Mutex<Option<TcpStream>>,
    recv_queue: Mutex<VecDeque<SharedBuf>>,
    pending_reads: Mutex<VecDeque<SharedBuf>>,
    pending_writes: Mutex<VecDeque<u32>>,
    cq: Mutex<VecDeque<Wc>>,
    events: Sender<Event>,
    registry: Registry,
}

impl ConnShared {
    fn new(id: u64, events: Sender<Event>, registry: Registry) -> Arc<Self> {
        Arc::new(ConnShared {
            id,
            writer: Mutex::new(None),
            recv_queue: Mutex::new(VecDeque::new()),
            pending_reads: Mutex::new(VecDeque::new()),
            pending_writes: Mutex::new(VecDeque::new()),
            cq: Mutex::new(VecDeque::new()),
            events,
            registry,
        })
    }

    fn push_event(&self, kind: EventKind) {
        // The fabric may already be gone; residual events are dropped.
        let _ = self.events.send(Event {
            conn: ConnId(self.id),
            kind,
        });
    }

    fn push_wc(&self, wc: Wc) {
        lock(&self.cq).push_back(wc);
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), FabricError> {
        let mut guard = lock(&self.writer);
        let stream = guard.as_mut().ok_or(FabricError::NotConnected)?;
        write_frame(stream, frame).map_err(FabricError::Io)
    }
}

/// An accepted stream waiting for the application's accept/reject verdict.
#[derive(Debug)]
struct PendingConn {
    stream: TcpStream,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingConn>>>;

#[derive(Debug)]
struct ConnState {
    shared: Arc<ConnShared>,
    /// Resolved target address (client side).
    target: Option<SocketAddr>,
    /// Timeout supplied at address resolution, reused for the connect.
    connect_timeout: Duration,
    route_ready: bool,
    /// Inbound stream awaiting accept/reject (server side).
    pending: Option<TcpStream>,
}

#[derive(Debug)]
struct MrEntry {
    conn: u64,
    rkey: u32,
    addr: u64,
    buf: SharedBuf,
}

/// TCP-backed [`Fabric`] implementation.
#[derive(Debug)]
pub struct SoftFabric {
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    next_id: Arc<AtomicU64>,
    conns: HashMap<u64, ConnState>,
    cqs: HashMap<u64, u64>,
    qps: HashMap<u64, u64>,
    mrs: HashMap<u64, MrEntry>,
    registry: Registry,
    pending: PendingMap,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftFabric {
    pub fn new() -> Self {
        let (events_tx, events_rx) = channel();
        SoftFabric {
            events_tx,
            events_rx,
            next_id: Arc::new(AtomicU64::new(1)),
            conns: HashMap::new(),
            cqs: HashMap::new(),
            qps: HashMap::new(),
            mrs: HashMap::new(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn new_conn_state(&self, id: u64) -> ConnState {
        ConnState {
            shared: ConnShared::new(id, self.events_tx.clone(), self.registry.clone()),
            target: None,
            connect_timeout: HANDSHAKE_TIMEOUT,
            route_ready: false,
            pending: None,
        }
    }

    /// Move a connection handed over by the accept loop into the live map
    /// so resources can be created for it before `accept` is called.
    fn adopt_pending(&mut self, id: u64) {
        if self.conns.contains_key(&id) {
            return;
        }
        if let Some(p) = lock(&self.pending).remove(&id) {
            let mut state = self.new_conn_state(id);
            state.pending = Some(p.stream);
            self.conns.insert(id, state);
        }
    }

    fn conn(&self, id: ConnId) -> Result<&ConnState, FabricError> {
        self.conns.get(&id.0).ok_or(FabricError::UnknownConn)
    }

    fn conn_mut(&mut self, id: ConnId) -> Result<&mut ConnState, FabricError> {
        self.conns.get_mut(&id.0).ok_or(FabricError::UnknownConn)
    }

    fn mr(&self, mr: MrHandle) -> Result<&MrEntry, FabricError> {
        self.mrs.get(&mr.0).ok_or(FabricError::UnknownMr)
    }

    fn shared_of_qp(&self, qp: QpHandle) -> Result<Arc<ConnShared>, FabricError> {
        let conn = self.qps.get(&qp.0).ok_or(FabricError::UnknownQp)?;
        Ok(self
            .conns
            .get(conn)
            .ok_or(FabricError::UnknownConn)?
            .shared
            .clone())
    }

    /// Look up the local MR a one-sided op uses and check it covers the
    /// remote length.
    fn one_sided_local(
        &self,
        qp: QpHandle,
        mr: MrHandle,
        remote: &BufferDescriptor,
    ) -> Result<(Arc<ConnShared>, SharedBuf), FabricError> {
        let shared = self.shared_of_qp(qp)?;
        let entry = self.mr(mr)?;
        let local_len = lock(&entry.buf).len();
        if local_len < remote.len as usize {
            return Err(FabricError::LengthMismatch {
                local: local_len,
                remote: remote.len as usize,
            });
        }
        Ok((shared, entry.buf.clone()))
    }

    fn push_event(&self, conn: u64, kind: EventKind) -> Result<(), FabricError> {
        self.events_tx
            .send(Event {
                conn: ConnId(conn),
                kind,
            })
            .map_err(|_| FabricError::ChannelClosed)
    }
}

impl Fabric for SoftFabric {
    fn listen(&mut self, port: u16) -> Result<(ConnId, u16), FabricError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let bound = listener.local_addr()?.port();
        let id = self.alloc_id();
        self.conns.insert(id, self.new_conn_state(id));

        let next_id = self.next_id.clone();
        let pending = self.pending.clone();
        let events = self.events_tx.clone();
        thread::spawn(move || accept_loop(listener, next_id, pending, events));

        debug!("listening on port {bound} (listener #{id})");
        Ok((ConnId(id), bound))
    }

    fn resolve_addr(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<ConnId, FabricError> {
        let id = self.alloc_id();
        let mut state = self.new_conn_state(id);
        state.connect_timeout = timeout;

        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    debug!("conn #{id}: {host}:{port} resolved to {addr}");
                    state.target = Some(addr);
                    self.push_event(id, EventKind::AddrResolved)?;
                }
                None => self.push_event(id, EventKind::AddrError)?,
            },
            Err(e) => {
                debug!("conn #{id}: cannot resolve {host}:{port}: {e}");
                self.push_event(id, EventKind::AddrError)?;
            }
        }
        self.conns.insert(id, state);
        Ok(ConnId(id))
    }

    fn resolve_route(&mut self, conn: ConnId, _timeout: Duration) -> Result<(), FabricError> {
        let state = self.conn_mut(conn)?;
        if state.target.is_some() {
            state.route_ready = true;
            self.push_event(conn.0, EventKind::RouteResolved)
        } else {
            self.push_event(conn.0, EventKind::RouteError)
        }
    }

    fn connect(&mut self, conn: ConnId, params: &ConnParams) -> Result<(), FabricError> {
        let state = self.conn(conn)?;
        let target = state.target.ok_or(FabricError::NotConnected)?;
        if !state.route_ready {
            return Err(FabricError::NotConnected);
        }

        let shared = state.shared.clone();
        let timeout = state.connect_timeout;
        let mode = params.mode;
        thread::spawn(move || {
            match client_handshake(target, mode, timeout) {
                Ok(stream) => match stream.try_clone() {
                    Ok(writer) => {
                        *lock(&shared.writer) = Some(writer);
                        let reader_shared = shared.clone();
                        thread::spawn(move || reader_loop(reader_shared, stream));
                        shared.push_event(EventKind::Established);
                    }
                    Err(e) => {
                        warn!("conn #{}: cannot clone stream: {e}", shared.id);
                        shared.push_event(EventKind::ConnectError);
                    }
                },
                Err(HandshakeFail::Rejected) => shared.push_event(EventKind::Rejected),
                Err(HandshakeFail::Io(e)) => {
                    debug!("conn #{}: connect to {target} failed: {e}", shared.id);
                    shared.push_event(EventKind::ConnectError);
                }
            }
        });
        Ok(())
    }

    fn accept(&mut self, conn: ConnId, _params: &ConnParams) -> Result<(), FabricError> {
        self.adopt_pending(conn.0);
        let state = self.conn_mut(conn)?;
        let mut stream = state.pending.take().ok_or(FabricError::NoPendingRequest)?;
        write_frame(&mut stream, &Frame::HelloAck)?;

        *lock(&state.shared.writer) = Some(stream.try_clone()?);
        let shared = state.shared.clone();
        thread::spawn(move || reader_loop(shared, stream));
        self.push_event(conn.0, EventKind::Established)
    }

    fn reject(&mut self, conn: ConnId) -> Result<(), FabricError> {
        self.adopt_pending(conn.0);
        let state = self.conn_mut(conn)?;
        let mut stream = state.pending.take().ok_or(FabricError::NoPendingRequest)?;
        // The initiator learns of the rejection from the frame; the stream
        // is dropped right after.
        write_frame(&mut stream, &Frame::Reject)?;
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnId) -> Result<(), FabricError> {
        let state = self.conn(conn)?;
        if let Err(e) = state.shared.send_frame(&Frame::Bye) {
            debug!("conn #{}: could not send bye: {e}", conn.0);
        }
        self.push_event(conn.0, EventKind::Disconnected)
    }

    fn destroy_id(&mut self, conn: ConnId) -> Result<(), FabricError> {
        lock(&self.pending).remove(&conn.0);
        if let Some(state) = self.conns.remove(&conn.0) {
            if let Some(stream) = lock(&state.shared.writer).take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        } else {
            debug!("destroy_id on unknown connection #{}", conn.0);
        }
        Ok(())
    }

    fn create_cq(&mut self, conn: ConnId, _depth: u32) -> Result<CqHandle, FabricError> {
        self.adopt_pending(conn.0);
        self.conn(conn)?;
        let id = self.alloc_id();
        self.cqs.insert(id, conn.0);
        Ok(CqHandle(id))
    }

    fn create_qp(
        &mut self,
        conn: ConnId,
        cq: CqHandle,
        _caps: &QpCaps,
    ) -> Result<QpHandle, FabricError> {
        self.conn(conn)?;
        let cq_conn = self.cqs.get(&cq.0).ok_or(FabricError::UnknownCq)?;
        if *cq_conn != conn.0 {
            return Err(FabricError::UnknownCq);
        }
        let id = self.alloc_id();
        self.qps.insert(id, conn.0);
        Ok(QpHandle(id))
    }

    fn register_memory(
        &mut self,
        conn: ConnId,
        len: usize,
        access: Access,
    ) -> Result<MrHandle, FabricError> {
        self.adopt_pending(conn.0);
        self.conn(conn)?;

        let buf: SharedBuf = Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice()));
        let addr = lock(&buf).as_ptr() as u64;
        let id = self.alloc_id();
        let rkey = id as u32;
        lock(&self.registry).insert(
            rkey,
            RemoteEntry {
                addr,
                access,
                buf: buf.clone(),
            },
        );
        self.mrs.insert(
            id,
            MrEntry {
                conn: conn.0,
                rkey,
                addr,
                buf,
            },
        );
        trace!("conn #{}: registered {len}-byte region, rkey {rkey}", conn.0);
        Ok(MrHandle(id))
    }

    fn deregister_memory(&mut self, mr: MrHandle) -> Result<(), FabricError> {
        let entry = self.mrs.remove(&mr.0).ok_or(FabricError::UnknownMr)?;
        lock(&self.registry).remove(&entry.rkey);
        Ok(())
    }

    fn destroy_qp(&mut self, qp: QpHandle) -> Result<(), FabricError> {
        self.qps.remove(&qp.0).map(|_| ()).ok_or(FabricError::UnknownQp)
    }

    fn destroy_cq(&mut self, cq: CqHandle) -> Result<(), FabricError> {
        self.cqs.remove(&cq.0).map(|_| ()).ok_or(FabricError::UnknownCq)
    }

    fn descriptor(&self, mr: MrHandle) -> Result<BufferDescriptor, FabricError> {
        let entry = self.mr(mr)?;
        let len = lock(&entry.buf).len() as u32;
        Ok(BufferDescriptor::new(entry.addr, entry.rkey, len))
    }

    fn write_local(
        &mut self,
        mr: MrHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), FabricError> {
        let entry = self.mr(mr)?;
        let mut buf = lock(&entry.buf);
        let end = offset.checked_add(data.len()).ok_or(FabricError::OutOfBounds)?;
        if end > buf.len() {
            return Err(FabricError::OutOfBounds);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_local(&self, mr: MrHandle, out: &mut [u8]) -> Result<usize, FabricError> {
        let entry = self.mr(mr)?;
        let buf = lock(&entry.buf);
        let n = out.len().min(buf.len());
        out[..n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn post_send(&mut self, qp: QpHandle, mr: MrHandle) -> Result<(), FabricError> {
        let shared = self.shared_of_qp(qp)?;
        let entry = self.mr(mr)?;
        let payload = lock(&entry.buf).to_vec();
        let len = payload.len() as u32;
        shared.send_frame(&Frame::Send { payload })?;
        shared.push_wc(Wc {
            opcode: WcOpcode::Send,
            status: WcStatus::Success,
            byte_len: len,
        });
        Ok(())
    }

    fn post_receive(&mut self, qp: QpHandle, mr: MrHandle) -> Result<(), FabricError> {
        let shared = self.shared_of_qp(qp)?;
        let entry = self.mr(mr)?;
        if entry.conn != shared.id {
            return Err(FabricError::UnknownMr);
        }
        lock(&shared.recv_queue).push_back(entry.buf.clone());
        Ok(())
    }

    fn post_read(
        &mut self,
        qp: QpHandle,
        local: MrHandle,
        remote: &BufferDescriptor,
    ) -> Result<(), FabricError> {
        let (shared, buf) = self.one_sided_local(qp, local, remote)?;
        lock(&shared.pending_reads).push_back(buf);
        shared.send_frame(&Frame::Read {
            addr: remote.addr,
            rkey: remote.rkey,
            len: remote.len,
        })
    }

    fn post_write(
        &mut self,
        qp: QpHandle,
        local: MrHandle,
        remote: &BufferDescriptor,
    ) -> Result<(), FabricError> {
        let (shared, buf) = self.one_sided_local(qp, local, remote)?;
        let data = lock(&buf)[..remote.len as usize].to_vec();
        lock(&shared.pending_writes).push_back(remote.len);
        shared.send_frame(&Frame::Write {
            addr: remote.addr,
            rkey: remote.rkey,
            len: remote.len,
            data,
        })
    }

    fn poll_cq(&mut self, cq: CqHandle) -> Result<Option<Wc>, FabricError> {
        let conn = self.cqs.get(&cq.0).ok_or(FabricError::UnknownCq)?;
        let state = self.conns.get(conn).ok_or(FabricError::UnknownConn)?;
        Ok(lock(&state.shared.cq).pop_front())
    }

    fn next_event(&mut self) -> Result<Event, FabricError> {
        self.events_rx.recv().map_err(|_| FabricError::ChannelClosed)
    }
}

impl Drop for SoftFabric {
    fn drop(&mut self) {
        // Unblock peer readers so their threads observe EOF and exit.
        for state in self.conns.values() {
            if let Some(stream) = lock(&state.shared.writer).take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

enum HandshakeFail {
    Rejected,
    Io(io::Error),
}

impl From<io::Error> for HandshakeFail {
    fn from(e: io::Error) -> Self {
        HandshakeFail::Io(e)
    }
}

fn client_handshake(
    target: SocketAddr,
    mode: TransferMode,
    timeout: Duration,
) -> Result<TcpStream, HandshakeFail> {
    let mut stream = TcpStream::connect_timeout(&target, timeout)?;
    write_frame(&mut stream, &Frame::Hello { mode })?;
    match read_frame(&mut stream)? {
        Frame::HelloAck => Ok(stream),
        Frame::Reject => Err(HandshakeFail::Rejected),
        other => Err(HandshakeFail::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected handshake reply: {other:?}"),
        ))),
    }
}

fn accept_loop(
    listener: TcpListener,
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
    events: Sender<Event>,
) {
    loop {
        let (mut stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };
        let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
        let mode = match read_frame(&mut stream) {
            Ok(Frame::Hello { mode }) => mode,
            Ok(other) => {
                debug!("dropping connection from {peer}: expected hello, got {other:?}");
                continue;
            }
            Err(e) => {
                debug!("dropping connection from {peer}: {e}");
                continue;
            }
        };
        let _ = stream.set_read_timeout(None);

        let id = next_id.fetch_add(1, Ordering::SeqCst);
        lock(&pending).insert(id, PendingConn { stream });
        debug!("connect request #{id} from {peer} (mode {mode})");
        if events
            .send(Event {
                conn: ConnId(id),
                kind: EventKind::ConnectRequest { peer_mode: mode },
            })
            .is_err()
        {
            // Fabric is gone; stop listening.
            return;
        }
    }
}

/// Services every inbound frame of one connection.
fn reader_loop(shared: Arc<ConnShared>, mut stream: TcpStream) {
    let id = shared.id;
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("conn #{id}: reader stopping: {e}");
                shared.push_event(EventKind::Disconnected);
                return;
            }
        };
        trace!("conn #{id}: inbound {frame:?}");
        match frame {
            Frame::Send { payload } => deliver_send(&shared, payload),
            Frame::Read { addr, rkey, len } => {
                let reply = service_read(&shared.registry, addr, rkey, len);
                if let Err(e) = shared.send_frame(&reply) {
                    warn!("conn #{id}: cannot answer read: {e}");
                }
            }
            Frame::Write { addr, rkey, len, data } => {
                let reply = service_write(&shared.registry, addr, rkey, len, &data);
                if let Err(e) = shared.send_frame(&reply) {
                    warn!("conn #{id}: cannot acknowledge write: {e}");
                }
            }
            Frame::ReadResp { data } => complete_read(&shared, &data),
            Frame::ReadNak => shared.push_wc(Wc {
                opcode: WcOpcode::RdmaRead,
                status: WcStatus::RemoteAccessError,
                byte_len: 0,
            }),
            Frame::WriteAck => {
                let len = lock(&shared.pending_writes).pop_front().unwrap_or(0);
                shared.push_wc(Wc {
                    opcode: WcOpcode::RdmaWrite,
                    status: WcStatus::Success,
                    byte_len: len,
                });
            }
            Frame::WriteNak => {
                lock(&shared.pending_writes).pop_front();
                shared.push_wc(Wc {
                    opcode: WcOpcode::RdmaWrite,
                    status: WcStatus::RemoteAccessError,
                    byte_len: 0,
                });
            }
            Frame::Bye => {
                shared.push_event(EventKind::Disconnected);
                return;
            }
            Frame::Hello { .. } | Frame::HelloAck | Frame::Reject => {
                debug!("conn #{id}: handshake frame after establishment, dropping connection");
                shared.push_event(EventKind::Disconnected);
                return;
            }
        }
    }
}

/// Land a two-sided send in the oldest posted receive. Waits bounded-ly
/// for a receive to appear (receiver-not-ready emulation), then drops the
/// message.
fn deliver_send(shared: &ConnShared, payload: Vec<u8>) {
    let mut slot = None;
    for _ in 0..RNR_RETRIES {
        if let Some(buf) = lock(&shared.recv_queue).pop_front() {
            slot = Some(buf);
            break;
        }
        thread::sleep(RNR_DELAY);
    }
    let Some(buf) = slot else {
        warn!(
            "conn #{}: send arrived with no posted receive, dropping {} bytes",
            shared.id,
            payload.len()
        );
        return;
    };

    let mut guard = lock(&buf);
    if payload.len() > guard.len() {
        warn!(
            "conn #{}: inbound send ({} bytes) exceeds receive buffer ({} bytes)",
            shared.id,
            payload.len(),
            guard.len()
        );
        shared.push_wc(Wc {
            opcode: WcOpcode::Recv,
            status: WcStatus::LocalLengthError,
            byte_len: 0,
        });
        // The consumer still has to learn the receive finished, even in
        // error; the buffer itself stays untouched.
        shared.push_event(EventKind::RecvComplete);
        return;
    }
    let n = payload.len();
    guard[..n].copy_from_slice(&payload);
    drop(guard);

    shared.push_wc(Wc {
        opcode: WcOpcode::Recv,
        status: WcStatus::Success,
        byte_len: n as u32,
    });
    shared.push_event(EventKind::RecvComplete);
}

fn service_read(registry: &Registry, addr: u64, rkey: u32, len: u32) -> Frame {
    let reg = lock(registry);
    match reg.get(&rkey) {
        Some(entry)
            if entry.access.allows(Access::REMOTE_READ)
                && entry.addr == addr
                && len as usize <= lock(&entry.buf).len() =>
        {
            let data = lock(&entry.buf)[..len as usize].to_vec();
            Frame::ReadResp { data }
        }
        _ => Frame::ReadNak,
    }
}

fn service_write(registry: &Registry, addr: u64, rkey: u32, len: u32, data: &[u8]) -> Frame {
    let reg = lock(registry);
    match reg.get(&rkey) {
        Some(entry)
            if entry.access.allows(Access::REMOTE_WRITE)
                && entry.addr == addr
                && data.len() == len as usize
                && len as usize <= lock(&entry.buf).len() =>
        {
            lock(&entry.buf)[..len as usize].copy_from_slice(data);
            Frame::WriteAck
        }
        _ => Frame::WriteNak,
    }
}

fn complete_read(shared: &ConnShared, data: &[u8]) {
    let Some(buf) = lock(&shared.pending_reads).pop_front() else {
        warn!("conn #{}: read response with no pending read", shared.id);
        return;
    };
    let mut guard = lock(&buf);
    let n = data.len().min(guard.len());
    guard[..n].copy_from_slice(&data[..n]);
    drop(guard);
    shared.push_wc(Wc {
        opcode: WcOpcode::RdmaRead,
        status: WcStatus::Success,
        byte_len: n as u32,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_describe() {
        let mut fabric = SoftFabric::new();
        let conn = fabric.resolve_addr("127.0.0.1", 1, Duration::from_millis(100)).unwrap();
        let mr = fabric
            .register_memory(conn, 64, Access::REMOTE_READ | Access::REMOTE_WRITE)
            .unwrap();

        let desc = fabric.descriptor(mr).unwrap();
        assert_eq!(desc.len, 64);

        fabric.write_local(mr, 4, &[7, 8, 9]).unwrap();
        let mut out = [0u8; 64];
        assert_eq!(fabric.read_local(mr, &mut out).unwrap(), 64);
        assert_eq!(&out[4..7], &[7, 8, 9]);

        assert!(matches!(
            fabric.write_local(mr, 62, &[0; 4]),
            Err(FabricError::OutOfBounds)
        ));

        fabric.deregister_memory(mr).unwrap();
        assert!(matches!(fabric.descriptor(mr), Err(FabricError::UnknownMr)));
    }

    #[test]
    fn one_sided_length_checked() {
        let mut fabric = SoftFabric::new();
        let conn = fabric.resolve_addr("127.0.0.1", 1, Duration::from_millis(100)).unwrap();
        let cq = fabric.create_cq(conn, 16).unwrap();
        let qp = fabric.create_qp(conn, cq, &QpCaps::default()).unwrap();
        let mr = fabric.register_memory(conn, 16, Access::LOCAL_WRITE).unwrap();

        let remote = BufferDescriptor::new(0x1000, 42, 32);
        assert!(matches!(
            fabric.post_read(qp, mr, &remote),
            Err(FabricError::LengthMismatch { local: 16, remote: 32 })
        ));
    }

    #[test]
    fn oversized_send_surfaces_receive_completion() {
        let (tx, rx) = channel();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let shared = ConnShared::new(7, tx, registry);
        lock(&shared.recv_queue)
            .push_back(Arc::new(Mutex::new(vec![0u8; 4].into_boxed_slice())));

        deliver_send(&shared, vec![1u8; 8]);

        // The receive completes in error, and the consumer is told about
        // it instead of waiting forever.
        let wc = lock(&shared.cq).pop_front().unwrap();
        assert_eq!(wc.opcode, WcOpcode::Recv);
        assert_eq!(wc.status, WcStatus::LocalLengthError);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.conn, ConnId(7));
        assert_eq!(event.kind, EventKind::RecvComplete);
    }

    #[test]
    fn remote_service_respects_access_and_bounds() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let buf: SharedBuf = Arc::new(Mutex::new(vec![5u8; 8].into_boxed_slice()));
        lock(&registry).insert(
            9,
            RemoteEntry { addr: 0x1000, access: Access::REMOTE_READ, buf },
        );

        assert_eq!(
            service_read(&registry, 0x1000, 9, 8),
            Frame::ReadResp { data: vec![5u8; 8] }
        );
        // Wrong rkey, wrong base address, out-of-bounds length.
        assert_eq!(service_read(&registry, 0x1000, 8, 8), Frame::ReadNak);
        assert_eq!(service_read(&registry, 0x2000, 9, 8), Frame::ReadNak);
        assert_eq!(service_read(&registry, 0x1000, 9, 9), Frame::ReadNak);
        // Region is not writable.
        assert_eq!(
            service_write(&registry, 0x1000, 9, 8, &[0u8; 8]),
            Frame::WriteNak
        );
    }
}
