//! The connection state machine and its event-loop driver.
//!
//! The driver is the only consumer of the fabric's event stream. Every
//! event is handled to completion (builder, exchange, trigger and
//! teardown all run synchronously inside a transition) before the next
//! event is retrieved. Connections are keyed by their identifier, so a
//! server can interleave several peers on the single thread.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};

use super::resources::ResourceSet;
use super::{builder, exchange, transfer};
use crate::error::TransferError;
use crate::fabric::{ConnId, Event, EventKind, Fabric};
use crate::proto::{ConnParams, TransferMode};

/// Which end of the protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates resolution, connects, and issues the one-sided transfer.
    Client,
    /// Accepts requests and passively exposes its scratch buffer.
    Server,
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ResolvingAddr,
    ResolvingRoute,
    Connecting,
    Listening,
    ConnectRequested,
    Established,
    /// Terminal; residual events for a closed connection are ignored.
    Closed,
}

/// Per-invocation configuration, threaded explicitly through the builder
/// and the transfer trigger. There is no ambient mode flag.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub mode: TransferMode,
    /// Scratch buffer size; fixed for the lifetime of every connection.
    pub buffer_len: usize,
    /// Optional scratch pre-fill (the data a WRITE pushes or a READ
    /// serves).
    pub payload: Option<Vec<u8>>,
    /// Address and route resolution timeout.
    pub resolve_timeout: Duration,
    /// Bound on the completion poll after the one-sided post.
    pub completion_timeout: Duration,
}

impl TransferConfig {
    pub const DEFAULT_BUFFER_LEN: usize = 1024;

    pub fn new(mode: TransferMode) -> Self {
        TransferConfig {
            mode,
            buffer_len: Self::DEFAULT_BUFFER_LEN,
            payload: None,
            resolve_timeout: Duration::from_millis(500),
            completion_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    fn validate(&self) -> Result<(), TransferError> {
        if self.buffer_len == 0 {
            return Err(TransferError::EmptyBuffer);
        }
        if let Some(p) = &self.payload {
            if p.len() > self.buffer_len {
                return Err(TransferError::PayloadTooLarge {
                    payload: p.len(),
                    buffer: self.buffer_len,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Connection {
    state: State,
    resources: Option<ResourceSet>,
}

/// Signal of whether the event loop keeps running.
#[derive(Debug)]
enum Flow {
    Continue,
    /// A connection finished its whole lifecycle.
    Finished(ConnId),
}

/// Drives one process's end of the protocol over a [`Fabric`].
#[derive(Debug)]
pub struct Driver<F: Fabric> {
    fabric: F,
    role: Role,
    cfg: TransferConfig,
    conns: HashMap<ConnId, Connection>,
    local_port: u16,
    /// Snapshot of the served connection's scratch buffer, taken at
    /// teardown before deregistration.
    outcome: Option<Vec<u8>>,
}

impl<F: Fabric> Driver<F> {
    /// Create a client driver and start address resolution toward the
    /// server.
    pub fn client(
        mut fabric: F,
        cfg: TransferConfig,
        host: &str,
        port: u16,
    ) -> Result<Self, TransferError> {
        cfg.validate()?;
        let id = fabric.resolve_addr(host, port, cfg.resolve_timeout)?;
        let mut conns = HashMap::new();
        conns.insert(
            id,
            Connection {
                state: State::ResolvingAddr,
                resources: None,
            },
        );
        Ok(Driver {
            fabric,
            role: Role::Client,
            cfg,
            conns,
            local_port: port,
            outcome: None,
        })
    }

    /// Create a server driver: bind a wildcard address and listen.
    /// `port` 0 picks an ephemeral port.
    pub fn server(mut fabric: F, cfg: TransferConfig, port: u16) -> Result<Self, TransferError> {
        cfg.validate()?;
        let (id, bound) = fabric.listen(port)?;
        let mut conns = HashMap::new();
        conns.insert(
            id,
            Connection {
                state: State::Listening,
                resources: None,
            },
        );
        Ok(Driver {
            fabric,
            role: Role::Server,
            cfg,
            conns,
            local_port: bound,
            outcome: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The bound port (server) or the target port (client).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Run the event loop until one connection completes its lifecycle.
    ///
    /// Returns the final contents of that connection's scratch buffer:
    /// for a client READ these are the fetched bytes, for a server in
    /// write mode the bytes the client pushed.
    pub fn run(mut self) -> Result<Vec<u8>, TransferError> {
        loop {
            let event = self.fabric.next_event()?;
            match self.handle_event(event)? {
                Flow::Continue => {}
                Flow::Finished(id) => {
                    info!("connection {id:?} closed");
                    return Ok(self.outcome.take().unwrap_or_default());
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<Flow, TransferError> {
        debug!("event {:?} for connection {:?}", event.kind, event.conn);
        let id = event.conn;

        // A connect request introduces a fresh connection.
        if let EventKind::ConnectRequest { peer_mode } = event.kind {
            return self.on_connect_request(id, peer_mode);
        }

        let state = match self.conns.get(&id) {
            Some(conn) => conn.state,
            None => {
                debug!("event for unknown connection {id:?}, ignoring");
                return Ok(Flow::Continue);
            }
        };

        match (state, event.kind) {
            // The event source may deliver residual events after teardown.
            (State::Closed, kind) => {
                debug!("residual {kind:?} on closed connection {id:?}, ignoring");
                Ok(Flow::Continue)
            }

            (State::ResolvingAddr, EventKind::AddrResolved) => {
                info!("address resolved.");
                self.fabric.resolve_route(id, self.cfg.resolve_timeout)?;
                self.set_state(id, State::ResolvingRoute);
                Ok(Flow::Continue)
            }

            (State::ResolvingRoute, EventKind::RouteResolved) => {
                info!("route resolved.");
                self.fabric.connect(id, &ConnParams::new(self.cfg.mode))?;
                self.set_state(id, State::Connecting);
                Ok(Flow::Continue)
            }

            (State::Connecting, EventKind::Established) => {
                info!("connection established.");
                let res = builder::build(&mut self.fabric, id, &self.cfg)?;
                if let Err(e) = exchange::send_local_descriptor(&mut self.fabric, &res) {
                    // Nothing owns the set yet; release it before surfacing
                    // the failure.
                    res.release(&mut self.fabric);
                    return Err(e);
                }
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.resources = Some(res);
                    conn.state = State::Established;
                }
                Ok(Flow::Continue)
            }

            // Server side: resources were built when the request came in.
            (State::ConnectRequested, EventKind::Established) => {
                info!("connection established.");
                if let Some(res) = self.conns.get(&id).and_then(|c| c.resources.as_ref()) {
                    if let Err(e) = exchange::send_local_descriptor(&mut self.fabric, res) {
                        return self.conn_failed(id, e);
                    }
                }
                self.set_state(id, State::Established);
                Ok(Flow::Continue)
            }

            (State::Established, EventKind::RecvComplete) => self.on_peer_descriptor(id),

            (_, EventKind::Disconnected) => {
                info!("disconnected.");
                self.teardown(id);
                Ok(Flow::Finished(id))
            }

            (_, EventKind::AddrError) => self.conn_failed(id, TransferError::AddrResolution),
            (_, EventKind::RouteError) => self.conn_failed(id, TransferError::RouteResolution),
            (_, EventKind::ConnectError) => self.conn_failed(id, TransferError::Connect),
            (_, EventKind::Rejected) => self.conn_failed(id, TransferError::Rejected),

            (_, EventKind::DeviceRemoval) => Err(TransferError::DeviceRemoval),

            // No transition defined: protocol invariant violation.
            (state, kind) => Err(TransferError::UnexpectedEvent { state, event: kind }),
        }
    }

    /// Server-side connect request: check the peer's mode, build the
    /// resource set, and accept. Failures abort this connection only;
    /// the listener keeps serving.
    fn on_connect_request(
        &mut self,
        id: ConnId,
        peer_mode: TransferMode,
    ) -> Result<Flow, TransferError> {
        info!("received connection request.");
        if peer_mode != self.cfg.mode {
            warn!(
                "peer transfer mode `{peer_mode}` does not match local mode `{}`, rejecting",
                self.cfg.mode
            );
            if let Err(e) = self.fabric.reject(id) {
                debug!("reject failed: {e}");
            }
            let _ = self.fabric.destroy_id(id);
            return Ok(Flow::Continue);
        }

        let res = match builder::build(&mut self.fabric, id, &self.cfg) {
            Ok(res) => res,
            Err(e) => {
                warn!("connection {id:?} setup failed: {e}");
                if let Err(e) = self.fabric.reject(id) {
                    debug!("reject failed: {e}");
                }
                let _ = self.fabric.destroy_id(id);
                return Ok(Flow::Continue);
            }
        };

        if let Err(e) = self.fabric.accept(id, &ConnParams::new(self.cfg.mode)) {
            warn!("accept of connection {id:?} failed: {e}");
            res.release(&mut self.fabric);
            let _ = self.fabric.destroy_id(id);
            return Ok(Flow::Continue);
        }

        self.conns.insert(
            id,
            Connection {
                state: State::ConnectRequested,
                resources: Some(res),
            },
        );
        Ok(Flow::Continue)
    }

    /// The peer descriptor receive completed: the exchange is done on the
    /// inbound side. A client triggers the one-sided transfer and then
    /// initiates disconnect; a server stays passive and waits for the
    /// client's disconnect.
    fn on_peer_descriptor(&mut self, id: ConnId) -> Result<Flow, TransferError> {
        let Some(res) = self.conns.get_mut(&id).and_then(|c| c.resources.as_mut()) else {
            debug!("receive completion for connection {id:?} without resources, ignoring");
            return Ok(Flow::Continue);
        };
        if let Err(e) = exchange::absorb_peer_descriptor(&self.fabric, res) {
            return self.conn_failed(id, e);
        }

        match self.role {
            Role::Client => {
                let Some(res) = self.conns.get(&id).and_then(|c| c.resources.as_ref()) else {
                    return Ok(Flow::Continue);
                };
                let moved = transfer::execute(
                    &mut self.fabric,
                    res,
                    self.cfg.mode,
                    self.cfg.completion_timeout,
                )?;
                info!("one-sided {} of {moved} bytes complete", self.cfg.mode);
                self.fabric.disconnect(id)?;
            }
            Role::Server => {
                // Passive target; the client reads or writes our scratch
                // buffer and disconnects when it is done.
            }
        }
        Ok(Flow::Continue)
    }

    /// A connection-scoped failure. Fatal for a client (its only
    /// connection is gone); a server drops the connection and keeps
    /// listening.
    fn conn_failed(&mut self, id: ConnId, err: TransferError) -> Result<Flow, TransferError> {
        match self.role {
            Role::Client => Err(err),
            Role::Server => {
                warn!("connection {id:?} failed: {err}");
                self.teardown(id);
                Ok(Flow::Continue)
            }
        }
    }

    /// Release the connection's resources and free its identifier.
    /// Idempotent: a second call for the same connection is a no-op.
    fn teardown(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.state == State::Closed {
            return;
        }
        if let Some(res) = conn.resources.take() {
            // Snapshot the scratch contents before deregistration; this
            // is the caller-visible result of the transfer.
            let mut buf = vec![0u8; self.cfg.buffer_len];
            match self.fabric.read_local(res.scratch, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    self.outcome = Some(buf);
                }
                Err(e) => warn!("could not snapshot scratch buffer: {e}"),
            }
            res.release(&mut self.fabric);
        }
        if let Err(e) = self.fabric.destroy_id(id) {
            debug!("destroy_id for {id:?}: {e}");
        }
        conn.state = State::Closed;
        debug!("connection {id:?} torn down");
    }

    fn set_state(&mut self, id: ConnId, state: State) {
        if let Some(conn) = self.conns.get_mut(&id) {
            debug!("connection {id:?}: {:?} -> {state:?}", conn.state);
            conn.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::FabricError;
    use crate::fabric::soft::SoftFabric;
    use crate::fabric::{Access, CqHandle, MrHandle, QpCaps, QpHandle, Wc};
    use crate::proto::BufferDescriptor;

    fn resolving_client() -> (Driver<SoftFabric>, ConnId) {
        let cfg = TransferConfig::new(TransferMode::Read).with_buffer_len(16);
        let driver = Driver::client(SoftFabric::new(), cfg, "127.0.0.1", 1).unwrap();
        let id = *driver.conns.keys().next().unwrap();
        (driver, id)
    }

    #[test]
    fn teardown_is_idempotent() {
        let (mut driver, id) = resolving_client();
        driver.teardown(id);
        assert_eq!(driver.conns[&id].state, State::Closed);
        // Second teardown must be a no-op, not a double release.
        driver.teardown(id);
        assert_eq!(driver.conns[&id].state, State::Closed);
    }

    #[test]
    fn events_on_closed_connection_are_ignored() {
        let (mut driver, id) = resolving_client();
        driver.teardown(id);
        let flow = driver
            .handle_event(Event { conn: id, kind: EventKind::AddrResolved })
            .unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(driver.conns[&id].state, State::Closed);
    }

    #[test]
    fn unexpected_event_is_fatal() {
        let (mut driver, id) = resolving_client();
        let err = driver
            .handle_event(Event { conn: id, kind: EventKind::RecvComplete })
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnexpectedEvent {
                state: State::ResolvingAddr,
                event: EventKind::RecvComplete,
            }
        ));
    }

    /// Delegates to a soft fabric while counting resource releases.
    struct CountingFabric {
        inner: SoftFabric,
        released_mrs: Arc<AtomicUsize>,
        destroyed_qps: Arc<AtomicUsize>,
        destroyed_cqs: Arc<AtomicUsize>,
    }

    impl Fabric for CountingFabric {
        fn listen(&mut self, port: u16) -> Result<(ConnId, u16), FabricError> {
            self.inner.listen(port)
        }
        fn resolve_addr(
            &mut self,
            host: &str,
            port: u16,
            timeout: Duration,
        ) -> Result<ConnId, FabricError> {
            self.inner.resolve_addr(host, port, timeout)
        }
        fn resolve_route(&mut self, conn: ConnId, timeout: Duration) -> Result<(), FabricError> {
            self.inner.resolve_route(conn, timeout)
        }
        fn connect(&mut self, conn: ConnId, params: &ConnParams) -> Result<(), FabricError> {
            self.inner.connect(conn, params)
        }
        fn accept(&mut self, conn: ConnId, params: &ConnParams) -> Result<(), FabricError> {
            self.inner.accept(conn, params)
        }
        fn reject(&mut self, conn: ConnId) -> Result<(), FabricError> {
            self.inner.reject(conn)
        }
        fn disconnect(&mut self, conn: ConnId) -> Result<(), FabricError> {
            self.inner.disconnect(conn)
        }
        fn destroy_id(&mut self, conn: ConnId) -> Result<(), FabricError> {
            self.inner.destroy_id(conn)
        }
        fn create_cq(&mut self, conn: ConnId, depth: u32) -> Result<CqHandle, FabricError> {
            self.inner.create_cq(conn, depth)
        }
        fn create_qp(
            &mut self,
            conn: ConnId,
            cq: CqHandle,
            caps: &QpCaps,
        ) -> Result<QpHandle, FabricError> {
            self.inner.create_qp(conn, cq, caps)
        }
        fn register_memory(
            &mut self,
            conn: ConnId,
            len: usize,
            access: Access,
        ) -> Result<MrHandle, FabricError> {
            self.inner.register_memory(conn, len, access)
        }
        fn deregister_memory(&mut self, mr: MrHandle) -> Result<(), FabricError> {
            self.released_mrs.fetch_add(1, Ordering::SeqCst);
            self.inner.deregister_memory(mr)
        }
        fn destroy_qp(&mut self, qp: QpHandle) -> Result<(), FabricError> {
            self.destroyed_qps.fetch_add(1, Ordering::SeqCst);
            self.inner.destroy_qp(qp)
        }
        fn destroy_cq(&mut self, cq: CqHandle) -> Result<(), FabricError> {
            self.destroyed_cqs.fetch_add(1, Ordering::SeqCst);
            self.inner.destroy_cq(cq)
        }
        fn descriptor(&self, mr: MrHandle) -> Result<BufferDescriptor, FabricError> {
            self.inner.descriptor(mr)
        }
        fn write_local(
            &mut self,
            mr: MrHandle,
            offset: usize,
            data: &[u8],
        ) -> Result<(), FabricError> {
            self.inner.write_local(mr, offset, data)
        }
        fn read_local(&self, mr: MrHandle, out: &mut [u8]) -> Result<usize, FabricError> {
            self.inner.read_local(mr, out)
        }
        fn post_send(&mut self, qp: QpHandle, mr: MrHandle) -> Result<(), FabricError> {
            self.inner.post_send(qp, mr)
        }
        fn post_receive(&mut self, qp: QpHandle, mr: MrHandle) -> Result<(), FabricError> {
            self.inner.post_receive(qp, mr)
        }
        fn post_read(
            &mut self,
            qp: QpHandle,
            local: MrHandle,
            remote: &BufferDescriptor,
        ) -> Result<(), FabricError> {
            self.inner.post_read(qp, local, remote)
        }
        fn post_write(
            &mut self,
            qp: QpHandle,
            local: MrHandle,
            remote: &BufferDescriptor,
        ) -> Result<(), FabricError> {
            self.inner.post_write(qp, local, remote)
        }
        fn poll_cq(&mut self, cq: CqHandle) -> Result<Option<Wc>, FabricError> {
            self.inner.poll_cq(cq)
        }
        fn next_event(&mut self) -> Result<Event, FabricError> {
            self.inner.next_event()
        }
    }

    #[test]
    fn server_descriptor_send_failure_drops_connection_only() {
        let cfg = TransferConfig::new(TransferMode::Write).with_buffer_len(16);
        let mut driver = Driver::server(SoftFabric::new(), cfg, 0).unwrap();
        let id = ConnId(999);
        // An accepted connection whose handles the fabric does not know,
        // so the descriptor send is guaranteed to fail.
        driver.conns.insert(
            id,
            Connection {
                state: State::ConnectRequested,
                resources: Some(ResourceSet {
                    qp: QpHandle(0),
                    cq: CqHandle(0),
                    scratch: MrHandle(0),
                    local_desc: MrHandle(0),
                    peer_desc: MrHandle(0),
                    peer: None,
                }),
            },
        );

        let flow = driver
            .handle_event(Event { conn: id, kind: EventKind::Established })
            .unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(driver.conns[&id].state, State::Closed);
    }

    #[test]
    fn client_setup_send_failure_releases_resources() {
        let released_mrs = Arc::new(AtomicUsize::new(0));
        let destroyed_qps = Arc::new(AtomicUsize::new(0));
        let destroyed_cqs = Arc::new(AtomicUsize::new(0));
        let fabric = CountingFabric {
            inner: SoftFabric::new(),
            released_mrs: released_mrs.clone(),
            destroyed_qps: destroyed_qps.clone(),
            destroyed_cqs: destroyed_cqs.clone(),
        };

        let cfg = TransferConfig::new(TransferMode::Read).with_buffer_len(16);
        let mut driver = Driver::client(fabric, cfg, "127.0.0.1", 1).unwrap();
        let id = *driver.conns.keys().next().unwrap();
        driver.conns.get_mut(&id).unwrap().state = State::Connecting;

        // The connection was never actually established, so the resource
        // set builds fine but the descriptor send fails.
        let err = driver
            .handle_event(Event { conn: id, kind: EventKind::Established })
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Fabric(FabricError::NotConnected)
        ));
        assert_eq!(released_mrs.load(Ordering::SeqCst), 3);
        assert_eq!(destroyed_qps.load(Ordering::SeqCst), 1);
        assert_eq!(destroyed_cqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_validation() {
        let cfg = TransferConfig::new(TransferMode::Write)
            .with_buffer_len(4)
            .with_payload(vec![0; 8]);
        let err = Driver::client(SoftFabric::new(), cfg, "127.0.0.1", 1).unwrap_err();
        assert!(matches!(err, TransferError::PayloadTooLarge { payload: 8, buffer: 4 }));

        let cfg = TransferConfig::new(TransferMode::Write).with_buffer_len(0);
        let err = Driver::client(SoftFabric::new(), cfg, "127.0.0.1", 1).unwrap_err();
        assert!(matches!(err, TransferError::EmptyBuffer));
    }
}
