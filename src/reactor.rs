//! Single-threaded reactor / connection gateway.
//!
//! Built on a current-thread tokio runtime: every connection task and the
//! accept loop run cooperatively on one OS thread, so the session store,
//! engine, and protocol handler never need a lock. `TcpStream::readable()`/
//! `writable()` plus `try_read`/`try_write` give edge-triggered,
//! `EAGAIN`-style readiness without hand-rolling epoll.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::InitError;
use crate::protocol::{ApiKeyRegistry, Outbound, ProtocolHandler};
use crate::session::{ConnId, Session, SessionStore};
use crate::telemetry::{EventLog, TelemetryEvent};

/// Everything the protocol handler needs, shared (not sent) across the
/// connection tasks of a single current-thread runtime.
pub struct SharedState {
    pub sessions: SessionStore,
    pub engine: Engine,
    pub api_keys: ApiKeyRegistry,
    pub ring: crate::ring::Producer,
    pub events: EventLog,
    pub config: EngineConfig,
    conn_senders: HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>,
    next_conn_id: ConnId,
}

impl SharedState {
    pub fn new(
        engine: Engine,
        api_keys: ApiKeyRegistry,
        ring: crate::ring::Producer,
        events: EventLog,
        config: EngineConfig,
    ) -> Self {
        SharedState {
            sessions: SessionStore::new(),
            engine,
            api_keys,
            ring,
            events,
            config,
            conn_senders: HashMap::new(),
            next_conn_id: 1,
        }
    }

    fn alloc_conn_id(&mut self) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }
}

/// The reactor owns the listening socket and the shared engine/session
/// state. `run` never returns until `shutdown` is notified and every
/// connection has drained or the flush deadline elapses.
pub struct Reactor {
    listener: TcpListener,
    shared: Rc<RefCell<SharedState>>,
    shutdown: Rc<Notify>,
    heartbeat_timeout: Duration,
}

impl Reactor {
    pub async fn bind(
        bind_addr: SocketAddr,
        shared: Rc<RefCell<SharedState>>,
    ) -> Result<Self, InitError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| InitError::TcpBind { addr: bind_addr, source })?;
        let heartbeat_timeout = shared.borrow().config.heartbeat_timeout;
        Ok(Reactor {
            listener,
            shared,
            shutdown: Rc::new(Notify::new()),
            heartbeat_timeout,
        })
    }

    /// A clonable handle a caller can use to trigger graceful shutdown —
    /// the async analogue of writing a byte to a shutdown pipe.
    pub fn shutdown_handle(&self) -> Rc<Notify> {
        self.shutdown.clone()
    }

    /// The bound address, including the OS-assigned port when `bind` was
    /// called with port 0. Used by tests that need an ephemeral listener.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop, the heartbeat sweep, and every connection
    /// task until shutdown is signalled, then gives in-flight sends up to
    /// `flush_deadline` to drain before returning.
    ///
    /// Must be driven from inside a `tokio::task::LocalSet` (it spawns
    /// `!Send` connection tasks via `spawn_local`) — the caller owns the
    /// `LocalSet` so it can also `spawn_local` sibling tasks (e.g. the MD
    /// publisher) sharing the same `SharedState`.
    pub async fn run(self, flush_deadline: Duration) {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let heartbeat_timeout = self.heartbeat_timeout;
        let mut handles = Vec::new();

        let heartbeat_shared = shared.clone();
        let heartbeat_shutdown = shutdown.clone();
        handles.push(tokio::task::spawn_local(heartbeat_sweep(
            heartbeat_shared,
            heartbeat_shutdown,
            heartbeat_timeout,
        )));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(target: "reactor", %peer_addr, error = %e, "failed to set TCP_NODELAY");
                            }
                            let handle = spawn_connection(
                                stream,
                                peer_addr,
                                shared.clone(),
                                shutdown.clone(),
                                flush_deadline,
                            );
                            handles.push(handle);
                        }
                        Err(e) => {
                            warn!(target: "reactor", error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        info!(target: "reactor", "shutdown signalled, flushing connections");
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(flush_deadline, drain).await.is_err() {
            warn!(target: "reactor", "flush deadline exceeded, closing remaining connections");
        }
    }
}

/// Periodic (~1 Hz) sweep that disconnects sessions whose last heartbeat
/// exceeds `timeout`. Closing is modelled the same way a socket
/// error would be: the conn id's sender is dropped and the session is
/// removed, which the connection task observes on its next read/write
/// attempt and exits from.
async fn heartbeat_sweep(shared: Rc<RefCell<SharedState>>, shutdown: Rc<Notify>, timeout: Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => return,
            _ = interval.tick() => {
                let timed_out = {
                    let state = shared.borrow();
                    state.sessions.timed_out(timeout.as_secs())
                };
                for conn_id in timed_out {
                    warn!(target: "reactor", conn_id, "heartbeat timeout, closing session");
                    close_session(&shared, conn_id);
                }
            }
        }
    }
}

fn close_session(shared: &Rc<RefCell<SharedState>>, conn_id: ConnId) {
    let mut state = shared.borrow_mut();
    if state.config.cancel_on_disconnect {
        if let Some(session) = state.sessions.get(conn_id) {
            let client_id = session.client_id;
            if client_id != 0 {
                let updates = state.engine.cancel_all_for_client(client_id);
                for update in updates {
                    let _ = state.ring.try_push(update);
                }
            }
        }
    }
    if let Some(session) = state.sessions.remove(conn_id) {
        state.events.emit(TelemetryEvent::SessionClosed { client_id: session.client_id });
    }
    state.conn_senders.remove(&conn_id);
}

fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Rc<RefCell<SharedState>>,
    shutdown: Rc<Notify>,
    flush_deadline: Duration,
) -> tokio::task::JoinHandle<()> {
    let conn_id = shared.borrow_mut().alloc_conn_id();
    shared
        .borrow_mut()
        .sessions
        .insert(Session::new(conn_id, peer_addr));

    let (tx, rx) = mpsc::unbounded_channel();
    shared.borrow_mut().conn_senders.insert(conn_id, tx);

    info!(target: "reactor", conn_id, %peer_addr, "accepted connection");
    tokio::task::spawn_local(run_connection(conn_id, stream, shared, rx, shutdown, flush_deadline))
}

/// One connection's lifetime: read into the session's recv buffer until
/// `EAGAIN`, run the protocol handler over the complete frames found,
/// route the responses produced, then drain the send buffer.
/// Non-blocking writes append the unsent tail back to the buffer and keep
/// the task registered for writable readiness, handling the short-write
/// case.
async fn run_connection(
    conn_id: ConnId,
    stream: TcpStream,
    shared: Rc<RefCell<SharedState>>,
    mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: Rc<Notify>,
    flush_deadline: Duration,
) {
    let mut send_buf: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 8192];

    'conn: loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                flush_on_shutdown(&stream, &mut send_buf, flush_deadline).await;
                break 'conn;
            }

            routed = inbox.recv() => {
                match routed {
                    Some(bytes) => send_buf.extend_from_slice(&bytes),
                    None => break 'conn,
                }
            }

            readable = stream.readable() => {
                if readable.is_err() {
                    break 'conn;
                }
                loop {
                    match stream.try_read(&mut read_buf) {
                        Ok(0) => break 'conn,
                        Ok(n) => {
                            let mut state = shared.borrow_mut();
                            if let Some(session) = state.sessions.get_mut(conn_id) {
                                session.recv_buf.extend_from_slice(&read_buf[..n]);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(_) => break 'conn,
                    }
                }

                let outbound = {
                    let mut state = shared.borrow_mut();
                    let SharedState { engine, sessions, api_keys, ring, events, .. } = &mut *state;
                    let mut handler = ProtocolHandler {
                        engine,
                        sessions,
                        api_keys: &*api_keys,
                        ring: &*ring,
                        events: &*events,
                    };
                    handler.handle_bytes(conn_id)
                };
                route_outbound(&shared, conn_id, outbound, &mut send_buf);
            }

            writable = stream.writable(), if !send_buf.is_empty() => {
                if writable.is_err() {
                    break 'conn;
                }
                match stream.try_write(&send_buf) {
                    Ok(n) => { send_buf.drain(..n); }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => break 'conn,
                }
            }
        }
    }

    close_session(&shared, conn_id);
}

/// Gives a connection up to `flush_deadline` to write out whatever is
/// still queued in `send_buf` before the task exits on shutdown.
/// Bounded so one stalled peer can't hold up the reactor's own shutdown.
async fn flush_on_shutdown(stream: &TcpStream, send_buf: &mut Vec<u8>, flush_deadline: Duration) {
    let deadline = std::time::Instant::now() + flush_deadline;
    while !send_buf.is_empty() {
        let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) else {
            break;
        };
        match tokio::time::timeout(remaining, stream.writable()).await {
            Ok(Ok(())) => match stream.try_write(send_buf) {
                Ok(n) => {
                    send_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            },
            _ => break,
        }
    }
}

/// Splits the protocol handler's output between this connection's own
/// send buffer and the counterparty connections a trade report must
/// reach. A trade routed to a session whose task has
/// already exited is dropped best-effort — the engine state does not
/// roll back.
fn route_outbound(
    shared: &Rc<RefCell<SharedState>>,
    _origin_conn: ConnId,
    outbound: Vec<Outbound>,
    send_buf: &mut Vec<u8>,
) {
    for message in outbound {
        match message {
            Outbound::ToOriginator(bytes) => send_buf.extend_from_slice(&bytes),
            Outbound::ToClient { client_id, bytes } => {
                let state = shared.borrow();
                if let Some(target_conn) = state.sessions.conn_id_for_client(client_id) {
                    if let Some(sender) = state.conn_senders.get(&target_conn) {
                        let _ = sender.send(bytes);
                    }
                }
            }
        }
    }
}
