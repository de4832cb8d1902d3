//! Per-connection session state and the session store: one record per
//! TCP connection, plus a connection-id-keyed / client-id-keyed double
//! index so a trade report can be routed to its counterparty connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Connection identifier — the reactor's analogue of a file descriptor.
pub type ConnId = u64;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Per-TCP-connection record. Lifecycle: created on accept,
/// authenticated by a valid HELLO, reset on LOGOUT, destroyed on socket
/// close or heartbeat timeout.
pub struct Session {
    pub conn_id: ConnId,
    pub peer_addr: SocketAddr,
    pub recv_buf: Vec<u8>,
    pub hmac_key: [u8; 32],
    pub api_key: [u8; 16],
    pub client_id: u64,
    pub authenticated: bool,
    pub client_sqn: u32,
    pub server_sqn: u32,
    pub last_heartbeat: u64,
    exec_counter: u64,
}

impl Session {
    pub fn new(conn_id: ConnId, peer_addr: SocketAddr) -> Self {
        Session {
            conn_id,
            peer_addr,
            recv_buf: Vec::new(),
            hmac_key: [0u8; 32],
            api_key: [0u8; 16],
            client_id: 0,
            authenticated: false,
            client_sqn: 0,
            server_sqn: 0,
            last_heartbeat: now_secs(),
            exec_counter: 0,
        }
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = now_secs();
    }

    pub fn is_timed_out(&self, timeout_secs: u64) -> bool {
        now_secs().saturating_sub(self.last_heartbeat) > timeout_secs
    }

    pub fn next_server_sqn(&mut self) -> u32 {
        self.server_sqn += 1;
        self.server_sqn
    }

    /// Next trade id within this session's outbound stream, used for the
    /// `tradeID` field when this session is on one leg of a trade.
    pub fn next_exec_id(&mut self) -> u64 {
        self.exec_counter += 1;
        self.exec_counter
    }

    pub fn reset_auth(&mut self) {
        self.authenticated = false;
    }
}

/// Maps connection id -> Session (also indexed by client id for
/// counterparty lookup on trade fan-out). Single-threaded with the
/// reactor — cross-thread access is not permitted.
#[derive(Default)]
pub struct SessionStore {
    by_conn: HashMap<ConnId, Session>,
    client_to_conn: HashMap<u64, ConnId>,
    next_client_id: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore {
            by_conn: HashMap::new(),
            client_to_conn: HashMap::new(),
            next_client_id: 1,
        }
    }

    pub fn insert(&mut self, session: Session) {
        self.by_conn.insert(session.conn_id, session);
    }

    pub fn get(&self, conn_id: ConnId) -> Option<&Session> {
        self.by_conn.get(&conn_id)
    }

    pub fn get_mut(&mut self, conn_id: ConnId) -> Option<&mut Session> {
        self.by_conn.get_mut(&conn_id)
    }

    pub fn get_by_client_mut(&mut self, client_id: u64) -> Option<&mut Session> {
        let conn_id = *self.client_to_conn.get(&client_id)?;
        self.by_conn.get_mut(&conn_id)
    }

    /// Looks up which connection a given client id is bound to, without
    /// requiring mutable access. Used by the reactor to route a
    /// counterparty trade report to the right connection task.
    pub fn conn_id_for_client(&self, client_id: u64) -> Option<ConnId> {
        self.client_to_conn.get(&client_id).copied()
    }

    /// Allocates a fresh monotonically increasing client id and binds it
    /// to `conn_id`, used on a successful HELLO.
    pub fn assign_client_id(&mut self, conn_id: ConnId) -> u64 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        if let Some(session) = self.by_conn.get_mut(&conn_id) {
            session.client_id = id;
        }
        self.client_to_conn.insert(id, conn_id);
        id
    }

    /// Removes a session and erases both indices atomically.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<Session> {
        let session = self.by_conn.remove(&conn_id)?;
        if session.client_id != 0 {
            self.client_to_conn.remove(&session.client_id);
        }
        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_conn.values()
    }

    pub fn timed_out(&self, timeout_secs: u64) -> Vec<ConnId> {
        self.by_conn
            .values()
            .filter(|s| s.is_timed_out(timeout_secs))
            .map(|s| s.conn_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
    }

    #[test]
    fn assign_client_id_is_monotonic_and_indexed() {
        let mut store = SessionStore::new();
        store.insert(Session::new(1, addr()));
        store.insert(Session::new(2, addr()));

        let c1 = store.assign_client_id(1);
        let c2 = store.assign_client_id(2);
        assert_ne!(c1, c2);
        assert_eq!(store.get_by_client_mut(c1).unwrap().conn_id, 1);
        assert_eq!(store.get_by_client_mut(c2).unwrap().conn_id, 2);
    }

    #[test]
    fn remove_erases_both_indices() {
        let mut store = SessionStore::new();
        store.insert(Session::new(1, addr()));
        let client_id = store.assign_client_id(1);

        store.remove(1);
        assert!(store.get(1).is_none());
        assert!(store.get_by_client_mut(client_id).is_none());
    }

    #[test]
    fn heartbeat_timeout_detection() {
        let mut session = Session::new(1, addr());
        session.last_heartbeat = 0;
        assert!(session.is_timed_out(1));
        session.touch_heartbeat();
        assert!(!session.is_timed_out(3600));
    }
}
