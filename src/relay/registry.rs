//! Concurrency-safe registry of live client connections.
//!
//! The accept loop inserts, each worker removes itself on close, and any
//! task may broadcast. Broadcasts operate on a snapshot so the registry
//! lock is never held across a socket write.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, warn};

/// Opaque identifier of one live connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry-side handle to a connection.
///
/// The worker owns the read half exclusively; the write half lives here
/// behind an async mutex so broadcasts from any task stay serialized per
/// target.
#[derive(Clone)]
pub struct ClientHandle {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer address as reported at accept time.
    pub remote_addr: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    pub(crate) writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

/// Serializable view of a connection for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// Accept timestamp.
    pub connected_at: DateTime<Utc>,
}

/// Shared set of active connections.
#[derive(Default)]
pub struct Registry {
    clients: RwLock<HashMap<ConnectionId, ClientHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly accepted connection and allocate its id.
    pub fn register(&self, remote_addr: SocketAddr, writer: OwnedWriteHalf) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ClientHandle {
            id,
            remote_addr,
            connected_at: Utc::now(),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        };
        self.clients.write().insert(id, handle);
        id
    }

    /// Remove a connection. Idempotent: returns whether an entry was
    /// actually removed, so a worker's own cleanup and a forced shutdown
    /// can race without either treating the loss as an error.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.clients.write().remove(&id).is_some()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Point-in-time copy of all handles, ordered by id.
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        let mut handles: Vec<ClientHandle> = self.clients.read().values().cloned().collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    /// Serializable view of all connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.snapshot()
            .into_iter()
            .map(|h| ConnectionInfo {
                id: h.id,
                remote_addr: h.remote_addr,
                connected_at: h.connected_at,
            })
            .collect()
    }

    /// Remove and return every handle. Used by the stop path.
    pub fn drain(&self) -> Vec<ClientHandle> {
        self.clients.write().drain().map(|(_, h)| h).collect()
    }

    /// Write `payload` to one connection.
    ///
    /// Returns `false` if the id is unknown or the write failed; a failed
    /// write also unregisters the connection.
    pub async fn send_to(&self, id: ConnectionId, payload: &[u8]) -> bool {
        let handle = match self.clients.read().get(&id) {
            Some(handle) => handle.clone(),
            None => return false,
        };
        self.write_to(&handle, payload).await
    }

    /// Write `payload` to every connection except `exclude`.
    ///
    /// A per-target failure removes that target and never blocks delivery
    /// to the rest. Returns the number of successful deliveries.
    pub async fn broadcast(&self, payload: &[u8], exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for handle in self.snapshot() {
            if Some(handle.id) == exclude {
                continue;
            }
            if self.write_to(&handle, payload).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn write_to(&self, handle: &ClientHandle, payload: &[u8]) -> bool {
        let mut writer = handle.writer.lock().await;
        match writer.write_all(payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("write to {} ({}) failed: {}", handle.id, handle.remote_addr, e);
                drop(writer);
                if self.unregister(handle.id) {
                    debug!("removed {} after failed write", handle.id);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    /// Accept-side write half plus the client-side stream to read from.
    async fn socket_pair(listener: &TcpListener) -> (OwnedWriteHalf, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        (write, client)
    }

    #[tokio::test]
    async fn register_unregister_and_snapshot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new();

        let (w1, _c1) = socket_pair(&listener).await;
        let (w2, _c2) = socket_pair(&listener).await;
        let addr = listener.local_addr().unwrap();

        let a = registry.register(addr, w1);
        let b = registry.register(addr, w2);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        let ids: Vec<ConnectionId> = registry.snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![a, b]);

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a), "second removal must be a no-op");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_register_unregister_settles_exactly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::new());

        const KEEP: usize = 8;
        const CHURN: usize = 24;

        let mut ids = Vec::new();
        for _ in 0..(KEEP + CHURN) {
            let (writer, _client) = socket_pair(&listener).await;
            ids.push(registry.register(addr, writer));
        }

        // Remove the churn set from many tasks at once, twice each: the
        // second attempt must be an effective no-op.
        let mut tasks = Vec::new();
        for id in ids[KEEP..].to_vec() {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.unregister(id);
                registry.unregister(id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), KEEP);
        let snapshot = registry.snapshot();
        let unique: HashSet<ConnectionId> = snapshot.iter().map(|h| h.id).collect();
        assert_eq!(unique.len(), snapshot.len(), "snapshot must not repeat ids");
        for id in &ids[KEEP..] {
            assert!(!unique.contains(id), "removed id visible in snapshot");
        }
    }

    #[tokio::test]
    async fn broadcast_survives_one_dead_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Registry::new();

        let (w1, mut c1) = socket_pair(&listener).await;
        let (mut w2, _c2) = socket_pair(&listener).await;
        let (w3, mut c3) = socket_pair(&listener).await;

        // Shut down the second write half before registering it, so writes
        // to it fail deterministically.
        w2.shutdown().await.unwrap();

        registry.register(addr, w1);
        let dead = registry.register(addr, w2);
        registry.register(addr, w3);

        let delivered = registry.broadcast(b"hello", None).await;
        assert_eq!(delivered, 2);
        assert_eq!(registry.len(), 2, "exactly the dead target is removed");
        assert!(!registry.snapshot().iter().any(|h| h.id == dead));

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), c1.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = timeout(Duration::from_secs(1), c3.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn send_to_unknown_id_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Registry::new();

        let (writer, mut client) = socket_pair(&listener).await;
        let id = registry.register(addr, writer);
        registry.unregister(id);

        assert!(!registry.send_to(id, b"gone").await);

        // The peer sees EOF once the handle is dropped, never the payload.
        drop(registry);
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
