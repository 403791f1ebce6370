//! Concurrent TCP relay: one accept task, one read worker per connection,
//! delivery strategy chosen at start time.
//!
//! Messages are best-effort text: one non-empty read (up to 4 KiB) is one
//! message. There is no framing protocol; concatenation or fragmentation
//! across reads is an accepted limitation of the wire format, not a bug.

pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use registry::{ConnectionId, ConnectionInfo, Registry};

/// One read call is one message.
const READ_BUFFER_SIZE: usize = 4096;

/// Pause after a transient accept error so a persistent fault cannot spin
/// the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What the relay does with each inbound message.
///
/// One closed set of strategies, selected when the server starts; not three
/// different servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RelayMode {
    /// Echo each message back to its sender.
    Echo,
    /// Rebroadcast each message to every other connection.
    #[default]
    Broadcast,
    /// Deliver only to the message hook and event channel.
    Forward,
}

/// Hook invoked with (sender, payload) on every inbound message, in every
/// mode. The persistence layer registers itself here.
pub type MessageHook = Arc<dyn Fn(ConnectionId, &[u8]) + Send + Sync>;

/// Relay configuration, fixed for the lifetime of one `start`..`stop` span.
#[derive(Clone, Default)]
pub struct RelayConfig {
    /// Delivery strategy.
    pub mode: RelayMode,
    /// Optional inbound message hook.
    pub on_message: Option<MessageHook>,
}

/// Lifecycle events published on the relay's broadcast channel.
///
/// This is the observer seam: subscribers (console output, persistence,
/// a GUI) consume these instead of the core calling into them.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Listener bound, accept loop running.
    Started { port: u16 },
    /// Server fully stopped, registry cleared.
    Stopped,
    /// A client connected and was registered.
    Connected { id: ConnectionId, remote_addr: SocketAddr },
    /// A client disconnected (peer close, error, or server stop).
    Disconnected { id: ConnectionId },
    /// A message arrived from a client.
    Message { id: ConnectionId, payload: Bytes },
    /// The accept loop hit a transient error and kept going.
    AcceptError { reason: String },
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct ServerState {
    phase: Phase,
    port: Option<u16>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

/// Status snapshot for external callers.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Is the server currently accepting connections?
    pub running: bool,
    /// Listen port while running.
    pub port: Option<u16>,
    /// Live connection count.
    pub connections: usize,
}

/// The relay server. One instance per listener; owned by the caller, no
/// process-wide state.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<Registry>,
    state: Mutex<ServerState>,
    events: broadcast::Sender<RelayEvent>,
}

impl RelayServer {
    /// Create a stopped server with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            registry: Arc::new(Registry::new()),
            state: Mutex::new(ServerState {
                phase: Phase::Stopped,
                port: None,
                shutdown_tx: None,
                accept_task: None,
            }),
            events,
        }
    }

    /// Subscribe to lifecycle and message events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Shared connection registry (send/broadcast entry point for any task).
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Bind the listener and launch the accept loop.
    ///
    /// Fails with [`RelayError::AlreadyRunning`] unless the server is
    /// stopped, and with [`RelayError::Bind`] if the port cannot be bound
    /// (state stays `Stopped` in that case).
    pub async fn start(&self, port: u16) -> RelayResult<()> {
        {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Stopped => state.phase = Phase::Starting,
                _ => {
                    return Err(RelayError::AlreadyRunning {
                        port: state.port.unwrap_or(port),
                    })
                }
            }
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.state.lock().phase = Phase::Stopped;
                return Err(RelayError::Bind { port, source });
            }
        };
        // Port 0 asks the OS for an ephemeral port; report the real one.
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Starting {
                // A concurrent stop() won the race while we were binding;
                // dropping the listener leaves everything stopped.
                return Err(RelayError::NotRunning);
            }
            let accept_task = tokio::spawn(accept_loop(
                listener,
                self.registry.clone(),
                self.config.clone(),
                self.events.clone(),
                shutdown_rx,
            ));
            state.phase = Phase::Running;
            state.port = Some(port);
            state.shutdown_tx = Some(shutdown_tx);
            state.accept_task = Some(accept_task);
        }

        info!("relay server listening on port {}", port);
        let _ = self.events.send(RelayEvent::Started { port });
        Ok(())
    }

    /// Stop the server: unblock the accept loop, close every connection,
    /// clear the registry. Idempotent; stopping a stopped server succeeds.
    pub async fn stop(&self) -> RelayResult<()> {
        let (shutdown_tx, accept_task) = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Running | Phase::Starting => {
                    state.phase = Phase::Stopping;
                    (state.shutdown_tx.take(), state.accept_task.take())
                }
                Phase::Stopped | Phase::Stopping => return Ok(()),
            }
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!("accept loop join failed: {}", e);
            }
        }

        // Workers exit through the shutdown signal; shutting the write
        // halves down here guarantees every peer observes EOF rather than
        // a hang, even if its worker already returned.
        for handle in self.registry.drain() {
            let mut writer = handle.writer.lock().await;
            let _ = writer.shutdown().await;
            let _ = self.events.send(RelayEvent::Disconnected { id: handle.id });
        }

        {
            let mut state = self.state.lock();
            state.phase = Phase::Stopped;
            state.port = None;
        }

        info!("relay server stopped");
        let _ = self.events.send(RelayEvent::Stopped);
        Ok(())
    }

    /// Current status, safe to call concurrently with start/stop.
    pub fn status(&self) -> ServerStatus {
        let state = self.state.lock();
        ServerStatus {
            running: state.phase == Phase::Running,
            port: state.port,
            connections: self.registry.len(),
        }
    }

    /// Live connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.connections()
    }

    /// Send to one connection from any task. `false` if the target is gone.
    pub async fn send_to(&self, id: ConnectionId, payload: &[u8]) -> bool {
        self.registry.send_to(id, payload).await
    }

    /// Broadcast to all connections from any task; returns deliveries.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        self.registry.broadcast(payload, None).await
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    config: RelayConfig,
    events: broadcast::Sender<RelayEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // Stop path: exit cleanly instead of surfacing the listener
            // teardown as an accept error.
            _ = shutdown_rx.changed() => {
                debug!("accept loop shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, remote_addr)) => {
                        let (read_half, write_half) = socket.into_split();
                        let id = registry.register(remote_addr, write_half);
                        info!("client {} connected from {}", id, remote_addr);
                        let _ = events.send(RelayEvent::Connected { id, remote_addr });
                        tokio::spawn(connection_worker(
                            id,
                            read_half,
                            registry.clone(),
                            config.clone(),
                            events.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        // Still running, so this is transient: log, pause,
                        // keep accepting.
                        warn!("accept error: {}", e);
                        let _ = events.send(RelayEvent::AcceptError {
                            reason: e.to_string(),
                        });
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
    // Listener drops here, releasing the port before `stop` returns.
}

async fn connection_worker(
    id: ConnectionId,
    mut read_half: OwnedReadHalf,
    registry: Arc<Registry>,
    config: RelayConfig,
    events: broadcast::Sender<RelayEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("client {} closed the connection", id);
                        break;
                    }
                    Ok(n) => {
                        deliver(id, &buf[..n], &registry, &config, &events).await;
                    }
                    Err(e) => {
                        warn!("client {} read error: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    // Exactly one cleanup regardless of which path ended the loop; the
    // stop path may have beaten us to it.
    if registry.unregister(id) {
        info!("client {} disconnected", id);
        let _ = events.send(RelayEvent::Disconnected { id });
    }
}

async fn deliver(
    id: ConnectionId,
    payload: &[u8],
    registry: &Registry,
    config: &RelayConfig,
    events: &broadcast::Sender<RelayEvent>,
) {
    if let Some(hook) = &config.on_message {
        hook(id, payload);
    }
    let _ = events.send(RelayEvent::Message {
        id,
        payload: Bytes::copy_from_slice(payload),
    });

    match config.mode {
        RelayMode::Echo => {
            registry.send_to(id, payload).await;
        }
        RelayMode::Broadcast => {
            registry.broadcast(payload, Some(id)).await;
        }
        RelayMode::Forward => {}
    }
}
