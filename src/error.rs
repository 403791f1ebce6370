use std::io;
use thiserror::Error;

/// Errors produced by the gateway mapper.
///
/// Every variant is terminal for the `open_mapping` call that produced it;
/// callers may retry, the mapper never does.
#[derive(Debug, Error)]
pub enum MapError {
    /// The discovery probe itself failed (socket error, malformed responses).
    #[error("UPnP discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Discovery ran to completion but no gateway answered.
    #[error("no UPnP gateway found on the local network")]
    NoGatewayFound,

    /// A gateway answered but could not be addressed or introspected.
    #[error("failed to select UPnP gateway: {0}")]
    GatewaySelectionFailed(String),

    /// An existing mapping occupies the slot and could not be removed.
    #[error("existing mapping for port {external_port} could not be removed: {reason}")]
    MappingConflict { external_port: u16, reason: String },

    /// The gateway refused to install the new mapping.
    #[error("gateway rejected mapping for port {external_port}: {reason}")]
    MappingRejected { external_port: u16, reason: String },
}

/// Errors produced by the relay server control surface.
#[derive(Debug, Error)]
pub enum RelayError {
    /// `start` was called while the server was not stopped.
    #[error("relay server already running on port {port}")]
    AlreadyRunning { port: u16 },

    /// An operation required a running server.
    #[error("relay server is not running")]
    NotRunning,

    /// The listener could not be bound (port in use, permissions).
    #[error("failed to bind relay listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    /// Other I/O failures on the control path.
    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for mapper operations.
pub type MapResult<T> = Result<T, MapError>;

/// Result alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
