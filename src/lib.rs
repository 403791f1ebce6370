//! portbridge
//!
//! UPnP port mapping plus a concurrent TCP message relay. The mapper makes
//! a local listener reachable from outside a NAT via the gateway's IGD
//! interface; the relay accepts any number of clients and echoes, forwards
//! or rebroadcasts their messages.

#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod mapper;
pub mod probe;
pub mod relay;

// Re-export main types
pub use client::RelayClient;
pub use error::{MapError, MapResult, RelayError, RelayResult};
pub use mapper::{open_mapping, MappingInfo, PortMappingRequest, Protocol, DEFAULT_MAPPING_PORT};
pub use probe::{is_reachable, PROBE_TIMEOUT};
pub use relay::registry::{ConnectionId, ConnectionInfo, Registry};
pub use relay::{MessageHook, RelayConfig, RelayEvent, RelayMode, RelayServer, ServerStatus};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the logging system.
///
/// # Arguments
/// * `level` - default log level (trace/debug/info/warn/error), overridden
///   by `RUST_LOG` when set
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        // Reduce verbosity of some dependencies
        .add_directive("igd=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(filter)
        .init();
}
