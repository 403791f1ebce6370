//! Gateway mapper: negotiates an external-to-internal port mapping on the
//! local Internet Gateway Device so a listener inside the private network
//! becomes reachable from outside.
//!
//! Each call re-discovers the gateway; the mapper keeps no state between
//! calls and never retries. Concurrent requests for the same
//! (port, protocol) race at the gateway itself, so callers should serialize
//! those.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use igd::aio::{search_gateway, Gateway};
use igd::{RemovePortError, RequestError, SearchError, SearchOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{MapError, MapResult};
use crate::probe::{is_reachable, PROBE_TIMEOUT};

/// Default external and internal port for mapping requests.
pub const DEFAULT_MAPPING_PORT: u16 = 15001;

/// Bounded wait for the SSDP discovery probe.
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(200);

/// Gateways commonly reject longer descriptions (error 605).
const MAX_DESCRIPTION_LEN: usize = 64;

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP mapping.
    Tcp,
    /// UDP mapping.
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Error returned when parsing an unknown protocol name.
#[derive(Debug, Error)]
#[error("invalid protocol {0:?}, expected TCP or UDP")]
pub struct ParseProtocolError(String);

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            _ => Err(ParseProtocolError(s.to_string())),
        }
    }
}

impl From<Protocol> for igd::PortMappingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => igd::PortMappingProtocol::TCP,
            Protocol::Udp => igd::PortMappingProtocol::UDP,
        }
    }
}

/// A single port-mapping request, immutable once submitted.
///
/// Deserializes from the JSON shape an HTTP/CLI caller sends; every field
/// has a default so `{}` is a valid request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMappingRequest {
    /// Port opened on the gateway's external interface.
    #[serde(default = "default_mapping_port")]
    pub external_port: u16,
    /// Port the mapping routes to on this host.
    #[serde(default = "default_mapping_port")]
    pub internal_port: u16,
    /// Transport protocol to map.
    #[serde(default)]
    pub protocol: Protocol,
    /// Free-text label shown in the gateway's mapping table.
    #[serde(default = "default_description")]
    pub description: String,
}

impl Default for PortMappingRequest {
    fn default() -> Self {
        Self {
            external_port: DEFAULT_MAPPING_PORT,
            internal_port: DEFAULT_MAPPING_PORT,
            protocol: Protocol::default(),
            description: default_description(),
        }
    }
}

fn default_mapping_port() -> u16 {
    DEFAULT_MAPPING_PORT
}

fn default_description() -> String {
    "portbridge mapping".to_string()
}

/// Successful mapping result surfaced to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct MappingInfo {
    /// Externally visible port.
    pub external_port: u16,
    /// Internal port the mapping routes to.
    pub internal_port: u16,
    /// Mapped protocol.
    pub protocol: Protocol,
    /// LAN address of this host as seen by the gateway.
    pub lan_address: IpAddr,
    /// Externally visible address reported by the gateway.
    pub external_address: IpAddr,
    /// Advisory: did a TCP probe to (external_address, external_port)
    /// succeed? Double NAT makes this unreliable, so `false` does not mean
    /// the mapping failed.
    pub externally_reachable: bool,
}

/// Outcome of the reconcile step for an existing mapping.
#[derive(Debug, Clone)]
pub(crate) enum RemoveOutcome {
    /// An existing mapping was found and deleted.
    Removed,
    /// No mapping exists at that (port, protocol).
    NotFound,
    /// The gateway does not support querying/removing specific entries;
    /// tolerated and treated as "no existing mapping".
    Unsupported(String),
    /// An existing mapping could not be removed. Fatal.
    Failed(String),
}

/// Seam between the mapping algorithm and the concrete IGD session.
pub(crate) trait GatewayDevice {
    fn lan_address(&self) -> IpAddr;
    async fn external_address(&self) -> Result<IpAddr, String>;
    async fn remove_existing(&self, protocol: Protocol, external_port: u16) -> RemoveOutcome;
    async fn add_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
    ) -> Result<(), String>;
}

/// One discovered IGD session, scoped to a single mapping operation.
pub(crate) struct UpnpGateway {
    gateway: Gateway,
    lan_address: Ipv4Addr,
}

impl UpnpGateway {
    /// Discover a gateway and work out which local interface routes to it.
    pub(crate) async fn discover() -> MapResult<Self> {
        let options = SearchOptions {
            timeout: Some(DISCOVERY_TIMEOUT),
            ..Default::default()
        };

        let gateway = match search_gateway(options).await {
            Ok(gateway) => gateway,
            // igd 0.12 reports a search timeout as an IoError of kind
            // TimedOut (via its From<Elapsed> impl).
            Err(SearchError::IoError(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(MapError::NoGatewayFound)
            }
            Err(e) => return Err(MapError::DiscoveryFailed(e.to_string())),
        };
        info!("UPnP gateway found: {}", gateway.addr);

        let lan_address = local_ipv4_toward(gateway.addr)
            .await
            .map_err(MapError::GatewaySelectionFailed)?;

        Ok(Self {
            gateway,
            lan_address,
        })
    }
}

impl GatewayDevice for UpnpGateway {
    fn lan_address(&self) -> IpAddr {
        IpAddr::V4(self.lan_address)
    }

    async fn external_address(&self) -> Result<IpAddr, String> {
        self.gateway
            .get_external_ip()
            .await
            .map(IpAddr::V4)
            .map_err(|e| e.to_string())
    }

    async fn remove_existing(&self, protocol: Protocol, external_port: u16) -> RemoveOutcome {
        match self.gateway.remove_port(protocol.into(), external_port).await {
            Ok(()) => RemoveOutcome::Removed,
            Err(RemovePortError::NoSuchPortMapping) => RemoveOutcome::NotFound,
            // 401 InvalidAction / 602 OptionalActionNotImplemented: the
            // device cannot report or mutate specific entries at all.
            Err(RemovePortError::RequestError(RequestError::ErrorCode(code, desc)))
                if code == 401 || code == 602 =>
            {
                RemoveOutcome::Unsupported(format!("{}: {}", code, desc))
            }
            Err(e) => RemoveOutcome::Failed(e.to_string()),
        }
    }

    async fn add_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
    ) -> Result<(), String> {
        let target = SocketAddrV4::new(self.lan_address, internal_port);
        // Lease 0: permanent until explicitly deleted.
        self.gateway
            .add_port(protocol.into(), external_port, target, 0, description)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Make `req.internal_port` on this host reachable from outside the NAT.
///
/// Discovery, selection, reconcile and add each short-circuit with a
/// distinguishing [`MapError`]; the final reachability probe is advisory
/// only and never rolls the mapping back.
pub async fn open_mapping(req: &PortMappingRequest) -> MapResult<MappingInfo> {
    let gateway = UpnpGateway::discover().await?;
    let mut info = establish_mapping(&gateway, req).await?;

    let probe_addr = SocketAddr::new(info.external_address, info.external_port);
    info.externally_reachable = is_reachable(probe_addr, PROBE_TIMEOUT).await;
    if !info.externally_reachable {
        warn!(
            "mapping installed but probe to {} failed; possibly double NAT",
            probe_addr
        );
    }

    Ok(info)
}

/// Reconcile-then-add against an already selected gateway.
///
/// Returns `MappingInfo` with `externally_reachable` unset; the caller runs
/// the probe.
pub(crate) async fn establish_mapping<G: GatewayDevice>(
    gateway: &G,
    req: &PortMappingRequest,
) -> MapResult<MappingInfo> {
    let lan_address = gateway.lan_address();
    let external_address = gateway
        .external_address()
        .await
        .map_err(MapError::GatewaySelectionFailed)?;
    info!(
        "LAN address {}, external address {}",
        lan_address, external_address
    );

    // A stale mapping at the same slot would collide with the new one, so a
    // found-but-undeletable entry is fatal. A gateway that cannot answer the
    // query at all is tolerated.
    match gateway.remove_existing(req.protocol, req.external_port).await {
        RemoveOutcome::Removed => {
            info!(
                "removed existing mapping at {}/{}",
                req.external_port, req.protocol
            );
        }
        RemoveOutcome::NotFound => {
            debug!("no existing mapping at {}/{}", req.external_port, req.protocol);
        }
        RemoveOutcome::Unsupported(reason) => {
            warn!(
                "gateway cannot report existing mappings ({}), assuming none",
                reason
            );
        }
        RemoveOutcome::Failed(reason) => {
            return Err(MapError::MappingConflict {
                external_port: req.external_port,
                reason,
            });
        }
    }

    let description = clamp_description(&req.description);
    gateway
        .add_mapping(req.protocol, req.external_port, req.internal_port, description)
        .await
        .map_err(|reason| MapError::MappingRejected {
            external_port: req.external_port,
            reason,
        })?;
    info!(
        "mapping installed: {}/{} -> {}:{}",
        req.external_port, req.protocol, lan_address, req.internal_port
    );

    Ok(MappingInfo {
        external_port: req.external_port,
        internal_port: req.internal_port,
        protocol: req.protocol,
        lan_address,
        external_address,
        externally_reachable: false,
    })
}

/// A connected UDP socket reveals which interface routes toward the gateway
/// without sending a single packet.
async fn local_ipv4_toward(gateway: SocketAddrV4) -> Result<Ipv4Addr, String> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| e.to_string())?;
    socket.connect(gateway).await.map_err(|e| e.to_string())?;
    let local = socket.local_addr().map_err(|e| e.to_string())?;
    match local.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err("UPnP mapping requires an IPv4 LAN address".to_string()),
    }
}

fn clamp_description(description: &str) -> &str {
    if description.len() <= MAX_DESCRIPTION_LEN {
        return description;
    }
    let mut end = MAX_DESCRIPTION_LEN;
    while !description.is_char_boundary(end) {
        end -= 1;
    }
    debug!("truncating mapping description to {} bytes", end);
    &description[..end]
}
