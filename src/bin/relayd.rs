use anyhow::Result;
use clap::Parser;
use portbridge::{
    init_logging, open_mapping, PortMappingRequest, Protocol, RelayConfig, RelayEvent, RelayMode,
    RelayServer, DEFAULT_MAPPING_PORT,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "portbridge relay server", long_about = None)]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_MAPPING_PORT)]
    port: u16,

    /// Message delivery mode
    #[arg(short, long, value_enum, default_value_t = RelayMode::Broadcast)]
    mode: RelayMode,

    /// Open a UPnP mapping for the listen port before starting
    #[arg(long)]
    map: bool,

    /// External port for the UPnP mapping (defaults to the listen port)
    #[arg(long)]
    external_port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.map {
        let req = PortMappingRequest {
            external_port: args.external_port.unwrap_or(args.port),
            internal_port: args.port,
            protocol: Protocol::Tcp,
            description: "portbridge relay".to_string(),
        };
        match open_mapping(&req).await {
            Ok(info) => println!(
                "mapping open: {}:{} -> {}:{} (probe reachable: {})",
                info.external_address,
                info.external_port,
                info.lan_address,
                info.internal_port,
                info.externally_reachable
            ),
            // The relay is still usable inside the LAN without a mapping.
            Err(e) => eprintln!("UPnP mapping failed: {}", e),
        }
    }

    let server = RelayServer::new(RelayConfig {
        mode: args.mode,
        on_message: None,
    });

    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RelayEvent::Connected { id, remote_addr }) => {
                    println!("[{}] connected from {}", id, remote_addr);
                }
                Ok(RelayEvent::Disconnected { id }) => {
                    println!("[{}] disconnected", id);
                }
                Ok(RelayEvent::Message { id, payload }) => {
                    println!("[{}] {}", id, String::from_utf8_lossy(&payload));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("console output lagging, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    server.start(args.port).await?;
    println!(
        "relay listening on port {} in {:?} mode, ctrl-c to stop",
        args.port, args.mode
    );

    tokio::signal::ctrl_c().await?;
    server.stop().await?;
    Ok(())
}
