use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use portbridge::{
    init_logging, is_reachable, open_mapping, PortMappingRequest, Protocol, DEFAULT_MAPPING_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "UPnP port mapping tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open (or replace) a mapping on the local gateway
    Open {
        /// External port on the gateway
        #[arg(long, default_value_t = DEFAULT_MAPPING_PORT)]
        external_port: u16,

        /// Internal port on this host
        #[arg(long, default_value_t = DEFAULT_MAPPING_PORT)]
        internal_port: u16,

        /// TCP or UDP
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,

        /// Mapping description shown in the gateway's table
        #[arg(long, default_value = "portbridge mapping")]
        description: String,
    },
    /// Probe whether host:port accepts TCP connections
    Check {
        /// Host to probe
        host: IpAddr,

        /// Port to probe
        port: u16,

        /// Probe timeout in seconds
        #[arg(long, default_value_t = 2)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Command::Open {
            external_port,
            internal_port,
            protocol,
            description,
        } => {
            let req = PortMappingRequest {
                external_port,
                internal_port,
                protocol,
                description,
            };
            match open_mapping(&req).await {
                Ok(info) => {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                Err(e) => {
                    eprintln!("mapping failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Check {
            host,
            port,
            timeout,
        } => {
            let addr = SocketAddr::new(host, port);
            let reachable = is_reachable(addr, Duration::from_secs(timeout)).await;
            println!("{} is {}", addr, if reachable { "reachable" } else { "unreachable" });
            if !reachable {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
