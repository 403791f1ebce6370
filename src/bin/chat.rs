use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use portbridge::{init_logging, RelayClient};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "portbridge chat client", long_about = None)]
struct Args {
    /// Relay address, e.g. 203.0.113.7:15001
    server: SocketAddr,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let client = RelayClient::connect(args.server).await?;
    println!("connected to {} (type messages, ctrl-d to quit)", args.server);

    let (mut read_half, mut write_half) = client.into_stream().into_split();

    let printer = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    println!("server closed the connection");
                    break;
                }
                Ok(n) => println!("{}", String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    eprintln!("read error: {}", e);
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        write_half.write_all(line.as_bytes()).await?;
    }

    // EOF on stdin: half-close so the server sees a clean disconnect.
    write_half.shutdown().await?;
    drop(write_half);
    let _ = printer.await;
    Ok(())
}
