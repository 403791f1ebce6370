//! Reachability probe: an outbound connect attempt used only to verify,
//! never to establish, connectivity.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempt a TCP connect to `addr` within `wait`.
///
/// Returns `true` only if the handshake completed. A refused connection, an
/// unroutable address and an expired timeout all map to `false`; the caller
/// gets no distinction, this is a boolean diagnostic.
pub async fn is_reachable(addr: SocketAddr, wait: Duration) -> bool {
    match timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::debug!("reachability probe to {} failed: {}", addr, e);
            false
        }
        Err(_) => {
            tracing::debug!("reachability probe to {} timed out after {:?}", addr, wait);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_succeeds_against_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(is_reachable(addr, PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn probe_fails_against_closed_port_within_bound() {
        // Bind and drop to get a port that is very likely closed.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let start = Instant::now();
        let reachable = is_reachable(addr, PROBE_TIMEOUT).await;
        let elapsed = start.elapsed();

        assert!(!reachable);
        // Loopback refusal is immediate; in any case the timeout bounds it.
        assert!(elapsed < PROBE_TIMEOUT + Duration::from_millis(500));
    }
}
