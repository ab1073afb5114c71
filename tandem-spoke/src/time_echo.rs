//! UDP time echo.
//!
//! Answers every datagram with the device clock's current nanosecond
//! reading as ASCII decimal. The hub uses it as a low-latency alternative
//! to the `time_sync` command.

use std::sync::Arc;
use tandem_core::Clock;
use tokio::net::UdpSocket;

/// Serve time echo requests on `socket` until an I/O error occurs.
pub async fn run_time_echo(socket: UdpSocket, clock: Arc<dyn Clock>) -> std::io::Result<()> {
    if let Ok(addr) = socket.local_addr() {
        tracing::info!("Time echo listening on {}", addr);
    }
    let mut buf = [0u8; 512];
    loop {
        let (_, peer) = socket.recv_from(&mut buf).await?;
        let reply = clock.now_ns().to_string();
        if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
            tracing::debug!("Time echo reply to {} failed: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ManualClock;

    #[tokio::test]
    async fn replies_with_clock_reading() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let clock = Arc::new(ManualClock::new(1_234_567));
        tokio::spawn(run_time_echo(server, clock.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"t", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1234567");

        clock.advance(10);
        client.send_to(b"t", addr).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1234577");
    }
}
