use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::MarstekError;

/// Largest reply we accept in one datagram
const RECV_BUFFER_SIZE: usize = 2048;

/// One request datagram out, one reply datagram back
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &[u8], host: &str, port: u16, timeout: Duration) -> Result<Vec<u8>, MarstekError>;
}

/// UDP transport, every exchange uses its own ephemeral socket
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        UdpTransport
    }

    async fn exchange(socket: &UdpSocket, frame: &[u8], host: &str, port: u16) -> Result<Vec<u8>, MarstekError> {
        socket.send_to(frame, (host, port)).await?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (size, from) = socket.recv_from(&mut buf).await?;
        debug!("Received {size} bytes from {from}");
        buf.truncate(size);
        Ok(buf)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, frame: &[u8], host: &str, port: u16, timeout: Duration) -> Result<Vec<u8>, MarstekError> {
        /* The socket lives in this scope only, it is closed on success, error and timeout */
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

        match tokio::time::timeout(timeout, Self::exchange(&socket, frame, host, port)).await {
            Ok(result) => result,
            Err(_) => Err(MarstekError::Timeout(timeout.as_millis() as u64)),
        }
    }
}
