/*!
UDP socket on the loopback interface that collects datagrams, standing in
for the head node's metric collector.
*/

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        log::info!("🧪 udp sink listening on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Next datagram, or `None` if nothing arrives within `limit`.
    pub async fn recv(&self, limit: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 65_536];
        match tokio::time::timeout(limit, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                buf.truncate(len);
                Some(buf)
            }
            _ => None,
        }
    }

    /// Collect datagrams until `count` arrived or one wait exceeds `limit`.
    pub async fn collect(&self, count: usize, limit: Duration) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match self.recv(limit).await {
                Some(d) => out.push(d),
                None => break,
            }
        }
        out
    }
}
