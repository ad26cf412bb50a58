//! UDP sender towards the head node's metric collector.
//!
//! Best effort: no acknowledgement, no resend. A socket error closes the
//! socket and opens a fresh one for the next batch. The collector name is
//! resolved when a socket is opened, not per batch.

use super::packet::{self, PacketError};
use crate::models::Umid;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("cannot resolve collector {host}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("udp socket failure")]
    Socket(#[source] io::Error),
}

struct Connection {
    socket: UdpSocket,
    collector: SocketAddr,
}

pub struct CounterTransport {
    host: String,
    port: u16,
    connection: Mutex<Option<Connection>>,
    reconnects: AtomicU32,
}

impl CounterTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connection: Mutex::new(None),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// IPv4 first, IPv6 when no IPv4 socket can be had.
    async fn open() -> io::Result<UdpSocket> {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => Ok(socket),
            Err(e) => {
                info!(error = %e, "no IPv4 udp socket, trying IPv6");
                UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await
            }
        }
    }

    async fn resolve(&self, prefer_v4: bool) -> Result<SocketAddr, TransportError> {
        let resolve_err = |source: io::Error| TransportError::Resolve { host: self.host.clone(), source };
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(resolve_err)?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4() == prefer_v4)
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| resolve_err(io::Error::new(io::ErrorKind::NotFound, "no address")))
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let socket = Self::open().await.map_err(TransportError::Socket)?;
        let prefer_v4 = socket.local_addr().map(|a| a.is_ipv4()).unwrap_or(true);
        let collector = self.resolve(prefer_v4).await?;
        debug!(%collector, "udp socket opened");
        Ok(Connection { socket, collector })
    }

    /// Sends the batch in chunks of at most 80 counters, one datagram each.
    /// Returns the number of datagrams sent.
    pub async fn send_samples(
        &self,
        node_id: Uuid,
        umids: &[Umid],
        values: &[f32],
        tick_count: i32,
    ) -> Result<usize, TransportError> {
        let packets = packet::chunk(node_id, umids, values, tick_count)?;
        if packets.is_empty() {
            return Ok(0);
        }
        let encoded = packets
            .iter()
            .map(|p| p.encode())
            .collect::<Result<Vec<_>, _>>()?;

        let mut slot = self.connection.lock().await;
        let connection = match slot.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };

        let mut failure = None;
        for (sent, datagram) in encoded.iter().enumerate() {
            trace!(%node_id, size = datagram.len(), "sending counter packet");
            if let Err(e) = connection.socket.send_to(datagram, connection.collector).await {
                error!(collector = %connection.collector, error = %e, sent, "failed to send counter data, reconnecting");
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => {
                *slot = Some(connection);
                Ok(encoded.len())
            }
            Some(e) => {
                drop(connection);
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                match self.connect().await {
                    Ok(fresh) => *slot = Some(fresh),
                    Err(reopen_err) => error!(error = %reopen_err, "udp reconnect failed"),
                }
                Err(TransportError::Socket(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::packet::{CounterWirePacket, MAX_PACKET_SIZE};
    use hpcbridge_devkit::UdpSink;
    use std::time::Duration;

    fn batch(n: usize) -> (Vec<Umid>, Vec<f32>) {
        (
            (0..n).map(|i| Umid { metric_id: i as u16, instance_id: 0 }).collect(),
            (0..n).map(|i| i as f32).collect(),
        )
    }

    #[tokio::test]
    async fn batch_is_split_into_datagrams() {
        let sink = UdpSink::bind().await.unwrap();
        let transport = CounterTransport::new("127.0.0.1", sink.port());
        let node_id = Uuid::new_v4();
        let (umids, values) = batch(215);

        let sent = transport.send_samples(node_id, &umids, &values, 77).await.unwrap();
        assert_eq!(sent, 3);

        let datagrams = sink.collect(3, Duration::from_secs(2)).await;
        assert_eq!(datagrams.len(), 3);
        let counts: Vec<usize> = datagrams
            .iter()
            .map(|d| {
                assert_eq!(d.len(), MAX_PACKET_SIZE);
                let p = CounterWirePacket::decode(d).unwrap();
                assert_eq!(p.node_id, node_id);
                assert_eq!(p.tick_count, 77);
                p.umids.len()
            })
            .collect();
        assert_eq!(counts, vec![80, 80, 55]);
    }

    #[tokio::test]
    async fn mismatched_batch_sends_nothing() {
        let sink = UdpSink::bind().await.unwrap();
        let transport = CounterTransport::new("127.0.0.1", sink.port());
        let (umids, values) = batch(4);

        let err = transport.send_samples(Uuid::nil(), &umids, &values[..3], 0).await.unwrap_err();
        assert!(matches!(err, TransportError::Packet(PacketError::LengthMismatch { .. })));
        assert!(sink.recv(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn socket_error_reopens_the_socket() {
        // An IPv4 socket cannot send to an IPv6-only target.
        let transport = CounterTransport::new("::1", 9894);
        let (umids, values) = batch(1);

        let err = transport.send_samples(Uuid::nil(), &umids, &values, 0).await.unwrap_err();
        assert!(matches!(err, TransportError::Socket(_)));
        assert_eq!(transport.reconnects(), 1);
        assert!(transport.connection.lock().await.is_some());
    }

    #[tokio::test]
    async fn collector_is_resolved_once_per_socket() {
        let sink = UdpSink::bind().await.unwrap();
        let mut transport = CounterTransport::new("127.0.0.1", sink.port());
        let (umids, values) = batch(1);

        transport.send_samples(Uuid::nil(), &umids, &values, 0).await.unwrap();
        let collector = transport.connection.lock().await.as_ref().map(|c| c.collector);
        assert_eq!(collector.map(|a| a.port()), Some(sink.port()));

        // Later batches reuse the cached address.
        transport.host = "collector.invalid".into();
        transport.send_samples(Uuid::nil(), &umids, &values, 1).await.unwrap();
        assert_eq!(transport.connection.lock().await.as_ref().map(|c| c.collector), collector);
        assert_eq!(sink.collect(2, Duration::from_secs(2)).await.len(), 2);
    }

    #[tokio::test]
    async fn unresolvable_collector_is_reported() {
        let transport = CounterTransport::new("collector.invalid", 9894);
        let (umids, values) = batch(1);
        let err = transport.send_samples(Uuid::nil(), &umids, &values, 0).await.unwrap_err();
        assert!(matches!(err, TransportError::Resolve { .. }));
        assert_eq!(transport.reconnects(), 0);
        assert!(transport.connection.lock().await.is_none());
    }
}
