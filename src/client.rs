//! Multicast listener for OWL Intuition broadcasts.
//!
//! The hub multicasts one telemetry fragment per datagram to
//! `224.192.32.19:22600`. [`OwlClient`] owns the single UDP socket used to
//! receive them. The socket is opened by [`OwlClient::initialise_socket`]
//! and released by [`OwlClient::destroy_socket`], which may be called any
//! number of times.
//!
//! # Example
//!
//! ```no_run
//! use owlmon::client::{ClientConfig, OwlClient};
//! use std::time::Duration;
//!
//! # async fn example() -> owlmon::error::Result<()> {
//! let mut client = OwlClient::new(ClientConfig::default());
//! client.initialise_socket().await?;
//!
//! let datagram = client.recv_datagram(Duration::from_secs(30)).await?;
//! let telemetry = datagram.decode(&[0, 1, 2]);
//! println!("{:?}", telemetry.health);
//!
//! client.destroy_socket();
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::Stream;
use tokio::net::UdpSocket;

use crate::decoder;
use crate::error::{ClientError, DecodeError, Result};
use crate::sensor::{ChannelReading, DeviceHealth, Telemetry};

/// Multicast group the hub broadcasts to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 192, 32, 19);

/// UDP port the hub broadcasts to.
pub const MULTICAST_PORT: u16 = 22600;

/// Receive buffer size. Fragments are well under 1 KiB.
pub const MAX_DATAGRAM: usize = 4096;

/// Where and how to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Multicast group to join. `None` listens for unicast only.
    pub group: Option<Ipv4Addr>,
    /// Local port to bind.
    pub port: u16,
    /// Local address to bind.
    pub bind_address: Ipv4Addr,
    /// Interface used for the multicast membership.
    pub interface: Ipv4Addr,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            group: Some(MULTICAST_GROUP),
            port: MULTICAST_PORT,
            bind_address: Ipv4Addr::UNSPECIFIED,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender address.
    pub source: SocketAddr,
    /// Raw payload, not necessarily text.
    pub payload: Vec<u8>,
}

impl Datagram {
    /// The payload as text.
    pub fn text(&self) -> std::result::Result<&str, DecodeError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| DecodeError::malformed(format!("payload is not UTF-8: {e}")))
    }

    /// Decode device health and every channel in `channels`.
    ///
    /// Channels with no data still get an (unset) entry.
    pub fn decode(&self, channels: &[u32]) -> Telemetry {
        let text = match self.text() {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!(source = %self.source, error = %e, "Discarding datagram");
                None
            }
        };

        let health = match text {
            Some(text) => decoder::decode_health(Some(text)),
            None => DeviceHealth::default(),
        };

        let readings: BTreeMap<u32, ChannelReading> = channels
            .iter()
            .map(|&channel| {
                let reading = match text {
                    Some(text) => decoder::decode_channel(Some(text), channel),
                    None => ChannelReading::new(channel),
                };
                (channel, reading)
            })
            .collect();

        Telemetry {
            source: self.source,
            health,
            readings,
        }
    }
}

/// Listener owning the process's telemetry socket.
#[derive(Debug)]
pub struct OwlClient {
    config: ClientConfig,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl OwlClient {
    /// Create a listener. No socket is opened until
    /// [`initialise_socket`](Self::initialise_socket).
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            socket: None,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Local address of the open socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the socket and join the multicast group.
    ///
    /// Does nothing if the socket is already open.
    pub async fn initialise_socket(&mut self) -> Result<()> {
        if self.socket.is_some() {
            tracing::trace!("Socket already initialised");
            return Ok(());
        }

        let addr = SocketAddr::from((self.config.bind_address, self.config.port));
        tracing::debug!(addr = %addr, "Binding UDP socket");

        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "Failed to bind UDP socket");
            ClientError::Io(e)
        })?;

        if let Some(group) = self.config.group {
            socket
                .join_multicast_v4(group, self.config.interface)
                .map_err(|e| {
                    tracing::error!(
                        group = %group,
                        interface = %self.config.interface,
                        error = %e,
                        "Failed to join multicast group"
                    );
                    ClientError::Io(e)
                })?;
            tracing::info!(group = %group, port = self.config.port, "Joined multicast group");
        }

        self.socket = Some(socket);
        Ok(())
    }

    /// Leave the group and close the socket. Safe to call repeatedly.
    pub fn destroy_socket(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };

        if let Some(group) = self.config.group {
            if let Err(e) = socket.leave_multicast_v4(group, self.config.interface) {
                tracing::debug!(group = %group, error = %e, "Failed to leave multicast group");
            }
        }
        tracing::debug!("Socket destroyed");
    }

    /// Wait up to `timeout` for the next datagram.
    pub async fn recv_datagram(&mut self, timeout: Duration) -> Result<Datagram> {
        let socket = self.socket.as_ref().ok_or(ClientError::NotInitialised)?;

        match tokio::time::timeout(timeout, socket.recv_from(&mut self.buf)).await {
            Ok(Ok((n, source))) => {
                tracing::trace!(source = %source, bytes = n, "Received datagram");
                Ok(Datagram {
                    source,
                    payload: self.buf[..n].to_vec(),
                })
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to receive datagram");
                Err(ClientError::Io(e))
            }
            Err(_) => {
                tracing::trace!(timeout_ms = timeout.as_millis(), "Timeout waiting for datagram");
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Datagrams as an endless stream, each awaited with `timeout`.
    ///
    /// Errors are yielded, not terminal; the caller decides when to stop.
    pub fn datagrams(&mut self, timeout: Duration) -> impl Stream<Item = Result<Datagram>> + '_ {
        futures::stream::unfold(self, move |client| async move {
            let item = client.recv_datagram(timeout).await;
            Some((item, client))
        })
    }
}

impl Drop for OwlClient {
    fn drop(&mut self) {
        self.destroy_socket();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const FRAGMENT: &str = "<electricity id='4437190077C6'><timestamp>1520612469</timestamp>\
        <signal rssi='-65' lqi='98'/><battery level='100%'/>\
        <chan id='0'><curr units='w'>2431.00</curr><day units='wh'>5307.82</day></chan>\
        <chan id='1'><curr units='w'>0.00</curr><day units='wh'>0.00</day></chan></electricity>";

    fn loopback_config() -> ClientConfig {
        ClientConfig {
            group: None,
            port: 0,
            bind_address: Ipv4Addr::LOCALHOST,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.group, Some(Ipv4Addr::new(224, 192, 32, 19)));
        assert_eq!(config.port, 22600);
        assert_eq!(config.bind_address, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_destroy_socket_before_initialise() {
        let mut client = OwlClient::new(loopback_config());
        client.destroy_socket();
        assert!(!client.is_connected());
        assert_eq!(client.local_addr(), None);
    }

    #[tokio::test]
    async fn test_create_socket() {
        let mut client = OwlClient::new(loopback_config());
        client.initialise_socket().await.unwrap();
        assert!(client.is_connected());
        assert!(client.local_addr().is_some());
    }

    #[tokio::test]
    async fn test_initialise_twice_keeps_socket() {
        let mut client = OwlClient::new(loopback_config());
        client.initialise_socket().await.unwrap();
        let first = client.local_addr();
        client.initialise_socket().await.unwrap();
        assert_eq!(client.local_addr(), first);
    }

    #[tokio::test]
    async fn test_destroy_socket_is_idempotent() {
        let mut client = OwlClient::new(loopback_config());
        client.initialise_socket().await.unwrap();

        client.destroy_socket();
        assert!(!client.is_connected());
        client.destroy_socket();
        client.destroy_socket();
        assert!(!client.is_connected());
        assert_eq!(client.local_addr(), None);
    }

    #[tokio::test]
    async fn test_recv_before_initialise() {
        let mut client = OwlClient::new(loopback_config());
        let result = client.recv_datagram(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ClientError::NotInitialised)));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let mut client = OwlClient::new(loopback_config());
        client.initialise_socket().await.unwrap();

        let result = client.recv_datagram(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_recv_and_decode() {
        let mut client = OwlClient::new(loopback_config());
        client.initialise_socket().await.unwrap();
        let target = client.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(FRAGMENT.as_bytes(), target).await.unwrap();

        let datagram = client.recv_datagram(Duration::from_secs(2)).await.unwrap();
        assert_eq!(datagram.source, sender.local_addr().unwrap());
        assert_eq!(datagram.text().unwrap(), FRAGMENT);

        let telemetry = datagram.decode(&[0, 1, 2]);
        assert_eq!(telemetry.health.last_update, Some(1520612469));
        assert_eq!(telemetry.readings.len(), 3);
        assert_eq!(telemetry.readings[&0].current, Some(2431.0));
        assert_eq!(telemetry.readings[&1].total_current, Some(0.0));
        assert!(telemetry.readings[&2].is_empty());
    }

    #[tokio::test]
    async fn test_datagram_stream() {
        let mut client = OwlClient::new(loopback_config());
        client.initialise_socket().await.unwrap();
        let target = client.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"first", target).await.unwrap();
        sender.send_to(b"second", target).await.unwrap();

        let payloads: Vec<Vec<u8>> = client
            .datagrams(Duration::from_secs(2))
            .take(2)
            .map(|item| item.unwrap().payload)
            .collect()
            .await;
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_decode_binary_payload() {
        let datagram = Datagram {
            source: "192.168.1.20:22600".parse().unwrap(),
            payload: vec![0xff, 0x00, 0xfe],
        };
        assert!(matches!(datagram.text(), Err(DecodeError::Malformed { .. })));

        let telemetry = datagram.decode(&[0, 4]);
        assert!(telemetry.health.is_empty());
        assert_eq!(telemetry.readings[&4], ChannelReading::new(4));
        assert_eq!(telemetry.populated().count(), 0);
    }
}
