use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use tokio::net::UdpSocket;

use super::{DatagramSocket, Gathered, Transport, TransportError};
use crate::signal::MAX_CANDIDATES;

/// Documentation-range address used only to ask the OS which interface it
/// would route through. Nothing is ever sent to it.
const ROUTE_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Address to bind; `0.0.0.0` listens on every interface.
    pub bind_ip: IpAddr,
    /// Port to bind; `0` picks an ephemeral port per session.
    pub port: u16,
    /// Addresses to advertise instead of the detected primary address.
    pub advertise: Vec<IpAddr>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            advertise: Vec::new(),
        }
    }
}

/// Real UDP sockets on the local network.
#[derive(Clone, Debug, Default)]
pub struct UdpTransport {
    config: UdpConfig,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        Self { config }
    }

    fn candidate_ips(&self) -> Vec<IpAddr> {
        if !self.config.advertise.is_empty() {
            return self.config.advertise.clone();
        }
        if !self.config.bind_ip.is_unspecified() {
            return vec![self.config.bind_ip];
        }
        match primary_ip() {
            Some(ip) => vec![ip],
            None => {
                tracing::warn!("could not detect a LAN address, advertising loopback only");
                vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
            }
        }
    }
}

impl Transport for UdpTransport {
    type Socket = UdpSocket;

    async fn bind(&self) -> Result<Gathered<UdpSocket>, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.config.bind_ip, self.config.port)).await?;
        let port = socket.local_addr()?.port();

        let mut candidates: Vec<SocketAddr> = self
            .candidate_ips()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        candidates.dedup();
        candidates.truncate(MAX_CANDIDATES);
        if candidates.is_empty() {
            return Err(TransportError::NoCandidates);
        }

        tracing::debug!(?candidates, "udp socket bound");
        Ok(Gathered { socket, candidates })
    }
}

impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// The address of the interface carrying the default route, if any.
///
/// Connecting a UDP socket sends nothing but makes the kernel pick a source
/// address, which is the one peers on the same network can reach.
fn primary_ip() -> Option<IpAddr> {
    let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_PROBE).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
