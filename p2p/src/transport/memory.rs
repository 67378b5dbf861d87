use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{DatagramSocket, Gathered, Transport, TransportError};

const FIRST_PORT: u16 = 40_000;

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct NetworkState {
    sockets: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    partitions: HashSet<(IpAddr, IpAddr)>,
    offline: HashSet<IpAddr>,
    next_port: u16,
}

impl NetworkState {
    fn is_partitioned(&self, a: IpAddr, b: IpAddr) -> bool {
        self.partitions.contains(&(a, b)) || self.partitions.contains(&(b, a))
    }
}

/// An in-process datagram network.
///
/// Every host on it is just an IP address. Delivery is instant and lossless
/// unless two hosts have been partitioned, in which case datagrams between
/// them vanish silently.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that binds sockets on host `ip`.
    pub fn transport(&self, ip: impl Into<IpAddr>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            ip: ip.into(),
        }
    }

    /// Drop all traffic between `a` and `b` from now on.
    pub fn partition(&self, a: impl Into<IpAddr>, b: impl Into<IpAddr>) {
        let (a, b) = (a.into(), b.into());
        tracing::debug!(%a, %b, "memory network partitioned");
        self.lock().partitions.insert((a, b));
    }

    /// Undo every partition.
    pub fn heal(&self) {
        self.lock().partitions.clear();
    }

    /// Take host `ip` down or bring it back. Binding on a host that is down
    /// fails; sockets already bound keep working.
    pub fn set_offline(&self, ip: impl Into<IpAddr>, offline: bool) {
        let ip = ip.into();
        let mut state = self.lock();
        if offline {
            state.offline.insert(ip);
        } else {
            state.offline.remove(&ip);
        }
    }

    /// Number of sockets currently bound.
    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, ip: IpAddr) -> io::Result<MemorySocket> {
        let mut state = self.lock();
        if state.offline.contains(&ip) {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("host {ip} is offline"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if state.next_port == 0 {
            state.next_port = FIRST_PORT;
        }
        let mut port = state.next_port;
        while state.sockets.contains_key(&SocketAddr::new(ip, port)) {
            port = port.wrapping_add(1).max(FIRST_PORT);
        }
        state.next_port = port.wrapping_add(1).max(FIRST_PORT);

        let local = SocketAddr::new(ip, port);
        state.sockets.insert(local, tx);
        Ok(MemorySocket {
            local,
            network: self.clone(),
            inbox: AsyncMutex::new(rx),
        })
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        let state = self.lock();
        if state.is_partitioned(from.ip(), to.ip()) {
            return;
        }
        if let Some(tx) = state.sockets.get(&to) {
            let _ = tx.send((datagram.to_vec(), from));
        }
    }
}

/// Binds [`MemorySocket`]s on one host of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    ip: IpAddr,
}

impl MemoryTransport {
    /// A standalone network with a single loopback host.
    pub fn loopback() -> Self {
        MemoryNetwork::new().transport(Ipv4Addr::LOCALHOST)
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    type Socket = MemorySocket;

    async fn bind(&self) -> Result<Gathered<MemorySocket>, TransportError> {
        let socket = self.network.bind(self.ip)?;
        let candidates = vec![socket.local_addr()];
        Ok(Gathered { socket, candidates })
    }
}

/// A socket on a [`MemoryNetwork`]. Unbinds itself when dropped.
pub struct MemorySocket {
    local: SocketAddr,
    network: MemoryNetwork,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemorySocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl DatagramSocket for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.network.deliver(self.local, target, buf);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => std::future::pending().await,
        }
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.lock().sockets.remove(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 43, 1);
    const JOINER: Ipv4Addr = Ipv4Addr::new(192, 168, 43, 20);

    #[tokio::test]
    async fn delivers_between_hosts() {
        let network = MemoryNetwork::new();
        let a = network.transport(HOST).bind().await.unwrap();
        let b = network.transport(JOINER).bind().await.unwrap();
        assert_eq!(a.candidates, vec![a.socket.local_addr()]);

        a.socket.send_to(b"ping", b.socket.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = b.socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.socket.local_addr());
    }

    #[tokio::test]
    async fn ports_are_unique_per_host() {
        let network = MemoryNetwork::new();
        let transport = network.transport(HOST);
        let a = transport.bind().await.unwrap();
        let b = transport.bind().await.unwrap();
        assert_ne!(a.socket.local_addr(), b.socket.local_addr());
        assert_eq!(network.socket_count(), 2);
    }

    #[tokio::test]
    async fn dropped_socket_unbinds() {
        let network = MemoryNetwork::new();
        let gathered = network.transport(HOST).bind().await.unwrap();
        assert_eq!(network.socket_count(), 1);
        drop(gathered);
        assert_eq!(network.socket_count(), 0);
    }

    #[tokio::test]
    async fn partition_drops_traffic() {
        let network = MemoryNetwork::new();
        let a = network.transport(HOST).bind().await.unwrap();
        let b = network.transport(JOINER).bind().await.unwrap();
        network.partition(JOINER, HOST);

        a.socket.send_to(b"lost", b.socket.local_addr()).await.unwrap();
        network.heal();
        a.socket.send_to(b"kept", b.socket.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = b.socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"kept");
    }

    #[tokio::test]
    async fn offline_host_cannot_bind() {
        let network = MemoryNetwork::new();
        let bound = network.transport(HOST).bind().await.unwrap();
        network.set_offline(HOST, true);

        let result = network.transport(HOST).bind().await;
        assert!(matches!(result, Err(TransportError::Io(_))));
        assert_eq!(network.socket_count(), 1);
        assert!(network.transport(JOINER).bind().await.is_ok());

        network.set_offline(HOST, false);
        assert!(network.transport(HOST).bind().await.is_ok());
        drop(bound);
    }
}
