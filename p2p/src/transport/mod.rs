//! Direct datagram transport underneath [`PeerLink`](crate::link::PeerLink).
//!
//! A [`Transport`] binds a socket and reports the addresses it can be reached
//! on ("gathering"). [`gather`] wraps that into a [`LocalSession`] whose
//! [`SessionDescription`] can be shipped inside a handshake token. Once the
//! remote description is known the session is started and the datagram
//! driver takes over probing, keepalives and message delivery.

mod driver;
mod memory;
mod udp;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, KeyExchange};
use crate::crypto::{self, CryptoError};
use crate::link::LinkEvent;
use crate::signal::{SessionDescription, SignalError};

pub(crate) use driver::{DriverHandle, Outbound};
pub use driver::LinkConfig;
pub use memory::{MemoryNetwork, MemorySocket, MemoryTransport};
pub use udp::{UdpConfig, UdpTransport};

const SESSION_ID_BYTES: usize = 6;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("address gathering found no usable candidate")]
    NoCandidates,
    #[error("invalid remote session description: {0}")]
    Description(#[from] SignalError),
    #[error("key exchange failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Crypto(#[from] CryptoError),
}

/// A socket that moves whole datagrams.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

/// A freshly bound socket plus every address it is reachable on.
pub struct Gathered<S> {
    pub socket: S,
    pub candidates: Vec<SocketAddr>,
}

/// Binds sockets and gathers their reachable addresses.
pub trait Transport: Clone + Send + Sync + 'static {
    type Socket: DatagramSocket;

    /// Resolves only once gathering has finished.
    fn bind(&self) -> impl Future<Output = Result<Gathered<Self::Socket>, TransportError>> + Send;
}

/// Which half of the offer/answer exchange a session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Offerer,
    Answerer,
}

/// A gathered local endpoint waiting for its remote counterpart.
///
/// Dropping it releases the socket, which is how an abandoned handshake
/// gives its transport resources back.
pub struct LocalSession<S> {
    role: SessionRole,
    socket: Arc<S>,
    keys: KeyExchange,
    description: SessionDescription,
}

/// Bind a socket, wait for gathering to complete and describe the result.
pub async fn gather<T: Transport>(
    transport: &T,
    role: SessionRole,
) -> Result<LocalSession<T::Socket>, TransportError> {
    let gathered = transport.bind().await?;
    if gathered.candidates.is_empty() {
        return Err(TransportError::NoCandidates);
    }

    let keys = KeyExchange::generate()?;
    let description = SessionDescription {
        session_id: crypto::random_id(SESSION_ID_BYTES)?,
        public_key: crypto::encode_key(keys.public_key()),
        candidates: gathered.candidates,
    };
    tracing::debug!(
        ?role,
        session = %description.session_id,
        candidates = ?description.candidates,
        "gathering complete"
    );

    Ok(LocalSession {
        role,
        socket: Arc::new(gathered.socket),
        keys,
        description,
    })
}

impl<S: DatagramSocket> LocalSession<S> {
    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Apply the remote description and start connectivity checks.
    ///
    /// Consumes the session: the returned driver owns the socket from now on.
    pub(crate) fn start(
        self,
        remote: &SessionDescription,
        peer_id: &str,
        link_id: u64,
        config: LinkConfig,
        sink: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<DriverHandle, TransportError> {
        remote.validate()?;
        let remote_key = remote.public_key_bytes()?;

        let is_offerer = self.role == SessionRole::Offerer;
        let (offer_id, answer_id) = if is_offerer {
            (&self.description.session_id, &remote.session_id)
        } else {
            (&remote.session_id, &self.description.session_id)
        };
        let context = format!("{offer_id}/{answer_id}");
        let cipher = self
            .keys
            .complete(&remote_key, is_offerer, context.as_bytes())?;

        Ok(driver::spawn(
            self.socket,
            cipher,
            remote.candidates.clone(),
            peer_id.to_string(),
            link_id,
            config,
            sink,
        ))
    }
}
