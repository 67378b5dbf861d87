use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::crypto::PeerIdentity;
use crate::signal::SessionDescription;
use crate::transport::{DatagramSocket, LinkConfig, LocalSession, Outbound, TransportError};

/// Lifecycle of a link. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEventKind {
    Open,
    Message(Vec<u8>),
    Closed,
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Something happened on the link to `peer_id`.
///
/// Every link of a process can share one sink, which gives the owner a single
/// queue to drain in arrival order. `link_id` tells apart successive links to
/// the same peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEvent {
    pub peer_id: String,
    pub link_id: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link did not open within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("link closed before it opened")]
    Closed,
}

/// One bidirectional, unreliable, ordered message channel to a remote peer.
///
/// Dropping the link closes it and releases its socket.
pub struct PeerLink {
    identity: PeerIdentity,
    link_id: u64,
    state: watch::Receiver<LinkState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    created_at: DateTime<Utc>,
}

impl PeerLink {
    /// Start a link from a gathered local session and the remote description.
    ///
    /// The link begins in [`LinkState::Connecting`]; it opens once the remote
    /// side has applied our description too.
    pub fn connect<S: DatagramSocket>(
        session: LocalSession<S>,
        remote: &SessionDescription,
        identity: PeerIdentity,
        config: LinkConfig,
        sink: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, TransportError> {
        let link_id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let handle = session.start(remote, &identity.id, link_id, config, sink)?;
        tracing::debug!(
            peer = %identity.id,
            name = %identity.display_name,
            link_id,
            "link connecting"
        );
        Ok(Self {
            identity,
            link_id,
            state: handle.state,
            outbound: handle.outbound,
            created_at: Utc::now(),
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Unique within the process, so events from a replaced link can be told
    /// apart from the link that replaced it.
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queue `message` for delivery. Silently dropped unless the link is open.
    pub fn send(&self, message: Vec<u8>) {
        if !self.is_open() {
            tracing::trace!(peer = %self.identity.id, state = ?self.state(), "send skipped");
            return;
        }
        let _ = self.outbound.send(Outbound::Data(message));
    }

    /// Wait until the link leaves `Connecting`.
    ///
    /// The transport never gives up on its own, so this is where callers put
    /// their connection timeout.
    pub async fn wait_open(&self, timeout: Duration) -> Result<(), LinkError> {
        let mut rx = self.state.clone();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| *s != LinkState::Connecting))
            .await
            .map(|state| state.map(|s| *s));
        match settled {
            Err(_) => Err(LinkError::ConnectionTimeout(timeout)),
            Ok(Ok(LinkState::Open)) => Ok(()),
            Ok(_) => Err(LinkError::Closed),
        }
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == LinkState::Closed).await;
    }

    /// Close the link, telling the remote side if it is reachable.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("identity", &self.identity)
            .field("link_id", &self.link_id)
            .field("state", &self.state())
            .finish()
    }
}
