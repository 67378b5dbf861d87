use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::DatagramSocket;
use crate::channel::{DatagramCipher, OpenedFrame, HEADER_LEN};
use crate::link::{LinkEvent, LinkEventKind, LinkState};

const KIND_PROBE: u8 = 1;
const KIND_PROBE_ACK: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_BYE: u8 = 4;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;
const TAG_LEN: usize = 16;

/// Timing knobs for a link's datagram driver.
#[derive(Clone, Copy, Debug)]
pub struct LinkConfig {
    /// How often connectivity probes go out while connecting.
    pub probe_interval: Duration,
    /// Quiet period after which an open link sends a keepalive.
    pub keepalive_interval: Duration,
    /// An open link with no inbound traffic for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl LinkConfig {
    /// Largest application message that fits in one datagram.
    pub const MAX_MESSAGE: usize = MAX_DATAGRAM - HEADER_LEN - TAG_LEN;
}

pub(crate) enum Outbound {
    Data(Vec<u8>),
    Close,
}

pub(crate) struct DriverHandle {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub state: watch::Receiver<LinkState>,
}

/// Per-link protocol state, kept apart from the socket and command queue so
/// the select loop can borrow them independently.
struct LinkCore {
    peer_id: String,
    link_id: u64,
    cipher: DatagramCipher,
    candidates: Vec<SocketAddr>,
    remote: Option<SocketAddr>,
    last_counter: u64,
    last_inbound: Instant,
    last_outbound: Instant,
    config: LinkConfig,
    state: watch::Sender<LinkState>,
    sink: mpsc::UnboundedSender<LinkEvent>,
}

pub(crate) fn spawn<S: DatagramSocket>(
    socket: Arc<S>,
    cipher: DatagramCipher,
    candidates: Vec<SocketAddr>,
    peer_id: String,
    link_id: u64,
    config: LinkConfig,
    sink: mpsc::UnboundedSender<LinkEvent>,
) -> DriverHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

    let now = Instant::now();
    let core = LinkCore {
        peer_id,
        link_id,
        cipher,
        candidates,
        remote: None,
        last_counter: 0,
        last_inbound: now,
        last_outbound: now,
        config,
        state: state_tx,
        sink,
    };
    tokio::spawn(run(socket, outbound_rx, core));

    DriverHandle {
        outbound: outbound_tx,
        state: state_rx,
    }
}

async fn run<S: DatagramSocket>(
    socket: Arc<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut core: LinkCore,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = tokio::time::interval(core.config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(peer = %core.peer_id, error = %e, "recv failed");
                        continue;
                    }
                };
                if !core.handle_datagram(socket.as_ref(), &buf[..len], from).await {
                    break;
                }
            }
            command = outbound.recv() => match command {
                Some(Outbound::Data(message)) => core.send_data(socket.as_ref(), &message).await,
                Some(Outbound::Close) | None => {
                    core.send_bye(socket.as_ref()).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !core.on_tick(socket.as_ref()).await {
                    break;
                }
            }
        }
    }

    core.transition(LinkState::Closed);
}

impl LinkCore {
    fn transition(&self, next: LinkState) {
        let changed = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }

        let kind = match next {
            LinkState::Open => LinkEventKind::Open,
            LinkState::Closed => LinkEventKind::Closed,
            LinkState::Connecting => return,
        };
        tracing::info!(peer = %self.peer_id, state = ?next, "link state changed");
        let _ = self.sink.send(LinkEvent {
            peer_id: self.peer_id.clone(),
            link_id: self.link_id,
            kind,
        });
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Returns `false` when the link should shut down.
    async fn handle_datagram<S: DatagramSocket>(
        &mut self,
        socket: &S,
        frame: &[u8],
        from: SocketAddr,
    ) -> bool {
        let OpenedFrame {
            kind,
            counter,
            payload,
        } = match self.cipher.open(frame) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::trace!(peer = %self.peer_id, %from, error = %e, "dropping datagram");
                return true;
            }
        };

        // Older than something already delivered: unreliable-ordered semantics drop it.
        if counter <= self.last_counter {
            return true;
        }
        self.last_counter = counter;
        self.last_inbound = Instant::now();

        if self.remote != Some(from) {
            tracing::debug!(peer = %self.peer_id, %from, "remote address selected");
            self.remote = Some(from);
        }
        self.transition(LinkState::Open);

        match kind {
            KIND_PROBE => self.send_frame(socket, KIND_PROBE_ACK, &[], from).await,
            KIND_PROBE_ACK => {}
            KIND_DATA => {
                let _ = self.sink.send(LinkEvent {
                    peer_id: self.peer_id.clone(),
                    link_id: self.link_id,
                    kind: LinkEventKind::Message(payload),
                });
            }
            KIND_BYE => {
                tracing::debug!(peer = %self.peer_id, "remote closed the link");
                return false;
            }
            other => tracing::trace!(peer = %self.peer_id, kind = other, "unknown frame kind"),
        }
        true
    }

    /// Returns `false` when the link should shut down.
    async fn on_tick<S: DatagramSocket>(&mut self, socket: &S) -> bool {
        match self.state() {
            LinkState::Connecting => {
                for target in self.candidates.clone() {
                    self.send_frame(socket, KIND_PROBE, &[], target).await;
                }
                true
            }
            LinkState::Open => {
                if self.last_inbound.elapsed() >= self.config.idle_timeout {
                    tracing::info!(peer = %self.peer_id, "link idle, closing");
                    return false;
                }
                if self.last_outbound.elapsed() >= self.config.keepalive_interval {
                    if let Some(remote) = self.remote {
                        self.send_frame(socket, KIND_PROBE, &[], remote).await;
                    }
                }
                true
            }
            LinkState::Closed => false,
        }
    }

    async fn send_data<S: DatagramSocket>(&mut self, socket: &S, message: &[u8]) {
        if message.len() > LinkConfig::MAX_MESSAGE {
            tracing::warn!(peer = %self.peer_id, len = message.len(), "message too large, dropped");
            return;
        }
        if let (LinkState::Open, Some(remote)) = (self.state(), self.remote) {
            self.send_frame(socket, KIND_DATA, message, remote).await;
        }
    }

    async fn send_bye<S: DatagramSocket>(&mut self, socket: &S) {
        if let Some(remote) = self.remote {
            self.send_frame(socket, KIND_BYE, &[], remote).await;
        }
    }

    async fn send_frame<S: DatagramSocket>(
        &mut self,
        socket: &S,
        kind: u8,
        payload: &[u8],
        target: SocketAddr,
    ) {
        let frame = match self.cipher.seal(kind, payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %self.peer_id, error = %e, "failed to seal frame");
                return;
            }
        };
        if let Err(e) = socket.send_to(&frame, target).await {
            tracing::debug!(peer = %self.peer_id, %target, error = %e, "send failed");
        }
        self.last_outbound = Instant::now();
    }
}
