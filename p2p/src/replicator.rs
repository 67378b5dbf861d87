//! Host-authoritative game state replication over open peer links.
//!
//! The host owns the only mutable copy of the game. Joiners send actions,
//! the host validates and applies them through a [`TurnEngine`] and pushes
//! the complete resulting state back out. Joiners never merge: every
//! snapshot replaces what they had.

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::{Event, EventBus};
use crate::link::PeerLink;

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("expected a {expected} envelope, got {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("peer {0} has no seat")]
    UnknownPeer(String),
    #[error("no game in progress")]
    NoGame,
    #[error("action from {peer_id} rejected: {reason}")]
    Rejected { peer_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// A small out-of-band message such as "the game has started".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub tag: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ControlSignal {
    pub const START: &'static str = "start";

    pub fn new(tag: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    pub fn start(players: usize) -> Self {
        Self::new(Self::START, serde_json::json!({ "players": players }))
    }
}

/// The only thing that travels over an open link.
///
/// Serialized as `{"kind": "snapshot" | "action" | "control", "data": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Envelope<S, A> {
    Snapshot(S),
    Action(A),
    Control(ControlSignal),
}

impl<S, A> Envelope<S, A> {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Snapshot(_) => "snapshot",
            Envelope::Action(_) => "action",
            Envelope::Control(_) => "control",
        }
    }
}

impl<S: Serialize, A: Serialize> Envelope<S, A> {
    pub fn encode(&self) -> Result<Vec<u8>, ReplicatorError> {
        serde_json::to_vec(self).map_err(ReplicatorError::Encode)
    }
}

impl<S: DeserializeOwned, A: DeserializeOwned> Envelope<S, A> {
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicatorError> {
        serde_json::from_slice(bytes).map_err(ReplicatorError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Turn engine seam
// ---------------------------------------------------------------------------

/// The game rules the host replicator drives.
pub trait TurnEngine {
    type State: Clone + Serialize + DeserializeOwned;
    type Action: Serialize + DeserializeOwned;
    type Rejection: std::error::Error;

    /// Apply `action` for `seat`, producing the next state or a rejection.
    fn apply(
        &self,
        state: &Self::State,
        seat: usize,
        action: &Self::Action,
    ) -> Result<Self::State, Self::Rejection>;

    /// Host-side moves that need no input, such as bot turns.
    fn advance(&self, _state: &mut Self::State) {}
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Holds the authoritative state and fans it out to the room.
pub struct HostReplicator<E: TurnEngine> {
    engine: E,
    state: Option<E::State>,
    seats: HashMap<String, usize>,
    bus: EventBus,
}

impl<E: TurnEngine> HostReplicator<E> {
    pub fn new(engine: E, bus: EventBus) -> Self {
        Self {
            engine,
            state: None,
            seats: HashMap::new(),
            bus,
        }
    }

    pub fn state(&self) -> Option<&E::State> {
        self.state.as_ref()
    }

    pub fn seat_of(&self, peer_id: &str) -> Option<usize> {
        self.seats.get(peer_id).copied()
    }

    /// Install the initial state and announce the game.
    ///
    /// Every open link first gets a `start` control signal, then the first
    /// snapshot. Returns how many links received the snapshot.
    pub fn start_game<'a>(
        &mut self,
        initial: E::State,
        seats: impl IntoIterator<Item = (String, usize)>,
        links: impl IntoIterator<Item = &'a PeerLink>,
    ) -> Result<usize, ReplicatorError> {
        self.seats = seats.into_iter().collect();
        let mut state = initial;
        self.engine.advance(&mut state);
        self.state = Some(state);

        let links: Vec<&PeerLink> = links.into_iter().collect();
        let players = self.seats.len();
        let start =
            Envelope::<E::State, E::Action>::Control(ControlSignal::start(players)).encode()?;
        for link in links.iter().filter(|l| l.is_open()) {
            link.send(start.clone());
        }
        tracing::info!(players, "game started");
        self.bus.emit(Event::GameStarted { players });
        self.broadcast(links)
    }

    /// Push the current state to every open link. Links that are not open
    /// are skipped; they catch up with the next push.
    pub fn broadcast<'a>(
        &self,
        links: impl IntoIterator<Item = &'a PeerLink>,
    ) -> Result<usize, ReplicatorError> {
        let state = self.state.as_ref().ok_or(ReplicatorError::NoGame)?;
        let bytes = Envelope::<&E::State, E::Action>::Snapshot(state).encode()?;

        let mut delivered = 0;
        for link in links {
            if link.is_open() {
                link.send(bytes.clone());
                delivered += 1;
            } else {
                tracing::trace!(peer = %link.id(), state = ?link.state(), "snapshot skipped");
            }
        }
        tracing::debug!(delivered, len = bytes.len(), "snapshot broadcast");
        Ok(delivered)
    }

    /// Handle an envelope that arrived from `peer_id`.
    ///
    /// Only actions are accepted. A rejected action changes nothing and is
    /// not followed by a broadcast.
    pub fn receive_action<'a>(
        &mut self,
        peer_id: &str,
        bytes: &[u8],
        links: impl IntoIterator<Item = &'a PeerLink>,
    ) -> Result<usize, ReplicatorError> {
        let action = match Envelope::<E::State, E::Action>::decode(bytes)? {
            Envelope::Action(action) => action,
            other => {
                return Err(ReplicatorError::UnexpectedKind {
                    expected: "action",
                    found: other.kind(),
                })
            }
        };
        let seat = self
            .seat_of(peer_id)
            .ok_or_else(|| ReplicatorError::UnknownPeer(peer_id.to_string()))?;
        self.apply(peer_id, seat, &action, links)
    }

    /// Apply an action for a seat played on this device.
    pub fn apply_local<'a>(
        &mut self,
        seat: usize,
        action: &E::Action,
        links: impl IntoIterator<Item = &'a PeerLink>,
    ) -> Result<usize, ReplicatorError> {
        self.apply("local", seat, action, links)
    }

    fn apply<'a>(
        &mut self,
        peer_id: &str,
        seat: usize,
        action: &E::Action,
        links: impl IntoIterator<Item = &'a PeerLink>,
    ) -> Result<usize, ReplicatorError> {
        let current = self.state.as_ref().ok_or(ReplicatorError::NoGame)?;
        let mut next = match self.engine.apply(current, seat, action) {
            Ok(next) => next,
            Err(rejection) => {
                let reason = rejection.to_string();
                tracing::info!(peer = %peer_id, seat, %reason, "action rejected");
                self.bus.emit(Event::ActionRejected {
                    peer_id: peer_id.to_string(),
                    reason: reason.clone(),
                });
                return Err(ReplicatorError::Rejected {
                    peer_id: peer_id.to_string(),
                    reason,
                });
            }
        };
        self.engine.advance(&mut next);
        self.state = Some(next);
        self.broadcast(links)
    }
}

// ---------------------------------------------------------------------------
// Joiner side
// ---------------------------------------------------------------------------

/// What an inbound envelope turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    Snapshot,
    Control,
}

/// Keeps the last snapshot from the host and forwards local actions.
pub struct JoinerReplicator<S, A> {
    state: Option<S>,
    control: Option<mpsc::UnboundedSender<ControlSignal>>,
    _action: PhantomData<fn(A)>,
}

impl<S, A> Default for JoinerReplicator<S, A> {
    fn default() -> Self {
        Self {
            state: None,
            control: None,
            _action: PhantomData,
        }
    }
}

impl<S, A> JoinerReplicator<S, A>
where
    S: Serialize + DeserializeOwned,
    A: Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Route control signals to `handler`.
    pub fn on_control(&mut self, handler: mpsc::UnboundedSender<ControlSignal>) {
        self.control = Some(handler);
    }

    /// The last snapshot received, for display only.
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Send an action to the host. Nothing is sent if the link is not open.
    pub fn send_action(&self, link: &PeerLink, action: &A) -> Result<(), ReplicatorError> {
        let bytes = Envelope::<S, &A>::Action(action).encode()?;
        link.send(bytes);
        Ok(())
    }

    /// Handle an envelope from the host.
    pub fn on_message(&mut self, bytes: &[u8]) -> Result<Received, ReplicatorError> {
        match Envelope::<S, A>::decode(bytes)? {
            Envelope::Snapshot(snapshot) => {
                self.state = Some(snapshot);
                Ok(Received::Snapshot)
            }
            Envelope::Control(signal) => {
                tracing::debug!(tag = %signal.tag, "control signal");
                if let Some(handler) = &self.control {
                    let _ = handler.send(signal);
                }
                Ok(Received::Control)
            }
            Envelope::Action(_) => Err(ReplicatorError::UnexpectedKind {
                expected: "snapshot or control",
                found: "action",
            }),
        }
    }
}
