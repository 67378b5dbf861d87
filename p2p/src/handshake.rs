//! Offer/answer state machines for both ends of a handshake.
//!
//! The host side hands out one offer token at a time and accepts exactly one
//! answer per offer. The joiner side consumes an offer, replies with an
//! answer and then waits for the transport to report the link open. Both
//! sides remember which correlation ids they have already used so a token can
//! never be replayed into a second link.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::{CodecError, ConnectionCodec};
use crate::crypto::{self, CryptoError, PeerIdentity};
use crate::events::{Event, EventBus};
use crate::link::{LinkError, LinkEvent, PeerLink};
use crate::signal::{HandshakeToken, SignalError, TokenRole};
use crate::transport::{self, LinkConfig, LocalSession, Transport, TransportError};

const CORRELATION_BYTES: usize = 6;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("token could not be decoded: {0}")]
    Decode(#[source] CodecError),
    #[error("token could not be encoded: {0}")]
    Encode(#[source] CodecError),
    #[error("token is not usable: {0}")]
    Invalid(#[from] SignalError),
    #[error("expected an {expected:?} token, got an {found:?} token")]
    UnexpectedRole { expected: TokenRole, found: TokenRole },
    #[error("answer belongs to an earlier invitation; scan the current one")]
    StaleAnswer,
    #[error("token is for room {found}, expected {expected}")]
    RoomTagMismatch { expected: String, found: String },
    #[error("token has already been used")]
    TokenReplayed,
    #[error("no invitation is waiting for an answer")]
    NoPendingOffer,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection did not open within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("link closed before it opened")]
    LinkClosed,
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Crypto(#[from] CryptoError),
}

impl HandshakeError {
    /// True when the operator needs a freshly generated token to continue.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            HandshakeError::Decode(_)
                | HandshakeError::Invalid(_)
                | HandshakeError::Transport(TransportError::Description(_))
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Idle,
    OfferGenerated,
    AwaitingAnswer,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    OfferReceived,
    AnswerGenerated,
    Complete,
}

/// An encoded offer ready to be shown to a joiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invitation {
    pub correlation_id: String,
    pub token: String,
}

struct PendingOffer<S> {
    invitation: Invitation,
    session: LocalSession<S>,
}

/// Host side of the handshake.
pub struct HostHandshake<T: Transport> {
    transport: T,
    identity: PeerIdentity,
    room_tag: String,
    codec: ConnectionCodec,
    link_config: LinkConfig,
    state: HostState,
    pending: Option<PendingOffer<T::Socket>>,
    spent: HashSet<String>,
}

impl<T: Transport> HostHandshake<T> {
    pub fn new(transport: T, identity: PeerIdentity, room_tag: impl Into<String>) -> Self {
        Self {
            transport,
            identity,
            room_tag: room_tag.into(),
            codec: ConnectionCodec::default(),
            link_config: LinkConfig::default(),
            state: HostState::Idle,
            pending: None,
            spent: HashSet::new(),
        }
    }

    pub fn with_codec(mut self, codec: ConnectionCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn room_tag(&self) -> &str {
        &self.room_tag
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// The offer currently outstanding, if any.
    pub fn pending(&self) -> Option<&Invitation> {
        self.pending.as_ref().map(|p| &p.invitation)
    }

    /// Gather a fresh local session and wrap it into an offer token.
    ///
    /// Any unanswered offer is torn down first; links that already completed
    /// are not affected.
    pub async fn create_offer(&mut self) -> Result<Invitation, HandshakeError> {
        self.discard_pending();

        let session = transport::gather(&self.transport, transport::SessionRole::Offerer).await?;
        let correlation_id = crypto::random_id(CORRELATION_BYTES)?;
        let token = HandshakeToken::offer(
            &correlation_id,
            &self.room_tag,
            self.identity.clone(),
            session.description().clone(),
        );
        let encoded = self.codec.encode(&token).map_err(HandshakeError::Encode)?;

        let invitation = Invitation {
            correlation_id,
            token: encoded,
        };
        tracing::info!(
            room = %self.room_tag,
            correlation = %invitation.correlation_id,
            token_len = invitation.token.len(),
            "offer generated"
        );
        self.pending = Some(PendingOffer {
            invitation: invitation.clone(),
            session,
        });
        self.state = HostState::OfferGenerated;
        Ok(invitation)
    }

    /// Mark the current offer as handed to the user; answers are accepted from now on.
    pub fn publish(&mut self) -> Result<&Invitation, HandshakeError> {
        match (&self.pending, self.state) {
            (Some(pending), HostState::OfferGenerated | HostState::AwaitingAnswer) => {
                self.state = HostState::AwaitingAnswer;
                Ok(&pending.invitation)
            }
            _ => Err(HandshakeError::NoPendingOffer),
        }
    }

    /// Apply a joiner's answer to the outstanding offer.
    ///
    /// Tokens that merely do not belong to the current offer are rejected
    /// without touching any state. Undecodable tokens and session failures
    /// end the attempt: the pending offer is torn down and the coordinator
    /// returns to `Idle`.
    pub fn apply_answer(
        &mut self,
        token: &str,
        sink: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<PeerLink, HandshakeError> {
        let answer: HandshakeToken = match self.codec.decode(token) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(room = %self.room_tag, error = %e, "answer token rejected");
                self.discard_pending();
                return Err(HandshakeError::Decode(e));
            }
        };
        if let Err(e) = answer.check_version() {
            self.discard_pending();
            return Err(e.into());
        }

        if answer.role != TokenRole::Answer {
            return Err(HandshakeError::UnexpectedRole {
                expected: TokenRole::Answer,
                found: answer.role,
            });
        }
        if self.spent.contains(&answer.correlation_id) {
            tracing::warn!(correlation = %answer.correlation_id, "answer replayed");
            return Err(HandshakeError::TokenReplayed);
        }
        let pending = match (&self.pending, self.state) {
            (Some(pending), HostState::AwaitingAnswer) => pending,
            _ => return Err(HandshakeError::NoPendingOffer),
        };
        if pending.invitation.correlation_id != answer.correlation_id {
            tracing::info!(
                expected = %pending.invitation.correlation_id,
                found = %answer.correlation_id,
                "stale answer"
            );
            return Err(HandshakeError::StaleAnswer);
        }
        if answer.room_tag != self.room_tag {
            return Err(HandshakeError::RoomTagMismatch {
                expected: self.room_tag.clone(),
                found: answer.room_tag,
            });
        }

        let Some(PendingOffer { invitation, session }) = self.pending.take() else {
            return Err(HandshakeError::NoPendingOffer);
        };
        match PeerLink::connect(session, &answer.session, answer.sender, self.link_config, sink) {
            Ok(link) => {
                self.spent.insert(invitation.correlation_id);
                self.state = HostState::Complete;
                tracing::info!(room = %self.room_tag, peer = %link.id(), "answer applied");
                Ok(link)
            }
            Err(e) => {
                tracing::warn!(room = %self.room_tag, error = %e, "answer could not be applied");
                self.state = HostState::Idle;
                Err(e.into())
            }
        }
    }

    /// Abandon the outstanding offer and release its socket.
    pub fn reset(&mut self) {
        self.discard_pending();
    }

    fn discard_pending(&mut self) {
        if let Some(old) = self.pending.take() {
            tracing::debug!(correlation = %old.invitation.correlation_id, "offer discarded");
        }
        self.state = HostState::Idle;
    }
}

/// Joiner side of the handshake.
pub struct JoinHandshake<T: Transport> {
    transport: T,
    identity: PeerIdentity,
    codec: ConnectionCodec,
    link_config: LinkConfig,
    expected_room: Option<String>,
    state: JoinState,
    consumed: HashSet<String>,
    host: Option<PeerIdentity>,
    room_tag: Option<String>,
    link: Option<PeerLink>,
    events: Option<EventBus>,
}

impl<T: Transport> JoinHandshake<T> {
    pub fn new(transport: T, identity: PeerIdentity) -> Self {
        Self {
            transport,
            identity,
            codec: ConnectionCodec::default(),
            link_config: LinkConfig::default(),
            expected_room: None,
            state: JoinState::Idle,
            consumed: HashSet::new(),
            host: None,
            room_tag: None,
            link: None,
            events: None,
        }
    }

    /// Report decode failures and timeouts on `bus` as well as returning them.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_codec(mut self, codec: ConnectionCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    /// Only accept offers for this room tag.
    pub fn expect_room(mut self, room_tag: impl Into<String>) -> Self {
        self.expected_room = Some(room_tag.into());
        self
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Identity of the host whose offer is being answered.
    pub fn host(&self) -> Option<&PeerIdentity> {
        self.host.as_ref()
    }

    pub fn room_tag(&self) -> Option<&str> {
        self.room_tag.as_deref()
    }

    pub fn link(&self) -> Option<&PeerLink> {
        self.link.as_ref()
    }

    /// Hand the established link to its long-term owner.
    pub fn take_link(&mut self) -> Option<PeerLink> {
        self.link.take()
    }

    /// Consume an offer token and produce the answer token for the host.
    ///
    /// The local link starts connecting right away; it opens as soon as the
    /// host applies the answer.
    pub async fn accept_offer(
        &mut self,
        token: &str,
        sink: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<String, HandshakeError> {
        if self.state == JoinState::Complete {
            return Err(HandshakeError::AlreadyConnected);
        }

        let offer: HandshakeToken = match self.codec.decode(token) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(error = %e, "offer token rejected");
                self.reset();
                self.emit(Event::DecodeError {
                    reason: e.to_string(),
                });
                return Err(HandshakeError::Decode(e));
            }
        };
        if let Err(e) = offer.check_version() {
            self.reset();
            self.emit(Event::DecodeError {
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        if offer.role != TokenRole::Offer {
            return Err(HandshakeError::UnexpectedRole {
                expected: TokenRole::Offer,
                found: offer.role,
            });
        }
        if let Some(expected) = &self.expected_room {
            if *expected != offer.room_tag {
                return Err(HandshakeError::RoomTagMismatch {
                    expected: expected.clone(),
                    found: offer.room_tag,
                });
            }
        }
        if self.consumed.contains(&offer.correlation_id) {
            tracing::warn!(correlation = %offer.correlation_id, "offer replayed");
            return Err(HandshakeError::TokenReplayed);
        }

        self.reset();
        self.consumed.insert(offer.correlation_id.clone());
        self.state = JoinState::OfferReceived;
        tracing::info!(
            room = %offer.room_tag,
            host = %offer.sender.display_name,
            "offer received"
        );

        match self.answer(offer, sink).await {
            Ok(answer) => {
                self.state = JoinState::AnswerGenerated;
                Ok(answer)
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn answer(
        &mut self,
        offer: HandshakeToken,
        sink: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<String, HandshakeError> {
        offer.session.validate()?;

        let session = transport::gather(&self.transport, transport::SessionRole::Answerer).await?;
        let answer = HandshakeToken::answer(
            &offer.correlation_id,
            &offer.room_tag,
            self.identity.clone(),
            session.description().clone(),
        );
        let encoded = self.codec.encode(&answer).map_err(HandshakeError::Encode)?;

        let link = PeerLink::connect(
            session,
            &offer.session,
            offer.sender.clone(),
            self.link_config,
            sink,
        )?;
        self.link = Some(link);
        self.host = Some(offer.sender);
        self.room_tag = Some(offer.room_tag);
        Ok(encoded)
    }

    /// Wait for the host to apply our answer.
    ///
    /// On timeout the attempt is abandoned and the coordinator resets to
    /// `Idle`; the operator needs a fresh invitation to try again.
    pub async fn wait_open(&mut self, timeout: Duration) -> Result<&PeerLink, HandshakeError> {
        let result = match &self.link {
            Some(link) => link.wait_open(timeout).await,
            None => return Err(HandshakeError::NoPendingOffer),
        };
        match result {
            Ok(()) => {
                self.state = JoinState::Complete;
                tracing::info!(room = ?self.room_tag, "joined");
                self.link.as_ref().ok_or(HandshakeError::LinkClosed)
            }
            Err(LinkError::ConnectionTimeout(waited)) => {
                tracing::warn!(?waited, "connection timed out");
                let peer_id = self.host.as_ref().map(|h| h.id.clone());
                self.reset();
                self.emit(Event::ConnectionTimeout { peer_id });
                Err(HandshakeError::ConnectionTimeout(waited))
            }
            Err(LinkError::Closed) => {
                self.reset();
                Err(HandshakeError::LinkClosed)
            }
        }
    }

    /// Abandon the current attempt, closing any link it started.
    pub fn reset(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.host = None;
        self.room_tag = None;
        self.state = JoinState::Idle;
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}
