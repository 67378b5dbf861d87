use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::crypto::PeerIdentity;
use crate::events::{Event, EventBus};
use crate::handshake::{HandshakeError, HostHandshake, HostState, Invitation};
use crate::link::{LinkEvent, LinkEventKind, LinkState, PeerLink};
use crate::transport::Transport;

/// Most joiners a room takes; with the host that fills a four-seat table.
pub const MAX_CAPACITY: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room is full ({capacity} joiners)")]
    RoomFull { capacity: usize },
    #[error("capacity must be between 1 and {max}, got {requested}")]
    InvalidCapacity { requested: usize, max: usize },
    #[error("no member with id {0}")]
    UnknownMember(String),
    #[error("room is closed")]
    Closed,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// Public summary of a room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub tag: String,
    pub capacity: usize,
    pub members: Vec<PeerIdentity>,
    pub invitation_open: bool,
    pub created_at: DateTime<Utc>,
}

/// A joiner registered in the room, owning its link.
#[derive(Debug)]
pub struct Member {
    link: PeerLink,
    joined_at: DateTime<Utc>,
}

impl Member {
    pub fn identity(&self) -> &PeerIdentity {
        self.link.identity()
    }

    pub fn id(&self) -> &str {
        self.link.id()
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }
}

/// Host-side room: the ordered member list plus the invitation on display.
///
/// All mutation goes through `&mut self`, so the member list and the pending
/// invitation only ever change here.
pub struct RoomManager<T: Transport> {
    capacity: usize,
    created_at: DateTime<Utc>,
    members: Vec<Member>,
    invitation: Option<Invitation>,
    handshake: HostHandshake<T>,
    bus: EventBus,
    sink: mpsc::UnboundedSender<LinkEvent>,
    closed: bool,
}

impl<T: Transport> RoomManager<T> {
    /// Open an empty room and issue its first invitation.
    ///
    /// `sink` receives the events of every member link.
    pub async fn open(
        handshake: HostHandshake<T>,
        capacity: usize,
        bus: EventBus,
        sink: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, RoomError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(RoomError::InvalidCapacity {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }

        let mut room = Self {
            capacity,
            created_at: Utc::now(),
            members: Vec::with_capacity(capacity),
            invitation: None,
            handshake,
            bus,
            sink,
            closed: false,
        };
        tracing::info!(room = %room.tag(), capacity, "room opened");
        room.issue_invitation().await?;
        Ok(room)
    }

    pub fn tag(&self) -> &str {
        self.handshake.room_tag()
    }

    pub fn host(&self) -> &PeerIdentity {
        self.handshake.identity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Members in join order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id() == id)
    }

    /// The invitation currently on display, if the room is taking joiners.
    pub fn invitation(&self) -> Option<&Invitation> {
        self.invitation.as_ref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            tag: self.tag().to_string(),
            capacity: self.capacity,
            members: self.members.iter().map(|m| m.identity().clone()).collect(),
            invitation_open: self.invitation.is_some(),
            created_at: self.created_at,
        }
    }

    /// Complete the pending handshake with a joiner's answer token.
    ///
    /// A full room rejects the answer before looking at it. On success the
    /// new member is announced and the next invitation is issued, or the
    /// invitation is cleared once the room is full.
    pub async fn apply_joiner_answer(&mut self, token: &str) -> Result<PeerIdentity, RoomError> {
        if self.closed {
            return Err(RoomError::Closed);
        }
        if self.is_full() {
            tracing::info!(room = %self.tag(), "answer rejected, room full");
            return Err(RoomError::RoomFull {
                capacity: self.capacity,
            });
        }

        let link = match self.handshake.apply_answer(token, self.sink.clone()) {
            Ok(link) => link,
            Err(e) => {
                self.report_handshake_failure(&e);
                if self.handshake.state() == HostState::Idle {
                    self.invitation = None;
                    self.ensure_invitation().await;
                }
                return Err(e.into());
            }
        };

        let identity = link.identity().clone();
        if let Some(pos) = self.members.iter().position(|m| m.id() == identity.id) {
            tracing::warn!(peer = %identity.id, "peer id rejoined, replacing old link");
            self.members.remove(pos).link.close();
        }
        self.members.push(Member {
            link,
            joined_at: Utc::now(),
        });
        tracing::info!(
            room = %self.tag(),
            peer = %identity.id,
            name = %identity.display_name,
            members = self.members.len(),
            "peer joined"
        );
        self.bus.emit(Event::PeerJoined {
            room_tag: self.tag().to_string(),
            peer_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
        });

        if self.is_full() {
            self.clear_invitation();
            self.bus.emit(Event::RoomFull {
                room_tag: self.tag().to_string(),
                capacity: self.capacity,
            });
        } else {
            self.invitation = None;
            self.ensure_invitation().await;
        }
        Ok(identity)
    }

    /// Drop a member and its link. Re-opens the invitation if a seat freed up.
    pub async fn remove_member(&mut self, id: &str) -> Result<PeerIdentity, RoomError> {
        let pos = self
            .members
            .iter()
            .position(|m| m.id() == id)
            .ok_or_else(|| RoomError::UnknownMember(id.to_string()))?;
        let member = self.members.remove(pos);
        member.link.close();
        let identity = member.identity().clone();

        tracing::info!(room = %self.tag(), peer = %id, "peer left");
        self.bus.emit(Event::PeerLeft {
            room_tag: self.tag().to_string(),
            peer_id: identity.id.clone(),
        });

        self.ensure_invitation().await;
        Ok(identity)
    }

    /// Drop members whose link is still connecting `max_wait` after they
    /// joined, reporting each as a connection timeout.
    pub async fn expire_connecting(
        &mut self,
        max_wait: Duration,
    ) -> Result<Vec<PeerIdentity>, RoomError> {
        let now = Utc::now();
        let stuck: Vec<String> = self
            .members
            .iter()
            .filter(|m| m.link.state() == LinkState::Connecting)
            .filter(|m| (now - m.joined_at).to_std().is_ok_and(|age| age >= max_wait))
            .map(|m| m.id().to_string())
            .collect();

        let mut expired = Vec::with_capacity(stuck.len());
        for id in stuck {
            tracing::warn!(room = %self.tag(), peer = %id, ?max_wait, "link never opened");
            self.bus.emit(Event::ConnectionTimeout {
                peer_id: Some(id.clone()),
            });
            expired.push(self.remove_member(&id).await?);
        }
        Ok(expired)
    }

    /// Track link lifecycle for members. Messages are left to the replicator.
    ///
    /// Events from links that are no longer a member's current link are
    /// ignored.
    pub async fn handle_link_event(&mut self, event: &LinkEvent) -> Result<(), RoomError> {
        if !self.owns(event) {
            return Ok(());
        }
        match event.kind {
            LinkEventKind::Open => {
                self.bus.emit(Event::LinkOpened {
                    peer_id: event.peer_id.clone(),
                });
            }
            LinkEventKind::Closed => {
                self.bus.emit(Event::LinkClosed {
                    peer_id: event.peer_id.clone(),
                });
                self.remove_member(&event.peer_id).await?;
            }
            LinkEventKind::Message(_) => {}
        }
        Ok(())
    }

    /// True if `event` comes from the current link of a member.
    pub fn owns(&self, event: &LinkEvent) -> bool {
        self.member(&event.peer_id)
            .is_some_and(|m| m.link.link_id() == event.link_id)
    }

    /// Issue an invitation when a seat is free and none is showing.
    ///
    /// Returns whether an invitation is showing afterwards. Failures are
    /// logged; calling again retries.
    pub async fn ensure_invitation(&mut self) -> bool {
        if self.closed || self.is_full() {
            return false;
        }
        if self.invitation.is_some() {
            return true;
        }
        match self.issue_invitation().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(room = %self.tag(), error = %e, "could not issue invitation");
                false
            }
        }
    }

    /// Tear down every link and the pending invitation.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handshake.reset();
        self.clear_invitation();
        for member in self.members.drain(..) {
            member.link.close();
            self.bus.emit(Event::PeerLeft {
                room_tag: self.handshake.room_tag().to_string(),
                peer_id: member.id().to_string(),
            });
        }
        tracing::info!(room = %self.tag(), "room closed");
    }

    async fn issue_invitation(&mut self) -> Result<(), RoomError> {
        self.handshake.create_offer().await?;
        let invitation = self.handshake.publish()?.clone();
        tracing::debug!(
            room = %self.tag(),
            correlation = %invitation.correlation_id,
            "invitation issued"
        );
        self.bus.emit(Event::InvitationReady {
            room_tag: self.tag().to_string(),
            token: invitation.token.clone(),
        });
        self.invitation = Some(invitation);
        Ok(())
    }

    fn clear_invitation(&mut self) {
        self.handshake.reset();
        if self.invitation.take().is_some() {
            self.bus.emit(Event::InvitationCleared {
                room_tag: self.tag().to_string(),
            });
        }
    }

    fn report_handshake_failure(&self, error: &HandshakeError) {
        let room_tag = self.tag().to_string();
        let event = match error {
            HandshakeError::StaleAnswer | HandshakeError::TokenReplayed => {
                Event::StaleAnswer { room_tag }
            }
            e if e.is_decode_error() => Event::DecodeError {
                reason: e.to_string(),
            },
            _ => return,
        };
        self.bus.emit(event);
    }
}

impl<T: Transport> Drop for RoomManager<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use crate::codec::ConnectionCodec;
    use crate::handshake::JoinHandshake;
    use crate::signal::{HandshakeToken, SessionDescription};
    use crate::transport::{MemoryNetwork, MemoryTransport};

    const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    async fn open_room(
        network: &MemoryNetwork,
        capacity: usize,
    ) -> (RoomManager<MemoryTransport>, broadcast::Receiver<Event>) {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let (sink, _) = mpsc::unbounded_channel();
        let handshake = HostHandshake::new(
            network.transport(HOST_IP),
            PeerIdentity::new("host", "Host"),
            "QX7P",
        );
        let room = RoomManager::open(handshake, capacity, bus, sink).await.unwrap();
        (room, events)
    }

    async fn answer_for(
        network: &MemoryNetwork,
        last_octet: u8,
        token: &str,
    ) -> (JoinHandshake<MemoryTransport>, String) {
        let mut joiner = JoinHandshake::new(
            network.transport(Ipv4Addr::new(10, 0, 0, last_octet)),
            PeerIdentity::new(format!("peer{last_octet}"), format!("Player {last_octet}")),
        );
        let (sink, _) = mpsc::unbounded_channel();
        let answer = joiner.accept_offer(token, sink).await.unwrap();
        (joiner, answer)
    }

    fn current_token<T: Transport>(room: &RoomManager<T>) -> String {
        room.invitation().unwrap().token.clone()
    }

    fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn open_issues_first_invitation() {
        let network = MemoryNetwork::new();
        let (room, mut events) = open_room(&network, 3).await;
        assert!(room.is_empty());
        assert_eq!(room.tag(), "QX7P");
        let token = current_token(&room);
        assert_eq!(
            drain(&mut events),
            vec![Event::InvitationReady {
                room_tag: "QX7P".into(),
                token
            }]
        );
    }

    #[tokio::test]
    async fn invalid_capacity_rejected() {
        let network = MemoryNetwork::new();
        let (sink, _) = mpsc::unbounded_channel();
        for capacity in [0, MAX_CAPACITY + 1] {
            let handshake = HostHandshake::new(
                network.transport(HOST_IP),
                PeerIdentity::new("h", "H"),
                "QX7P",
            );
            let result =
                RoomManager::open(handshake, capacity, EventBus::default(), sink.clone()).await;
            assert!(matches!(result, Err(RoomError::InvalidCapacity { .. })));
        }
    }

    #[tokio::test]
    async fn join_registers_and_refreshes_invitation() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 3).await;
        let t1 = current_token(&room);
        drain(&mut events);

        let (_joiner, answer) = answer_for(&network, 2, &t1).await;
        let joined = room.apply_joiner_answer(&answer).await.unwrap();
        assert_eq!(joined.display_name, "Player 2");
        assert_eq!(room.len(), 1);

        let t2 = current_token(&room);
        assert_ne!(t1, t2);
        let seen = drain(&mut events);
        assert!(matches!(&seen[0], Event::PeerJoined { peer_id, .. } if peer_id == "peer2"));
        assert!(matches!(&seen[1], Event::InvitationReady { token, .. } if *token == t2));
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 1).await;
        let t1 = current_token(&room);

        let (_a, answer_a) = answer_for(&network, 2, &t1).await;
        let (_b, answer_b) = answer_for(&network, 3, &t1).await;
        room.apply_joiner_answer(&answer_a).await.unwrap();
        assert!(room.is_full());
        assert!(room.invitation().is_none());
        let seen = drain(&mut events);
        assert!(seen.contains(&Event::RoomFull {
            room_tag: "QX7P".into(),
            capacity: 1
        }));

        let err = room.apply_joiner_answer(&answer_b).await.unwrap_err();
        assert!(matches!(err, RoomError::RoomFull { capacity: 1 }));
        assert_eq!(room.len(), 1);
        assert_eq!(room.members()[0].id(), "peer2");
    }

    #[tokio::test]
    async fn answer_to_used_invitation_keeps_current_one() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 3).await;
        let t1 = current_token(&room);
        let (_a, answer_a) = answer_for(&network, 2, &t1).await;
        let (_b, late) = answer_for(&network, 3, &t1).await;
        room.apply_joiner_answer(&answer_a).await.unwrap();
        let t2 = current_token(&room);
        drain(&mut events);

        let err = room.apply_joiner_answer(&late).await.unwrap_err();
        assert!(matches!(err, RoomError::Handshake(HandshakeError::TokenReplayed)));
        assert_eq!(current_token(&room), t2);
        assert_eq!(room.len(), 1);
        assert_eq!(
            drain(&mut events),
            vec![Event::StaleAnswer {
                room_tag: "QX7P".into()
            }]
        );
    }

    #[tokio::test]
    async fn garbage_answer_reissues_invitation() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 2).await;
        let t1 = current_token(&room);
        let (_a, answer_to_t1) = answer_for(&network, 2, &t1).await;
        drain(&mut events);

        let err = room.apply_joiner_answer("bm90IGEgdG9rZW4").await.unwrap_err();
        assert!(matches!(err, RoomError::Handshake(e) if e.is_decode_error()));

        let t2 = current_token(&room);
        assert_ne!(t1, t2);
        let seen = drain(&mut events);
        assert!(matches!(seen[0], Event::DecodeError { .. }));
        assert!(matches!(&seen[1], Event::InvitationReady { token, .. } if *token == t2));

        let err = room.apply_joiner_answer(&answer_to_t1).await.unwrap_err();
        assert!(matches!(err, RoomError::Handshake(HandshakeError::StaleAnswer)));
        assert_eq!(current_token(&room), t2);
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn leaving_member_reopens_invitation() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 1).await;
        let (_a, answer) = answer_for(&network, 2, &current_token(&room)).await;
        room.apply_joiner_answer(&answer).await.unwrap();
        assert!(room.invitation().is_none());
        drain(&mut events);

        let left = room.remove_member("peer2").await.unwrap();
        assert_eq!(left.id, "peer2");
        assert!(room.is_empty());
        assert!(room.invitation().is_some());
        let seen = drain(&mut events);
        assert!(matches!(&seen[0], Event::PeerLeft { peer_id, .. } if peer_id == "peer2"));
        assert!(matches!(seen[1], Event::InvitationReady { .. }));

        assert!(matches!(
            room.remove_member("peer2").await,
            Err(RoomError::UnknownMember(_))
        ));
    }

    #[tokio::test]
    async fn closed_link_removes_member() {
        let network = MemoryNetwork::new();
        let bus = EventBus::default();
        let (sink, mut link_events) = mpsc::unbounded_channel();
        let handshake = HostHandshake::new(
            network.transport(HOST_IP),
            PeerIdentity::new("host", "Host"),
            "QX7P",
        );
        let mut room = RoomManager::open(handshake, 2, bus, sink).await.unwrap();

        let (mut joiner, answer) = answer_for(&network, 2, &current_token(&room)).await;
        room.apply_joiner_answer(&answer).await.unwrap();
        joiner.wait_open(Duration::from_secs(5)).await.unwrap();

        joiner.reset();
        let closed = loop {
            let event = link_events.recv().await.unwrap();
            room.handle_link_event(&event).await.unwrap();
            if event.kind == LinkEventKind::Closed {
                break event;
            }
        };
        assert_eq!(closed.peer_id, "peer2");
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn unreachable_member_expires() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 1).await;
        network.partition(HOST_IP, Ipv4Addr::new(10, 0, 0, 2));
        let (_joiner, answer) = answer_for(&network, 2, &current_token(&room)).await;
        room.apply_joiner_answer(&answer).await.unwrap();
        assert!(room.invitation().is_none());

        assert!(room.expire_connecting(Duration::from_secs(60)).await.unwrap().is_empty());
        assert_eq!(room.len(), 1);

        drain(&mut events);
        let expired = room.expire_connecting(Duration::ZERO).await.unwrap();
        assert_eq!(expired[0].id, "peer2");
        assert!(room.is_empty());
        assert!(room.invitation().is_some());
        let seen = drain(&mut events);
        assert_eq!(
            seen[0],
            Event::ConnectionTimeout {
                peer_id: Some("peer2".into())
            }
        );
        assert!(seen.iter().any(|e| matches!(e, Event::PeerLeft { .. })));
    }

    #[tokio::test]
    async fn rejoin_with_same_identity_keeps_new_link() {
        let network = MemoryNetwork::new();
        let (sink, mut link_events) = mpsc::unbounded_channel();
        let handshake = HostHandshake::new(
            network.transport(HOST_IP),
            PeerIdentity::new("host", "Host"),
            "QX7P",
        );
        let mut room = RoomManager::open(handshake, 2, EventBus::default(), sink)
            .await
            .unwrap();

        // The first attempt never connects and the joiner gives up on it.
        network.partition(HOST_IP, Ipv4Addr::new(10, 0, 0, 2));
        let (mut first, answer) = answer_for(&network, 2, &current_token(&room)).await;
        room.apply_joiner_answer(&answer).await.unwrap();
        let stale_link = room.members()[0].link().link_id();
        let err = first.wait_open(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::ConnectionTimeout(_)));
        network.heal();

        // Same identity answers the next invitation.
        let (mut second, answer) = answer_for(&network, 2, &current_token(&room)).await;
        room.apply_joiner_answer(&answer).await.unwrap();
        assert_eq!(room.len(), 1);
        let live_link = room.members()[0].link().link_id();
        assert_ne!(stale_link, live_link);
        second.wait_open(Duration::from_secs(5)).await.unwrap();

        let (mut stale_closed, mut live_opened) = (false, false);
        while !(stale_closed && live_opened) {
            let event = tokio::time::timeout(Duration::from_secs(5), link_events.recv())
                .await
                .unwrap()
                .unwrap();
            stale_closed |= event.link_id == stale_link && event.kind == LinkEventKind::Closed;
            live_opened |= event.link_id == live_link && event.kind == LinkEventKind::Open;
            room.handle_link_event(&event).await.unwrap();
        }
        assert_eq!(room.len(), 1);
        assert!(room.members()[0].link().is_open());
    }

    #[tokio::test]
    async fn failed_reinvitation_keeps_the_join() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 2).await;
        let (_joiner, answer) = answer_for(&network, 2, &current_token(&room)).await;
        drain(&mut events);
        network.set_offline(HOST_IP, true);

        let joined = room.apply_joiner_answer(&answer).await.unwrap();
        assert_eq!(joined.id, "peer2");
        assert_eq!(room.len(), 1);
        assert!(room.invitation().is_none());
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::InvitationReady { .. })));

        assert!(!room.ensure_invitation().await);
        network.set_offline(HOST_IP, false);
        assert!(room.ensure_invitation().await);
        assert!(room.invitation().is_some());
    }

    #[tokio::test]
    async fn unusable_session_in_answer_is_a_decode_error() {
        let network = MemoryNetwork::new();
        let (mut room, mut events) = open_room(&network, 2).await;
        let t1 = current_token(&room);
        let codec = ConnectionCodec::default();
        let offer: HandshakeToken = codec.decode(&t1).unwrap();
        let answer = HandshakeToken::answer(
            &offer.correlation_id,
            &offer.room_tag,
            PeerIdentity::new("peer9", "Player 9"),
            SessionDescription {
                session_id: "s1".into(),
                public_key: offer.session.public_key.clone(),
                candidates: Vec::new(),
            },
        );
        drain(&mut events);

        let err = room
            .apply_joiner_answer(&codec.encode(&answer).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Handshake(HandshakeError::Transport(_))));
        assert!(room.is_empty());
        assert!(matches!(drain(&mut events).first(), Some(Event::DecodeError { .. })));
        assert_ne!(current_token(&room), t1);
    }

    #[tokio::test]
    async fn close_tears_everything_down() {
        let network = MemoryNetwork::new();
        let (mut room, _events) = open_room(&network, 2).await;
        let (_a, answer) = answer_for(&network, 2, &current_token(&room)).await;
        room.apply_joiner_answer(&answer).await.unwrap();

        room.close();
        assert!(room.is_closed());
        assert!(room.is_empty());
        assert!(room.invitation().is_none());
        assert!(matches!(
            room.apply_joiner_answer("anything").await,
            Err(RoomError::Closed)
        ));
    }
}
