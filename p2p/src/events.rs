use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Connection, room and game notifications raised by the core for the UI layer.
///
/// The core never renders these; a front end subscribes to the bus and decides
/// how to surface each one (toast, status line, log entry).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    InvitationReady {
        room_tag: String,
        token: String,
    },
    InvitationCleared {
        room_tag: String,
    },
    PeerJoined {
        room_tag: String,
        peer_id: String,
        display_name: String,
    },
    PeerLeft {
        room_tag: String,
        peer_id: String,
    },
    RoomFull {
        room_tag: String,
        capacity: usize,
    },
    LinkOpened {
        peer_id: String,
    },
    LinkClosed {
        peer_id: String,
    },
    ConnectionTimeout {
        peer_id: Option<String>,
    },
    DecodeError {
        reason: String,
    },
    StaleAnswer {
        room_tag: String,
    },
    GameStarted {
        players: usize,
    },
    ActionRejected {
        peer_id: String,
        reason: String,
    },
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based notification channel shared by room, handshake and replication code.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send `event` to every current subscriber and return how many got it.
    pub fn emit(&self, event: Event) -> usize {
        tracing::debug!(?event, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn joined_peer_is_announced() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::PeerJoined {
            room_tag: "QX7P".into(),
            peer_id: "a1b2c3d4".into(),
            display_name: "Alice".into(),
        });

        let event = rx.recv().await.unwrap();
        match event {
            Event::PeerJoined {
                room_tag,
                peer_id,
                display_name,
            } => {
                assert_eq!(room_tag, "QX7P");
                assert_eq!(peer_id, "a1b2c3d4");
                assert_eq!(display_name, "Alice");
            }
            _ => panic!("unexpected event variant"),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let bus = EventBus::default();
        let mut ui = bus.subscribe();
        let mut log = bus.subscribe();

        let delivered = bus.emit(Event::RoomFull {
            room_tag: "QX7P".into(),
            capacity: 3,
        });
        assert_eq!(delivered, 2);
        assert_eq!(ui.recv().await.unwrap(), log.recv().await.unwrap());
    }

    #[test]
    fn emitting_into_the_void_is_fine() {
        let bus = EventBus::default();
        let count = bus.emit(Event::ConnectionTimeout { peer_id: None });
        assert_eq!(count, 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(Event::StaleAnswer {
            room_tag: "QX7P".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "StaleAnswer");
        assert_eq!(json["room_tag"], "QX7P");
    }
}
