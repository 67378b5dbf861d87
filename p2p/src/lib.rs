pub mod channel;
pub mod codec;
pub mod crypto;
pub mod events;
pub mod game;
pub mod handshake;
pub mod link;
pub mod replicator;
pub mod room;
pub mod signal;
pub mod transport;

pub use channel::{ChannelError, DatagramCipher, KeyExchange};
pub use codec::{CodecError, ConnectionCodec, MAX_TOKEN_LEN};
pub use crypto::{CryptoError, PeerIdentity};
pub use events::{Event, EventBus};
pub use handshake::{
    HandshakeError, HostHandshake, HostState, Invitation, JoinHandshake, JoinState,
};
pub use link::{LinkError, LinkEvent, LinkEventKind, LinkState, PeerLink};
pub use replicator::{
    ControlSignal, Envelope, HostReplicator, JoinerReplicator, Received, ReplicatorError,
    TurnEngine,
};
pub use room::{Member, RoomError, RoomInfo, RoomManager, MAX_CAPACITY};
pub use signal::{HandshakeToken, SessionDescription, SignalError, TokenRole};
pub use transport::{
    LinkConfig, MemoryNetwork, MemoryTransport, Transport, TransportError, UdpConfig,
    UdpTransport,
};
