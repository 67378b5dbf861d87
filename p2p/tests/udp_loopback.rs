//! Full handshake and link traffic over real UDP sockets on loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use cardlink_p2p::{
    HostHandshake, HostState, JoinHandshake, JoinState, LinkEventKind, PeerIdentity, UdpConfig,
    UdpTransport,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn loopback() -> UdpTransport {
    UdpTransport::new(UdpConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..UdpConfig::default()
    })
}

#[tokio::test]
async fn handshake_and_messages_over_udp() {
    let mut host = HostHandshake::new(loopback(), PeerIdentity::new("host", "Host"), "L00P");
    host.create_offer().await.unwrap();
    let offer = host.publish().unwrap().token.clone();

    let mut joiner = JoinHandshake::new(loopback(), PeerIdentity::new("joiner", "Joiner"))
        .expect_room("L00P");
    let (joiner_sink, mut joiner_events) = mpsc::unbounded_channel();
    let answer = joiner.accept_offer(&offer, joiner_sink).await.unwrap();
    assert_eq!(joiner.state(), JoinState::AnswerGenerated);

    let (host_sink, mut host_events) = mpsc::unbounded_channel();
    let link = host.apply_answer(&answer, host_sink).unwrap();
    assert_eq!(host.state(), HostState::Complete);
    assert_eq!(link.id(), "joiner");

    let joined = joiner.wait_open(Duration::from_secs(5)).await.unwrap();
    assert_eq!(joined.id(), "host");
    assert_eq!(joiner.state(), JoinState::Complete);
    link.wait_open(Duration::from_secs(5)).await.unwrap();

    link.send(b"deal".to_vec());
    let received = loop {
        let event = timeout(Duration::from_secs(5), joiner_events.recv())
            .await
            .unwrap()
            .unwrap();
        if let LinkEventKind::Message(bytes) = event.kind {
            break bytes;
        }
    };
    assert_eq!(received, b"deal");

    joiner.link().unwrap().close();
    loop {
        let event = timeout(Duration::from_secs(5), host_events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event.kind, LinkEventKind::Closed) {
            break;
        }
    }
    assert!(!link.is_open());
}
