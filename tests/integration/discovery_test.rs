// tests/integration/discovery_test.rs

//! Integration tests for the UDP discovery socket

use super::test_helpers::{RECV_TIMEOUT, TestDaemon, tcp_config};
use flomd::config::Config;
use flomd::core::protocol::{Body, FlomCodec, Message, Verb};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

fn discovery_config() -> Config {
    Config {
        multicast_address: Some("127.0.0.1".to_string()),
        multicast_port: 0,
        ..tcp_config()
    }
}

async fn ask(socket: &UdpSocket, target: SocketAddr, datagram: &[u8]) -> Message {
    socket.send_to(datagram, target).await.unwrap();
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a discovery reply")
        .unwrap();
    FlomCodec::decode_datagram(&buf[..len]).unwrap()
}

#[tokio::test]
async fn test_discover_returns_unicast_endpoint() {
    let daemon = TestDaemon::with_config(discovery_config()).await;
    let target = daemon.handle().discovery_addr().unwrap();
    let tcp = daemon.handle().tcp_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = FlomCodec::encode_to_vec(&Message::discover()).unwrap();
    let reply = ask(&socket, target, &request).await;

    assert_eq!(reply.verb, Verb::Discover);
    assert_eq!(reply.step, 16);
    match reply.body {
        Body::DiscoverReply { address, port } => {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(port, tcp.port());
        }
        other => panic!("Expected a discover reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_datagram_is_ignored() {
    let daemon = TestDaemon::with_config(discovery_config()).await;
    let target = daemon.handle().discovery_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"garbage", target).await.unwrap();

    // The daemon keeps serving discovery after the bad datagram.
    let request = FlomCodec::encode_to_vec(&Message::discover()).unwrap();
    let reply = ask(&socket, target, &request).await;
    assert!(matches!(reply.body, Body::DiscoverReply { .. }));
    assert!(!daemon.handle().is_finished());
}

#[tokio::test]
async fn test_discover_on_stream_connection_closes_it() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    client.send(Message::discover()).await;
    assert!(client.is_closed_by_peer().await);
}
