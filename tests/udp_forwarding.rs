//! UDP end-to-end scenarios: point-to-point session creation, and broadcast
//! subscribe/fan-out across the engine's public activation surface rather
//! than the component directly (component-level coverage already lives in
//! `server::udp_session`/`server::broadcast`'s own unit tests).

use std::sync::Arc;
use std::time::Duration;

use relay::engine::ForwardingEngine;
use relay::rule::{Rule, RuleProtocol, UdpMode};
use relay::sinks::{
    AllowAllAccessPolicy, CountingMetricsSink, NullConnectionSink, NullListenerStatusSink,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn new_engine() -> Arc<ForwardingEngine> {
    ForwardingEngine::new(
        Arc::new(AllowAllAccessPolicy),
        Arc::new(NullConnectionSink),
        CountingMetricsSink::new(),
        Arc::new(NullListenerStatusSink),
    )
}

async fn pick_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn point_to_point_rule(id: i64, source_port: u16, target_port: u16) -> Rule {
    Rule {
        id,
        name: format!("it-udp-{id}"),
        source_ip: Some("127.0.0.1".parse().unwrap()),
        source_port,
        target_ip: "127.0.0.1".parse().unwrap(),
        target_port,
        protocol: RuleProtocol::Udp,
        udp_mode: Some(UdpMode::PointToPoint),
        enabled: true,
        auto_reconnect: false,
        reconnect_interval_ms: 1000,
        max_reconnect_attempts: 0,
        pool_size: 1,
    }
}

/// A single datagram creates exactly one session and the target's reply is
/// relayed back through the rule's well-known source address.
#[tokio::test]
async fn udp_session_is_created_and_echoes_back() {
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            match target.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let _ = target.send_to(&buf[..n], from).await;
                }
                Err(_) => return,
            }
        }
    });

    let source_port = pick_port().await;
    let engine = new_engine().await;
    let rule = point_to_point_rule(1, source_port, target_port);
    assert!(engine.activate(rule.clone()).await);

    let relay_addr: std::net::SocketAddr = ("127.0.0.1".parse::<std::net::IpAddr>().unwrap(), source_port).into();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", relay_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("expected a reply before timeout")
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, relay_addr, "reply must appear to come from the relay's well-known address");

    engine.deactivate(&rule).await;
}

fn broadcast_rule(id: i64, source_port: u16, target_port: u16) -> Rule {
    Rule {
        id,
        name: format!("it-broadcast-{id}"),
        source_ip: Some("127.0.0.1".parse().unwrap()),
        source_port,
        target_ip: "127.0.0.1".parse().unwrap(),
        target_port,
        protocol: RuleProtocol::Udp,
        udp_mode: Some(UdpMode::Broadcast),
        enabled: true,
        auto_reconnect: false,
        reconnect_interval_ms: 1000,
        max_reconnect_attempts: 0,
        pool_size: 1,
    }
}

/// Two clients subscribe on the downstream socket; data arriving on the
/// upstream socket fans out to both.
#[tokio::test]
async fn broadcast_subscribe_then_fan_out() {
    let source_port = pick_port().await;
    let target_port = pick_port().await;
    let engine = new_engine().await;
    let rule = broadcast_rule(1, source_port, target_port);
    assert!(engine.activate(rule.clone()).await);

    let downstream_addr: std::net::SocketAddr =
        ("127.0.0.1".parse::<std::net::IpAddr>().unwrap(), source_port).into();
    let upstream_addr: std::net::SocketAddr =
        ("127.0.0.1".parse::<std::net::IpAddr>().unwrap(), target_port).into();

    let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    c1.send_to(b"SUBSCRIBE", downstream_addr).await.unwrap();
    c2.send_to(b"SUBSCRIBE", downstream_addr).await.unwrap();

    let mut buf = [0u8; 32];
    let (n, _) = timeout(Duration::from_secs(1), c1.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"SUBSCRIBED");
    let (n, _) = timeout(Duration::from_secs(1), c2.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"SUBSCRIBED");

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"news", upstream_addr).await.unwrap();

    let (n, _) = timeout(Duration::from_secs(1), c1.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"news");
    let (n, _) = timeout(Duration::from_secs(1), c2.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"news");

    engine.deactivate(&rule).await;
}
