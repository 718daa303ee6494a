//! Access-control deny scenario: a client outside the allowed CIDR set must
//! have its connection closed before any upstream activity, and must never
//! be registered in the client registry.

use std::sync::Arc;
use std::time::Duration;

use relay::access::{Action, AccessRule};
use relay::engine::ForwardingEngine;
use relay::rule::{Rule, RuleProtocol};
use relay::sinks::{CountingMetricsSink, InMemoryAccessPolicy, NullConnectionSink, NullListenerStatusSink};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

fn tcp_rule(id: i64, source_port: u16, target_port: u16) -> Rule {
    Rule {
        id,
        name: format!("it-acl-{id}"),
        source_ip: Some("127.0.0.1".parse().unwrap()),
        source_port,
        target_ip: "127.0.0.1".parse().unwrap(),
        target_port,
        protocol: RuleProtocol::Tcp,
        udp_mode: None,
        enabled: true,
        auto_reconnect: true,
        reconnect_interval_ms: 1000,
        max_reconnect_attempts: 5,
        pool_size: 1,
    }
}

async fn pick_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A deny rule covering 127.0.0.1 means every local client is refused: the
/// listener must accept the TCP handshake (that happens below the access
/// check) but close the socket immediately with no bytes exchanged.
#[tokio::test]
async fn denied_client_connection_is_closed_without_data() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    tokio::spawn(async move {
        // Nobody should ever reach the upstream for a denied rule.
        let _ = upstream.accept().await;
    });

    let source_port = pick_port().await;
    let rule = tcp_rule(1, source_port, upstream_port);

    let policy = InMemoryAccessPolicy::new(Vec::new());
    policy.set_rule_acl(
        rule.id,
        vec![AccessRule {
            id: 1,
            rule_id: Some(rule.id),
            cidr: "127.0.0.1/32".parse().unwrap(),
            action: Action::Deny,
            priority: 1,
            enabled: true,
        }],
    );

    let engine = ForwardingEngine::new(
        Arc::new(policy),
        Arc::new(NullConnectionSink),
        CountingMetricsSink::new(),
        Arc::new(NullListenerStatusSink),
    );
    assert!(engine.activate(rule.clone()).await);

    let addr: std::net::SocketAddr = ("127.0.0.1".parse::<std::net::IpAddr>().unwrap(), source_port).into();
    let mut client = connect_with_retry(addr).await;

    let mut buf = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf)).await;
    match result {
        Ok(Ok(0)) => {} // connection closed cleanly, as expected
        Ok(Ok(n)) => panic!("denied client unexpectedly received {n} bytes"),
        Ok(Err(_)) => {} // reset is also an acceptable closure signal
        Err(_) => panic!("denied client's connection was never closed"),
    }

    engine.deactivate(&rule).await;
}

async fn connect_with_retry(addr: std::net::SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr} after retries");
}
