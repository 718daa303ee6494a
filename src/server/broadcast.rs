//! C7 — UDP broadcast engine. Two sockets per rule: a downstream socket
//! serving the ASCII subscribe/heartbeat control protocol plus
//! downstream-originated data, and an upstream socket receiving data to
//! broadcast. No upstream connection pool here — broadcast rules skip C3
//! entirely per the forwarding engine's dispatch table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rule::{Rule, RuleProtocol};
use crate::sinks::{
    ConnectionRecord, ConnectionSink, ConnectionStatus, ListenerStatusSink, MetricsSink,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);

mod control {
    //! Exact-literal ASCII control protocol. No binary framing, no regex —
    //! this wire format is a handful of fixed tokens.
    pub const SUBSCRIBE: &[u8] = b"SUBSCRIBE";
    pub const UNSUBSCRIBE: &[u8] = b"UNSUBSCRIBE";
    pub const HEARTBEAT: &[u8] = b"HEARTBEAT";

    pub const SUBSCRIBED: &[u8] = b"SUBSCRIBED";
    pub const UNSUBSCRIBED: &[u8] = b"UNSUBSCRIBED";
    pub const HEARTBEAT_ACK: &[u8] = b"HEARTBEAT_ACK";
    pub const AUTO_SUBSCRIBED: &[u8] = b"AUTO_SUBSCRIBED";

    pub enum Command {
        Subscribe,
        Unsubscribe,
        Heartbeat,
        Data,
    }

    pub fn parse(payload: &[u8]) -> Command {
        match payload {
            SUBSCRIBE => Command::Subscribe,
            UNSUBSCRIBE => Command::Unsubscribe,
            HEARTBEAT => Command::Heartbeat,
            _ => Command::Data,
        }
    }
}

struct Client {
    connection_id: Uuid,
    connected_at: DateTime<Utc>,
    local_port: u16,
    last_heartbeat_at: std::sync::Mutex<std::time::Instant>,
}

impl Client {
    fn touch(&self) {
        *self.last_heartbeat_at.lock().unwrap() = std::time::Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_heartbeat_at.lock().unwrap().elapsed()
    }
}

#[derive(Default)]
pub struct BroadcastStats {
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
}

pub struct BroadcastEngine {
    rule: Rule,
    downstream: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    subscribers: DashMap<SocketAddr, Arc<Client>>,
    senders: DashMap<SocketAddr, Arc<Client>>,
    stats: BroadcastStats,
    connection_sink: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

impl BroadcastEngine {
    pub async fn bind(
        rule: Rule,
        connection_sink: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
        listener_status: Arc<dyn ListenerStatusSink>,
    ) -> crate::utils::error::Result<Arc<Self>> {
        let downstream_addr = SocketAddr::new(rule.bind_ip(), rule.source_port);
        let upstream_addr = SocketAddr::new(rule.bind_ip(), rule.target_port);
        let downstream = Arc::new(UdpSocket::bind(downstream_addr).await?);
        let upstream = Arc::new(UdpSocket::bind(upstream_addr).await?);

        listener_status
            .create_listener(rule.id, rule.source_port, RuleProtocol::Udp)
            .await;
        listener_status
            .set_waiting_for_clients(rule.id, RuleProtocol::Udp)
            .await;

        let engine = Arc::new(Self {
            rule,
            downstream,
            upstream,
            subscribers: DashMap::new(),
            senders: DashMap::new(),
            stats: BroadcastStats::default(),
            connection_sink,
            metrics,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(engine.clone().downstream_loop());
        tokio::spawn(engine.clone().upstream_loop());
        tokio::spawn(engine.clone().sweeper());

        Ok(engine)
    }

    pub fn downstream_addr(&self) -> std::io::Result<SocketAddr> {
        self.downstream.local_addr()
    }

    pub fn upstream_addr(&self) -> std::io::Result<SocketAddr> {
        self.upstream.local_addr()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// §6 read-only view: upstream-originated bytes received for fan-out.
    pub fn bytes_rx(&self) -> u64 {
        self.stats.bytes_rx.load(Ordering::Relaxed)
    }

    /// §6 read-only view: bytes actually written out to subscribers
    /// (`payloadSize x subscriberCount`, per the fan-out discipline).
    pub fn bytes_tx(&self) -> u64 {
        self.stats.bytes_tx.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn downstream_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.downstream.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(rule_id = self.rule.id, %err, "broadcast downstream recv failed");
                        continue;
                    }
                },
            };

            let payload = &buf[..n];
            match control::parse(payload) {
                control::Command::Subscribe => {
                    self.subscribe(from).await;
                    self.reply(&self.downstream, from, control::SUBSCRIBED).await;
                }
                control::Command::Unsubscribe => {
                    self.unsubscribe(from).await;
                    self.reply(&self.downstream, from, control::UNSUBSCRIBED)
                        .await;
                }
                control::Command::Heartbeat => {
                    if let Some(client) = self.subscribers.get(&from) {
                        client.touch();
                    }
                    self.reply(&self.downstream, from, control::HEARTBEAT_ACK)
                        .await;
                }
                control::Command::Data => {
                    let is_new = !self.subscribers.contains_key(&from);
                    self.subscribe(from).await;
                    if is_new {
                        self.reply(&self.downstream, from, control::AUTO_SUBSCRIBED)
                            .await;
                    }
                    self.fan_out_to_senders(payload).await;
                }
            }
        }
    }

    async fn upstream_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.upstream.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(rule_id = self.rule.id, %err, "broadcast upstream recv failed");
                        continue;
                    }
                },
            };

            self.register_sender(from).await;
            self.stats.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
            self.fan_out_to_subscribers(&buf[..n]).await;
        }
    }

    async fn subscribe(&self, addr: SocketAddr) {
        if let Some(client) = self.subscribers.get(&addr) {
            client.touch();
            return;
        }

        let mut record = ConnectionRecord::new_connecting(
            self.rule.id,
            RuleProtocol::Udp,
            self.rule.source_port,
            addr.ip(),
            addr.port(),
        );
        record.status = ConnectionStatus::Connected;
        let connection_id = record.connection_id;
        let connected_at = record.connected_at;
        self.connection_sink.save(record).await;
        self.metrics.inc_active_connections();

        self.subscribers.insert(
            addr,
            Arc::new(Client {
                connection_id,
                connected_at,
                local_port: self.rule.source_port,
                last_heartbeat_at: std::sync::Mutex::new(std::time::Instant::now()),
            }),
        );
    }

    async fn unsubscribe(&self, addr: SocketAddr) {
        if let Some((_, client)) = self.subscribers.remove(&addr) {
            self.metrics.dec_active_connections();
            self.disconnect_record(addr, &client).await;
        }
    }

    /// Subscriber/sender eviction retains the record as DISCONNECTED rather
    /// than deleting it, matching the UDP session manager's asymmetry with
    /// TCP's delete-on-disconnect.
    async fn disconnect_record(&self, addr: SocketAddr, client: &Client) {
        let mut record = ConnectionRecord::new_connecting(
            self.rule.id,
            RuleProtocol::Udp,
            client.local_port,
            addr.ip(),
            addr.port(),
        );
        record.connection_id = client.connection_id;
        record.connected_at = client.connected_at;
        record.status = ConnectionStatus::Disconnected;
        record.disconnected_at = Some(Utc::now());
        record.last_active_at = record.disconnected_at.unwrap();
        self.connection_sink.update(record).await;
    }

    async fn register_sender(&self, addr: SocketAddr) {
        if self.senders.contains_key(&addr) {
            if let Some(client) = self.senders.get(&addr) {
                client.touch();
            }
            return;
        }
        let mut record = ConnectionRecord::new_connecting(
            self.rule.id,
            RuleProtocol::Udp,
            self.rule.target_port,
            addr.ip(),
            addr.port(),
        );
        record.status = ConnectionStatus::Connected;
        let connection_id = record.connection_id;
        let connected_at = record.connected_at;
        self.connection_sink.save(record).await;
        self.senders.insert(
            addr,
            Arc::new(Client {
                connection_id,
                connected_at,
                local_port: self.rule.target_port,
                last_heartbeat_at: std::sync::Mutex::new(std::time::Instant::now()),
            }),
        );
    }

    /// Fan out upstream-originated data to every downstream subscriber.
    /// Byte counters accrue as `payloadSize × subscriberCount`.
    async fn fan_out_to_subscribers(&self, payload: &[u8]) {
        let subscribers: Vec<SocketAddr> = self.subscribers.iter().map(|e| *e.key()).collect();
        for addr in subscribers {
            match self.downstream.send_to(payload, addr).await {
                Ok(_) => {
                    self.stats
                        .bytes_tx
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    self.metrics.add_bytes_transferred(payload.len() as u64);
                }
                Err(err) => {
                    // Transient: write failure does not remove the
                    // subscriber; eviction is driven solely by heartbeat
                    // timeout.
                    self.metrics.inc_transfer_errors();
                    debug!(rule_id = self.rule.id, %addr, %err, "broadcast write to subscriber failed");
                }
            }
        }
    }

    /// Forward a non-control downstream payload to every registered upstream
    /// sender (used by the "any other payload" auto-subscribe path).
    async fn fan_out_to_senders(&self, payload: &[u8]) {
        let senders: Vec<SocketAddr> = self.senders.iter().map(|e| *e.key()).collect();
        for addr in senders {
            if let Err(err) = self.upstream.send_to(payload, addr).await {
                self.metrics.inc_transfer_errors();
                debug!(rule_id = self.rule.id, %addr, %err, "broadcast forward to sender failed");
            }
        }
    }

    async fn reply(&self, socket: &UdpSocket, to: SocketAddr, payload: &[u8]) {
        if let Err(err) = socket.send_to(payload, to).await {
            debug!(rule_id = self.rule.id, %to, %err, "broadcast control reply failed");
        }
    }

    async fn sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let expired: Vec<SocketAddr> = self
                .subscribers
                .iter()
                .filter(|e| e.value().idle_for() > HEARTBEAT_TIMEOUT)
                .map(|e| *e.key())
                .collect();

            let mut evicted: HashMap<SocketAddr, Arc<Client>> = HashMap::new();
            for addr in expired {
                if let Some((_, client)) = self.subscribers.remove(&addr) {
                    evicted.insert(addr, client);
                }
            }
            for (addr, client) in evicted {
                self.metrics.dec_active_connections();
                self.disconnect_record(addr, &client).await;
                info!(rule_id = self.rule.id, %addr, "broadcast subscriber evicted by heartbeat timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::{CountingMetricsSink, NullListenerStatusSink, RecordingConnectionSink};
    use tokio::time::{timeout, Duration as TokioDuration};

    fn test_rule(id: i64) -> Rule {
        Rule {
            id,
            name: format!("broadcast-test-{id}"),
            source_ip: Some("127.0.0.1".parse().unwrap()),
            source_port: 0,
            target_ip: "127.0.0.1".parse().unwrap(),
            target_port: 0,
            protocol: RuleProtocol::Udp,
            udp_mode: Some(crate::rule::UdpMode::Broadcast),
            enabled: true,
            auto_reconnect: false,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 0,
            pool_size: 1,
        }
    }

    #[tokio::test]
    async fn subscribe_then_fan_out_then_unsubscribe() {
        let rule = test_rule(1);
        let engine = BroadcastEngine::bind(
            rule,
            Arc::new(RecordingConnectionSink::new()),
            CountingMetricsSink::new(),
            Arc::new(NullListenerStatusSink),
        )
        .await
        .unwrap();

        let downstream_addr = engine.downstream_addr().unwrap();
        let upstream_addr = engine.upstream_addr().unwrap();

        let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        c1.send_to(control::SUBSCRIBE, downstream_addr)
            .await
            .unwrap();
        c2.send_to(control::SUBSCRIBE, downstream_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let (n, _) = timeout(TokioDuration::from_secs(1), c1.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], control::SUBSCRIBED);
        let (n, _) = timeout(TokioDuration::from_secs(1), c2.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], control::SUBSCRIBED);

        assert_eq!(engine.subscriber_count(), 2);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"payload", upstream_addr).await.unwrap();

        let (n, _) = timeout(TokioDuration::from_secs(1), c1.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"payload");
        let (n, _) = timeout(TokioDuration::from_secs(1), c2.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"payload");

        c1.send_to(control::UNSUBSCRIBE, downstream_addr)
            .await
            .unwrap();
        let (n, _) = timeout(TokioDuration::from_secs(1), c1.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], control::UNSUBSCRIBED);

        sender.send_to(b"again", upstream_addr).await.unwrap();
        let result = timeout(TokioDuration::from_millis(300), c1.recv_from(&mut buf)).await;
        assert!(result.is_err(), "unsubscribed client must receive nothing further");

        let (n, _) = timeout(TokioDuration::from_secs(1), c2.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"again");
    }
}
