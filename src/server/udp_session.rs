//! C6 — UDP point-to-point session manager. One inbound socket per rule;
//! each distinct client address gets its own outbound ephemeral socket so
//! that replies coming back from the target can be routed to the right
//! client without a shared port number colliding across clients.
//!
//! Follows a DashMap-keyed-by-client-address, reader-task-per-mapping,
//! idle-sweep shape adapted for a fixed per-rule target instead of a
//! negotiated one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
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
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

struct Session {
    connection_id: Uuid,
    connected_at: DateTime<Utc>,
    outbound: Arc<UdpSocket>,
    last_active_at: std::sync::Mutex<std::time::Instant>,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    packets_rx: AtomicU64,
    packets_tx: AtomicU64,
}

impl Session {
    fn touch(&self) {
        *self.last_active_at.lock().unwrap() = std::time::Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active_at.lock().unwrap().elapsed()
    }
}

#[derive(Default)]
pub struct SessionStats {
    pub total: AtomicU64,
    pub expired: AtomicU64,
}

pub struct UdpSessionManager {
    rule: Rule,
    inbound: Arc<UdpSocket>,
    sessions: DashMap<SocketAddr, Arc<Session>>,
    stats: SessionStats,
    connection_sink: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

impl UdpSessionManager {
    pub async fn bind(
        rule: Rule,
        connection_sink: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
        listener_status: Arc<dyn ListenerStatusSink>,
    ) -> crate::utils::error::Result<Arc<Self>> {
        let addr = SocketAddr::new(rule.bind_ip(), rule.source_port);
        let inbound = Arc::new(UdpSocket::bind(addr).await?);

        listener_status
            .create_listener(rule.id, rule.source_port, RuleProtocol::Udp)
            .await;
        listener_status
            .set_waiting_for_clients(rule.id, RuleProtocol::Udp)
            .await;

        let manager = Arc::new(Self {
            rule,
            inbound,
            sessions: DashMap::new(),
            stats: SessionStats::default(),
            connection_sink,
            metrics,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(manager.clone().inbound_loop());
        tokio::spawn(manager.clone().sweeper());

        Ok(manager)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inbound.local_addr()
    }

    pub fn current(&self) -> usize {
        self.sessions.len()
    }

    pub fn total(&self) -> u64 {
        self.stats.total.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.stats.expired.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn inbound_loop(self: Arc<Self>) {
        let target = SocketAddr::new(self.rule.target_ip, self.rule.target_port);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, client_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.inbound.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(rule_id = self.rule.id, %err, "udp recv failed");
                        continue;
                    }
                },
            };

            let session = self.session_for(client_addr).await;
            session.touch();
            if let Err(err) = session.outbound.send_to(&buf[..n], target).await {
                self.metrics.inc_transfer_errors();
                debug!(rule_id = self.rule.id, %client_addr, %err, "udp forward to target failed");
                continue;
            }
            self.connection_sink
                .update_traffic_stats(session.connection_id, 0, n as u64, 0, 1)
                .await;
            session.bytes_tx.fetch_add(n as u64, Ordering::Relaxed);
            session.packets_tx.fetch_add(1, Ordering::Relaxed);
            self.metrics.add_bytes_transferred(n as u64);
        }
    }

    /// First-writer-wins insertion: if a concurrent datagram for the same
    /// client raced us here, reuse whichever session landed first.
    async fn session_for(self: &Arc<Self>, client_addr: SocketAddr) -> Arc<Session> {
        if let Some(existing) = self.sessions.get(&client_addr) {
            return existing.clone();
        }

        let bind_addr = SocketAddr::new(self.rule.bind_ip(), 0);
        let outbound = match UdpSocket::bind(bind_addr).await {
            Ok(sock) => Arc::new(sock),
            Err(err) => {
                warn!(rule_id = self.rule.id, %err, "failed to bind outbound udp session socket, dropping datagram");
                return Arc::new(Session {
                    connection_id: Uuid::new_v4(),
                    connected_at: Utc::now(),
                    outbound: Arc::new(UdpSocket::bind("0.0.0.0:0").await.unwrap()),
                    last_active_at: std::sync::Mutex::new(std::time::Instant::now()),
                    bytes_rx: AtomicU64::new(0),
                    bytes_tx: AtomicU64::new(0),
                    packets_rx: AtomicU64::new(0),
                    packets_tx: AtomicU64::new(0),
                });
            }
        };

        let mut record = ConnectionRecord::new_connecting(
            self.rule.id,
            RuleProtocol::Udp,
            self.rule.source_port,
            client_addr.ip(),
            client_addr.port(),
        );
        record.status = ConnectionStatus::Connected;
        let connection_id = record.connection_id;
        let connected_at = record.connected_at;

        let session = Arc::new(Session {
            connection_id,
            connected_at,
            outbound,
            last_active_at: std::sync::Mutex::new(std::time::Instant::now()),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            packets_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
        });

        let session = match self.sessions.entry(client_addr) {
            Entry::Occupied(existing) => return existing.get().clone(),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                session
            }
        };

        self.connection_sink.save(record).await;
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_active_connections();

        tokio::spawn(
            self.clone()
                .reply_loop(client_addr, session.outbound.clone()),
        );

        session
    }

    /// Reads datagrams arriving on this client's dedicated outbound socket
    /// (i.e. the target's replies) and relays them back to the original
    /// client address via the rule's shared inbound socket.
    async fn reply_loop(self: Arc<Self>, client_addr: SocketAddr, outbound: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, _from) = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = outbound.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(_) => return,
                },
            };

            if let Some(entry) = self.sessions.get(&client_addr) {
                let session = entry.value().clone();
                drop(entry);
                session.touch();
                if self.inbound.send_to(&buf[..n], client_addr).await.is_ok() {
                    self.connection_sink
                        .update_traffic_stats(session.connection_id, n as u64, 0, 1, 0)
                        .await;
                    session.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                    session.packets_rx.fetch_add(1, Ordering::Relaxed);
                    self.metrics.add_bytes_transferred(n as u64);
                } else {
                    self.metrics.inc_transfer_errors();
                }
            } else {
                return;
            }
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
                .sessions
                .iter()
                .filter(|entry| entry.value().idle_for() > SESSION_IDLE_TIMEOUT)
                .map(|entry| *entry.key())
                .collect();

            for addr in expired {
                if let Some((_, session)) = self.sessions.remove(&addr) {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                    self.metrics.dec_active_connections();

                    // UDP sessions are retained, not deleted, on eviction: the
                    // record transitions to DISCONNECTED so the UI can still
                    // show it. Only TCP disconnects delete the record.
                    let mut record = ConnectionRecord::new_connecting(
                        self.rule.id,
                        RuleProtocol::Udp,
                        self.rule.source_port,
                        addr.ip(),
                        addr.port(),
                    );
                    record.connection_id = session.connection_id;
                    record.connected_at = session.connected_at;
                    record.status = ConnectionStatus::Disconnected;
                    record.disconnected_at = Some(Utc::now());
                    record.bytes_rx = session.bytes_rx.load(Ordering::Relaxed);
                    record.bytes_tx = session.bytes_tx.load(Ordering::Relaxed);
                    record.packets_rx = session.packets_rx.load(Ordering::Relaxed);
                    record.packets_tx = session.packets_tx.load(Ordering::Relaxed);
                    record.last_active_at = record.disconnected_at.unwrap();
                    self.connection_sink.update(record).await;

                    info!(rule_id = self.rule.id, %addr, "udp session evicted by idle sweep");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::{CountingMetricsSink, NullListenerStatusSink, RecordingConnectionSink};
    use tokio::time::timeout;

    fn test_rule(id: i64, target_port: u16) -> Rule {
        Rule {
            id,
            name: format!("udp-test-{id}"),
            source_ip: Some("127.0.0.1".parse().unwrap()),
            source_port: 0,
            target_ip: "127.0.0.1".parse().unwrap(),
            target_port,
            protocol: RuleProtocol::Udp,
            udp_mode: Some(crate::rule::UdpMode::PointToPoint),
            enabled: true,
            auto_reconnect: true,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 10,
            pool_size: 1,
        }
    }

    #[tokio::test]
    async fn single_datagram_creates_one_session_and_echoes_back() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match echo.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let _ = echo.send_to(&buf[..n], from).await;
                    }
                    Err(_) => return,
                }
            }
        });

        let rule = test_rule(1, target_port);
        let metrics = CountingMetricsSink::new();
        let manager = UdpSessionManager::bind(
            rule,
            Arc::new(RecordingConnectionSink::new()),
            metrics,
            Arc::new(NullListenerStatusSink),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"A", manager.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, _from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("expected reply before timeout")
            .unwrap();
        assert_eq!(&buf[..n], b"A");
        assert_eq!(manager.current(), 1);
        assert_eq!(manager.total(), 1);
    }
}
