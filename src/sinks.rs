//! C9 — external collaborator contracts and the connection-record value type.
//!
//! The core never retains a collaborator's returned data beyond the call that
//! produced it and never awaits these on a path that must not block (see
//! propagation policy): every method here is fire-and-forget from the core's
//! perspective, even though the trait signatures are `async fn` so a real
//! collaborator can do I/O (HTTP call, DB write) behind them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::rule::RuleProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Timeout,
}

/// A snapshot of one logical connection (TCP client, UDP session, or
/// broadcast subscriber/sender). `bytes_rx/tx` and `packets_rx/tx` are
/// monotonically non-decreasing for the life of the record; `status`
/// transitions CONNECTING -> CONNECTED -> {DISCONNECTED,ERROR,TIMEOUT} only
/// ever move forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: Uuid,
    pub rule_id: i64,
    pub protocol: RuleProtocol,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub last_active_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl ConnectionRecord {
    pub fn new_connecting(
        rule_id: i64,
        protocol: RuleProtocol,
        local_port: u16,
        remote_address: IpAddr,
        remote_port: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: Uuid::new_v4(),
            rule_id,
            protocol,
            local_port,
            remote_address,
            remote_port,
            status: ConnectionStatus::Connecting,
            connected_at: now,
            disconnected_at: None,
            bytes_rx: 0,
            bytes_tx: 0,
            packets_rx: 0,
            packets_tx: 0,
            last_active_at: now,
            error_message: None,
        }
    }
}

/// (a) a way to enumerate and observe rule changes, narrowed to the hot-path
/// read the decider needs: the effective, already-merged (`global ∪
/// per-rule`) CIDR rule set for a given forwarding rule.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn effective_rules(&self, rule_id: i64) -> Vec<crate::access::AccessRule>;
}

/// (d) a sink to persist connection records. Calls are fire-and-forget;
/// the core does not await the result on the data path.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn save(&self, record: ConnectionRecord);
    async fn update(&self, record: ConnectionRecord);
    async fn update_traffic_stats(
        &self,
        connection_id: Uuid,
        rx_bytes: u64,
        tx_bytes: u64,
        rx_pkts: u64,
        tx_pkts: u64,
    );
    async fn delete(&self, connection_id: Uuid);
}

/// (c) a sink to emit counters and connection lifecycle events.
pub trait MetricsSink: Send + Sync {
    fn inc_active_connections(&self);
    fn dec_active_connections(&self);
    fn inc_total_connections(&self);
    fn inc_connection_errors(&self);
    fn inc_transfer_errors(&self);
    fn add_bytes_transferred(&self, n: u64);
    fn inc_forwarding_rule_count(&self);
    fn dec_forwarding_rule_count(&self);
}

/// §4.8 — the only way external observers learn of listener health.
#[async_trait]
pub trait ListenerStatusSink: Send + Sync {
    async fn create_listener(&self, rule_id: i64, port: u16, protocol: RuleProtocol);
    async fn set_waiting_for_clients(&self, rule_id: i64, protocol: RuleProtocol);
    async fn on_client_connected(&self, rule_id: i64, protocol: RuleProtocol);
    async fn on_client_disconnected(&self, rule_id: i64, protocol: RuleProtocol);
    async fn stop_listener(&self, rule_id: i64);
}

// ---------------------------------------------------------------------------
// In-memory fakes. Public (not test-only) so embedders can smoke-test the
// engine without wiring a real persistence/metrics/admin stack — a
// store-less, embeddable default for every collaborator.
// ---------------------------------------------------------------------------

/// Allows everything; used when no access policy collaborator is wired.
pub struct AllowAllAccessPolicy;

#[async_trait]
impl AccessPolicy for AllowAllAccessPolicy {
    async fn effective_rules(&self, _rule_id: i64) -> Vec<crate::access::AccessRule> {
        Vec::new()
    }
}

/// Serves a fixed, in-memory rule table; useful for tests and for embedding
/// without a database-backed policy store.
pub struct InMemoryAccessPolicy {
    global: Vec<crate::access::AccessRule>,
    per_rule: dashmap::DashMap<i64, Vec<crate::access::AccessRule>>,
}

impl InMemoryAccessPolicy {
    pub fn new(global: Vec<crate::access::AccessRule>) -> Self {
        Self {
            global,
            per_rule: dashmap::DashMap::new(),
        }
    }

    pub fn set_rule_acl(&self, rule_id: i64, rules: Vec<crate::access::AccessRule>) {
        self.per_rule.insert(rule_id, rules);
    }
}

#[async_trait]
impl AccessPolicy for InMemoryAccessPolicy {
    async fn effective_rules(&self, rule_id: i64) -> Vec<crate::access::AccessRule> {
        let mut rules = self.global.clone();
        if let Some(extra) = self.per_rule.get(&rule_id) {
            rules.extend(extra.value().clone());
        }
        rules
    }
}

/// Drops every record; the default when no persistence collaborator is wired.
pub struct NullConnectionSink;

#[async_trait]
impl ConnectionSink for NullConnectionSink {
    async fn save(&self, _record: ConnectionRecord) {}
    async fn update(&self, _record: ConnectionRecord) {}
    async fn update_traffic_stats(&self, _: Uuid, _: u64, _: u64, _: u64, _: u64) {}
    async fn delete(&self, _connection_id: Uuid) {}
}

/// Retains every record it is given, keyed by connection id; handy for tests
/// that assert on the final recorded state of a connection.
#[derive(Default)]
pub struct RecordingConnectionSink {
    records: dashmap::DashMap<Uuid, ConnectionRecord>,
}

impl RecordingConnectionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<ConnectionRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ConnectionSink for RecordingConnectionSink {
    async fn save(&self, record: ConnectionRecord) {
        self.records.insert(record.connection_id, record);
    }

    async fn update(&self, record: ConnectionRecord) {
        self.records.insert(record.connection_id, record);
    }

    async fn update_traffic_stats(
        &self,
        connection_id: Uuid,
        rx_bytes: u64,
        tx_bytes: u64,
        rx_pkts: u64,
        tx_pkts: u64,
    ) {
        if let Some(mut r) = self.records.get_mut(&connection_id) {
            r.bytes_rx += rx_bytes;
            r.bytes_tx += tx_bytes;
            r.packets_rx += rx_pkts;
            r.packets_tx += tx_pkts;
            r.last_active_at = Utc::now();
        }
    }

    async fn delete(&self, connection_id: Uuid) {
        self.records.remove(&connection_id);
    }
}

/// Lock-free counters; the default metrics sink when no external collector
/// is wired (e.g. no Prometheus exporter embedding this core).
#[derive(Default)]
pub struct CountingMetricsSink {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub connection_errors: AtomicU64,
    pub transfer_errors: AtomicU64,
    pub bytes_transferred: AtomicU64,
    pub forwarding_rule_count: AtomicU64,
}

impl CountingMetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MetricsSink for CountingMetricsSink {
    fn inc_active_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }
    fn dec_active_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
    fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_connection_errors(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_transfer_errors(&self) {
        self.transfer_errors.fetch_add(1, Ordering::Relaxed);
    }
    fn add_bytes_transferred(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }
    fn inc_forwarding_rule_count(&self) {
        self.forwarding_rule_count.fetch_add(1, Ordering::Relaxed);
    }
    fn dec_forwarding_rule_count(&self) {
        self.forwarding_rule_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Discards listener-state transitions; default when no admin API/push
/// channel is wired.
pub struct NullListenerStatusSink;

#[async_trait]
impl ListenerStatusSink for NullListenerStatusSink {
    async fn create_listener(&self, _rule_id: i64, _port: u16, _protocol: RuleProtocol) {}
    async fn set_waiting_for_clients(&self, _rule_id: i64, _protocol: RuleProtocol) {}
    async fn on_client_connected(&self, _rule_id: i64, _protocol: RuleProtocol) {}
    async fn on_client_disconnected(&self, _rule_id: i64, _protocol: RuleProtocol) {}
    async fn stop_listener(&self, _rule_id: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Action, AccessRule};

    #[tokio::test]
    async fn in_memory_access_policy_merges_global_and_per_rule() {
        let global = vec![AccessRule {
            id: 1,
            rule_id: None,
            cidr: "10.0.0.0/8".parse().unwrap(),
            action: Action::Deny,
            priority: 10,
            enabled: true,
        }];
        let policy = InMemoryAccessPolicy::new(global);
        policy.set_rule_acl(
            5,
            vec![AccessRule {
                id: 2,
                rule_id: Some(5),
                cidr: "0.0.0.0/0".parse().unwrap(),
                action: Action::Allow,
                priority: 20,
                enabled: true,
            }],
        );

        let rules = policy.effective_rules(5).await;
        assert_eq!(rules.len(), 2);
        let other = policy.effective_rules(6).await;
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn recording_connection_sink_tracks_traffic() {
        let sink = RecordingConnectionSink::new();
        let record = ConnectionRecord::new_connecting(
            1,
            RuleProtocol::Tcp,
            9000,
            "127.0.0.1".parse().unwrap(),
            5000,
        );
        let id = record.connection_id;
        sink.save(record).await;
        sink.update_traffic_stats(id, 10, 20, 1, 1).await;
        let stored = sink.get(id).unwrap();
        assert_eq!(stored.bytes_rx, 10);
        assert_eq!(stored.bytes_tx, 20);
        sink.delete(id).await;
        assert!(sink.is_empty());
    }

    #[test]
    fn counting_metrics_sink_increments_and_decrements() {
        let sink = CountingMetricsSink::new();
        sink.inc_active_connections();
        sink.inc_active_connections();
        sink.dec_active_connections();
        assert_eq!(sink.active_connections.load(Ordering::Relaxed), 1);
    }
}
