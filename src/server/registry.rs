//! C4 — client connection registry. Tracks downstream TCP clients per rule,
//! routes upstream replies back to them, and buffers writes while the
//! upstream pool is unhealthy.
//!
//! Follows a DashMap-of-live-entries, atomics-for-counters, lock-free-removal
//! shape reshaped around a buffering/affinity contract instead of plain
//! session tracking.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::server::pool::UpstreamPool;
use crate::sinks::MetricsSink;

/// 1 MiB per-client buffer cap (§3, ClientEntry).
pub const CLIENT_BUFFER_CAP_BYTES: u64 = 1024 * 1024;

struct PendingBuffer {
    chunks: Mutex<VecDeque<Bytes>>,
    buffered_bytes: AtomicU64,
}

impl PendingBuffer {
    fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            buffered_bytes: AtomicU64::new(0),
        }
    }

    /// Tail-drop: refuse the enqueue above the cap rather than evicting
    /// older bytes, so the *first* bytes written survive an overflow.
    async fn try_enqueue(&self, bytes: Bytes) -> bool {
        let incoming = bytes.len() as u64;
        if self.buffered_bytes.load(Ordering::Relaxed) + incoming > CLIENT_BUFFER_CAP_BYTES {
            return false;
        }
        self.buffered_bytes.fetch_add(incoming, Ordering::Relaxed);
        self.chunks.lock().await.push_back(bytes);
        true
    }

    async fn drain(&self) -> Vec<Bytes> {
        let mut chunks = self.chunks.lock().await;
        let drained: Vec<Bytes> = chunks.drain(..).collect();
        self.buffered_bytes.store(0, Ordering::Relaxed);
        drained
    }

    fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.load(Ordering::Relaxed)
    }
}

pub struct ClientEntry {
    pub rule_id: i64,
    pub connection_id: Uuid,
    write_half: Mutex<OwnedWriteHalf>,
    pending: PendingBuffer,
    write_lock: Mutex<()>,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    packets_rx: AtomicU64,
    packets_tx: AtomicU64,
    /// Last time a read *or* write happened for this client; the 300s idle
    /// timeout (§4.4) is measured against this, not read activity alone.
    last_activity: std::sync::Mutex<std::time::Instant>,
}

impl ClientEntry {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = std::time::Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Write directly to the client (the reply path; not exercised by the
    /// main TCP plan, kept for symmetry with `forward_to_upstream`). Counts
    /// as traffic received by this client.
    async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let _serialize = self.write_lock.lock().await;
        let mut half = self.write_half.lock().await;
        let result = half.write_all(bytes).await;
        if result.is_ok() {
            self.touch();
            self.bytes_rx.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.packets_rx.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn record_tx(&self, n: u64) {
        self.bytes_tx.fetch_add(n, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.pending.buffered_bytes()
    }
}

/// Per-rule aggregate of C4's read-only view (§6): client count, total
/// traffic across every live client under the rule, and bytes still sitting
/// in per-client buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub count: usize,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub buffered_bytes: u64,
}

/// `(rule_id, slot_index) -> set<connection_id>`, populated the first time a
/// client writes through a given upstream slot. Best-effort affinity: it does
/// not guarantee response ordering under concurrent use of a shared slot.
type ReverseMap = DashMap<(i64, usize), HashSet<Uuid>>;

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<(i64, Uuid), Arc<ClientEntry>>,
    rule_members: DashMap<i64, HashSet<Uuid>>,
    reverse: ReverseMap,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ClientRegistry {
    pub fn new(metrics: Option<Arc<dyn MetricsSink>>) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            rule_members: DashMap::new(),
            reverse: DashMap::new(),
            metrics,
        })
    }

    pub fn register(&self, rule_id: i64, connection_id: Uuid, write_half: OwnedWriteHalf) {
        let entry = Arc::new(ClientEntry {
            rule_id,
            connection_id,
            write_half: Mutex::new(write_half),
            pending: PendingBuffer::new(),
            write_lock: Mutex::new(()),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            packets_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
            last_activity: std::sync::Mutex::new(std::time::Instant::now()),
        });
        self.clients.insert((rule_id, connection_id), entry);
        self.rule_members
            .entry(rule_id)
            .or_default()
            .insert(connection_id);
    }

    pub fn unregister(&self, rule_id: i64, connection_id: Uuid) {
        self.clients.remove(&(rule_id, connection_id));
        if let Some(mut members) = self.rule_members.get_mut(&rule_id) {
            members.remove(&connection_id);
        }
        for mut entry in self.reverse.iter_mut() {
            entry.value_mut().remove(&connection_id);
        }
    }

    pub fn buffered_bytes(&self, rule_id: i64, connection_id: Uuid) -> u64 {
        self.clients
            .get(&(rule_id, connection_id))
            .map(|e| e.buffered_bytes())
            .unwrap_or(0)
    }

    /// Time since the client last read or was written to; `None` if it is
    /// no longer registered. Backs the 300s idle timeout in `server::tcp`,
    /// which must fire on neither reads nor writes, not reads alone.
    pub fn idle_for(&self, rule_id: i64, connection_id: Uuid) -> Option<std::time::Duration> {
        self.clients
            .get(&(rule_id, connection_id))
            .map(|e| e.idle_for())
    }

    pub fn active_count(&self, rule_id: i64) -> usize {
        self.rule_members
            .get(&rule_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// §6 read-only view: client count plus aggregate traffic/buffer state
    /// across every live client under `rule_id`.
    pub fn rule_stats(&self, rule_id: i64) -> ClientStats {
        let Some(members) = self.rule_members.get(&rule_id) else {
            return ClientStats::default();
        };
        let mut stats = ClientStats::default();
        for connection_id in members.iter() {
            if let Some(entry) = self.clients.get(&(rule_id, *connection_id)) {
                stats.count += 1;
                stats.bytes_rx += entry.bytes_rx.load(Ordering::Relaxed);
                stats.bytes_tx += entry.bytes_tx.load(Ordering::Relaxed);
                stats.packets_rx += entry.packets_rx.load(Ordering::Relaxed);
                stats.packets_tx += entry.packets_tx.load(Ordering::Relaxed);
                stats.buffered_bytes += entry.buffered_bytes();
            }
        }
        stats
    }

    /// Writes immediately if a healthy upstream slot exists, recording the
    /// `(slot -> client)` affinity; otherwise enqueues into the client's
    /// bounded buffer. Returns `false` if the payload was tail-dropped.
    pub async fn forward_to_upstream(
        &self,
        rule_id: i64,
        connection_id: Uuid,
        bytes: Bytes,
        pool: &UpstreamPool,
    ) -> bool {
        if let Some(entry) = self.clients.get(&(rule_id, connection_id)) {
            entry.touch();
        }

        if let Some((slot_index, writer)) = pool.get().await {
            self.reverse
                .entry((rule_id, slot_index))
                .or_default()
                .insert(connection_id);
            let mut w = writer.lock().await;
            let len = bytes.len() as u64;
            if w.write_all(&bytes).await.is_ok() {
                if let Some(entry) = self.clients.get(&(rule_id, connection_id)) {
                    entry.record_tx(len);
                }
                return true;
            }
        }

        let Some(entry) = self.clients.get(&(rule_id, connection_id)) else {
            return false;
        };
        let accepted = entry.pending.try_enqueue(bytes).await;
        if !accepted {
            if let Some(metrics) = &self.metrics {
                metrics.inc_transfer_errors();
            }
        }
        accepted
    }

    /// Direct reply path; kept for symmetry with `forward_to_upstream`.
    pub async fn forward_to_client(
        &self,
        rule_id: i64,
        connection_id: Uuid,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        if let Some(entry) = self.clients.get(&(rule_id, connection_id)) {
            entry.write(bytes).await
        } else {
            Ok(())
        }
    }

    /// Upstream -> downstream fan-out, biased by slot affinity when one is
    /// recorded; falls back to rule-wide fan-out when the mapping is empty.
    pub async fn deliver_from_upstream(&self, rule_id: i64, slot_index: usize, bytes: &[u8]) {
        let affine: Vec<Uuid> = self
            .reverse
            .get(&(rule_id, slot_index))
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();

        if affine.is_empty() {
            self.route_to_rule(rule_id, bytes).await;
            return;
        }

        for connection_id in affine {
            if let Some(entry) = self.clients.get(&(rule_id, connection_id)) {
                if let Err(err) = entry.write(bytes).await {
                    trace!(%connection_id, %err, "write to client failed during affine delivery");
                }
            }
        }
    }

    /// The default path when a slot has no recorded affinity: write `bytes`
    /// to every live client registered under `rule_id`.
    pub async fn route_to_rule(&self, rule_id: i64, bytes: &[u8]) {
        let members: Vec<Uuid> = self
            .rule_members
            .get(&rule_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();

        for connection_id in members {
            if let Some(entry) = self.clients.get(&(rule_id, connection_id)) {
                if let Err(err) = entry.write(bytes).await {
                    trace!(%connection_id, %err, "write to client failed during fan-out");
                }
            }
        }
    }

    /// Called once a slot transitions back to `Connected`: drains every
    /// client's buffer into the now-healthy upstream, in insertion order.
    pub async fn flush_buffered(&self, rule_id: i64, pool: &UpstreamPool) {
        let Some(members) = self.rule_members.get(&rule_id).map(|m| m.clone()) else {
            return;
        };

        for connection_id in members {
            let Some(entry) = self.clients.get(&(rule_id, connection_id)) else {
                continue;
            };
            let entry = entry.clone();
            let chunks = entry.pending.drain().await;
            if chunks.is_empty() {
                continue;
            }
            let Some((slot_index, writer)) = pool.get().await else {
                // put it back; nothing came up after all
                for chunk in chunks {
                    entry.pending.try_enqueue(chunk).await;
                }
                continue;
            };
            self.reverse
                .entry((rule_id, slot_index))
                .or_default()
                .insert(connection_id);
            let mut w = writer.lock().await;
            for chunk in chunks {
                let len = chunk.len() as u64;
                if w.write_all(&chunk).await.is_err() {
                    break;
                }
                entry.record_tx(len);
            }
        }
    }

    /// Invoked by the pool when a slot closes: affinity recorded against
    /// that slot no longer means anything.
    pub fn clear_slot_affinity(&self, rule_id: i64, slot_index: usize) {
        self.reverse.remove(&(rule_id, slot_index));
    }

    pub fn remove_rule(&self, rule_id: i64) {
        self.rule_members.remove(&rule_id);
        self.reverse.retain(|(rid, _), _| *rid != rule_id);
        self.clients.retain(|(rid, _), _| *rid != rule_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_tracks_active_count_and_unregister_clears_it() {
        let registry = ClientRegistry::new(None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let accept = listener.accept();
        let (accepted, client_stream) = tokio::join!(accept, connect);
        let (_server_stream, _peer) = accepted.unwrap();
        let client_stream = client_stream.unwrap();
        let (_r, w) = client_stream.into_split();

        let id = Uuid::new_v4();
        registry.register(1, id, w);
        assert_eq!(registry.active_count(1), 1);
        registry.unregister(1, id);
        assert_eq!(registry.active_count(1), 0);
    }

    #[tokio::test]
    async fn rule_stats_reflect_buffered_bytes_when_no_upstream() {
        use crate::rule::{Rule, RuleProtocol};
        use crate::server::pool::UpstreamPool;
        use crate::sinks::CountingMetricsSink;
        use crate::telemetry::TelemetryHistory;

        let registry = ClientRegistry::new(None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) =
            tokio::join!(listener.accept(), tokio::net::TcpStream::connect(addr));
        let (_server_stream, _peer) = accepted.unwrap();
        let (_r, w) = connected.unwrap().into_split();

        let id = Uuid::new_v4();
        registry.register(1, id, w);

        // No listener at this target, so every dial fails and the write
        // lands in the buffer rather than through an upstream slot.
        let unreachable = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = unreachable.local_addr().unwrap().port();
        drop(unreachable);
        let rule = Rule {
            id: 1,
            name: "registry-stats".into(),
            source_ip: None,
            source_port: 0,
            target_ip: "127.0.0.1".parse().unwrap(),
            target_port,
            protocol: RuleProtocol::Tcp,
            udp_mode: None,
            enabled: true,
            auto_reconnect: false,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 0,
            pool_size: 1,
        };
        let pool = UpstreamPool::new(
            rule,
            registry.clone(),
            CountingMetricsSink::new(),
            Arc::new(TelemetryHistory::new(16, 1)),
        );

        let payload = Bytes::from_static(b"hello");
        registry
            .forward_to_upstream(1, id, payload, &pool)
            .await;

        let stats = registry.rule_stats(1);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.buffered_bytes, 5);
        assert_eq!(stats.bytes_tx, 0, "nothing reached upstream yet");
    }
}
