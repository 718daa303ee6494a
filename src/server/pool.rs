//! C3 — upstream connection pool with automatic reconnection.
//!
//! This is a deliberate redesign of the idle-connection cache a
//! request/response proxy pool would use: this relay instead needs a fixed
//! number of *persistent* slots per rule, each running its own reconnect
//! state machine, because the upstream can push unsolicited data at any
//! time. The slot array, atomics-for-counters, and `socket2`-based socket
//! tuning are carried over from that shape; the lifecycle state machine
//! itself is new.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rule::Rule;
use crate::server::registry::ClientRegistry;
use crate::sinks::MetricsSink;
use crate::telemetry::{TelemetryHistory, TelemetrySeverity};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Connecting,
    Connected,
    Backoff,
    GiveUp,
}

struct Slot {
    state: RwLock<SlotState>,
    attempt: AtomicU32,
    writer: Mutex<Option<Arc<Mutex<OwnedWriteHalf>>>>,
    spawned: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: RwLock::new(SlotState::Backoff),
            attempt: AtomicU32::new(0),
            writer: Mutex::new(None),
            spawned: AtomicBool::new(false),
        }
    }
}

/// Per-rule pool of outbound TCP connections. `get()` round-robins live
/// slots and dials on demand; `shutdown()` cancels reconnect timers and
/// closes every socket.
pub struct UpstreamPool {
    rule: Rule,
    target: SocketAddr,
    registry: Arc<ClientRegistry>,
    metrics: Arc<dyn MetricsSink>,
    telemetry: Arc<TelemetryHistory>,
    slots: Vec<Slot>,
    active_count: AtomicUsize,
    next_index: AtomicUsize,
    shutdown: CancellationToken,
    self_weak: Mutex<Weak<UpstreamPool>>,
}

impl UpstreamPool {
    pub fn new(
        rule: Rule,
        registry: Arc<ClientRegistry>,
        metrics: Arc<dyn MetricsSink>,
        telemetry: Arc<TelemetryHistory>,
    ) -> Arc<Self> {
        let target = SocketAddr::new(rule.target_ip, rule.target_port);
        let pool_size = rule.pool_size.max(1);
        let slots = (0..pool_size).map(|_| Slot::new()).collect();

        let pool = Arc::new(Self {
            rule,
            target,
            registry,
            metrics,
            telemetry,
            slots,
            active_count: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            self_weak: Mutex::new(Weak::new()),
        });

        {
            let pool = pool.clone();
            tokio::spawn(async move {
                *pool.self_weak.lock().await = Arc::downgrade(&pool);
            });
        }

        // Eager seeding: slot 0 is dialled immediately so the upstream can
        // push unsolicited data before any client arrives.
        pool.spawn_supervisor(0, None);

        pool
    }

    pub fn rule_id(&self) -> i64 {
        self.rule.id
    }

    /// Returns any `active && healthy` slot, round-robin by slot index. If
    /// none exists and fewer than `pool_size` slots have ever been spawned,
    /// dials one synchronously before returning.
    pub async fn get(&self) -> Option<(usize, Arc<Mutex<OwnedWriteHalf>>)> {
        let n = self.slots.len();
        for offset in 0..n {
            let index = (self.next_index.fetch_add(1, Ordering::Relaxed) + offset) % n;
            if *self.slots[index].state.read().await == SlotState::Connected {
                if let Some(writer) = self.slots[index].writer.lock().await.clone() {
                    return Some((index, writer));
                }
            }
        }

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.spawned.swap(true, Ordering::SeqCst) {
                continue;
            }
            match self.connect_once(index).await {
                Some(read_half) => {
                    self.spawn_supervisor(index, Some(read_half));
                    if let Some(writer) = self.slots[index].writer.lock().await.clone() {
                        return Some((index, writer));
                    }
                    return None;
                }
                None => {
                    self.spawn_supervisor(index, None);
                    return None;
                }
            }
        }

        None
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> Vec<(usize, SlotState, u32)> {
        let mut out = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            out.push((
                i,
                *slot.state.read().await,
                slot.attempt.load(Ordering::Relaxed),
            ));
        }
        out
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for slot in &self.slots {
            *slot.state.write().await = SlotState::GiveUp;
            *slot.writer.lock().await = None;
        }
    }

    fn spawn_supervisor(&self, index: usize, immediate: Option<OwnedReadHalf>) {
        self.slots[index].spawned.store(true, Ordering::SeqCst);
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            // The weak ref is set right after construction; by the time any
            // slot actually needs to reconnect it is always populated, but
            // eager seeding can race it on a very first dial, so wait for it.
            let pool = loop {
                if let Some(p) = weak.lock().await.upgrade() {
                    break p;
                }
                tokio::task::yield_now().await;
            };
            pool.supervisor_loop(index, immediate).await;
        });
    }

    async fn supervisor_loop(self: Arc<Self>, index: usize, mut immediate: Option<OwnedReadHalf>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let read_half = if let Some(rh) = immediate.take() {
                rh
            } else {
                let attempt = self.slots[index].attempt.load(Ordering::Relaxed);
                if attempt > 0 {
                    let backoff = self.backoff_for(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }

                match self.connect_once(index).await {
                    Some(rh) => rh,
                    None => {
                        let attempt = self.slots[index].attempt.load(Ordering::Relaxed);
                        if attempt > self.rule.max_reconnect_attempts {
                            *self.slots[index].state.write().await = SlotState::GiveUp;
                            warn!(
                                rule_id = self.rule.id,
                                slot = index,
                                "slot gave up after max reconnect attempts"
                            );
                            self.telemetry
                                .record_event(
                                    TelemetrySeverity::Error,
                                    "upstream_pool",
                                    format!(
                                        "rule {} slot {} gave up after {} attempts",
                                        self.rule.id, index, attempt
                                    ),
                                    None,
                                )
                                .await;
                            return;
                        }
                        continue;
                    }
                }
            };

            self.run_connected(index, read_half).await;

            self.active_count.fetch_sub(1, Ordering::Relaxed);
            *self.slots[index].writer.lock().await = None;
            self.registry.clear_slot_affinity(self.rule.id, index);

            if !self.rule.auto_reconnect {
                *self.slots[index].state.write().await = SlotState::GiveUp;
                return;
            }
            self.slots[index].attempt.store(1, Ordering::Relaxed);
            *self.slots[index].state.write().await = SlotState::Backoff;
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.rule.reconnect_interval();
        let scaled = base.saturating_mul(attempt.max(1));
        scaled.min(MAX_BACKOFF)
    }

    /// Dials the slot. On success installs the writer, flips the slot to
    /// `Connected`, flushes anything buffered while it was down, and returns
    /// the read half for the caller to drive. On failure bumps `attempt` and
    /// flips to `Backoff`.
    async fn connect_once(&self, index: usize) -> Option<OwnedReadHalf> {
        *self.slots[index].state.write().await = SlotState::Connecting;

        let stream = match timeout(CONNECT_TIMEOUT, self.dial()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(rule_id = self.rule.id, slot = index, %err, "dial failed");
                self.slots[index].attempt.fetch_add(1, Ordering::Relaxed);
                *self.slots[index].state.write().await = SlotState::Backoff;
                return None;
            }
            Err(_) => {
                debug!(rule_id = self.rule.id, slot = index, "dial timed out");
                self.slots[index].attempt.fetch_add(1, Ordering::Relaxed);
                *self.slots[index].state.write().await = SlotState::Backoff;
                return None;
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.slots[index].writer.lock().await = Some(Arc::new(Mutex::new(write_half)));
        self.slots[index].attempt.store(0, Ordering::Relaxed);
        *self.slots[index].state.write().await = SlotState::Connected;
        self.active_count.fetch_add(1, Ordering::Relaxed);
        info!(rule_id = self.rule.id, slot = index, target = %self.target, "upstream slot connected");

        self.registry.flush_buffered(self.rule.id, self).await;

        Some(read_half)
    }

    async fn run_connected(&self, index: usize, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => return,
                        Ok(n) => {
                            self.metrics.add_bytes_transferred(n as u64);
                            self.registry
                                .deliver_from_upstream(self.rule.id, index, &buf[..n])
                                .await;
                        }
                        Err(err) => {
                            debug!(rule_id = self.rule.id, slot = index, %err, "upstream read failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dial(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(self.target).await?;
        // Tune SO_KEEPALIVE / TCP_NODELAY via socket2 on the connected
        // stream, using `SockRef::from(&stream)` rather than pre-building
        // the socket.
        let sock_ref = SockRef::from(&stream);
        sock_ref.set_keepalive(true)?;
        sock_ref.set_nodelay(true)?;
        Ok(stream)
    }
}
