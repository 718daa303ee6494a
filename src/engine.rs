//! C8 — forwarding engine. Owns the active-rule index, dispatches activation
//! by protocol, and cascades shutdown. Follows the same `run`/`shutdown`
//! lifecycle and constructor-wired-collaborator shape as the single-server
//! type `main.rs` used to instantiate, generalized from "one server" to "N
//! independently activatable rules".

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::access::AccessDecider;
use crate::rule::{Rule, RuleProtocol, UdpMode};
use crate::server::broadcast::BroadcastEngine;
use crate::server::pool::UpstreamPool;
use crate::server::registry::ClientRegistry;
use crate::server::tcp::TcpRuleListener;
use crate::server::udp_session::UdpSessionManager;
use crate::sinks::{AccessPolicy, ConnectionSink, ListenerStatusSink, MetricsSink};
use crate::telemetry::TelemetryHistory;
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleLifecycle {
    Inactive,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
enum Suffix {
    Tcp,
    Udp,
    UdpBroadcast,
}

struct ActiveRule {
    lifecycle: RwLock<RuleLifecycle>,
    pool: Option<Arc<UpstreamPool>>,
    tcp_listener: Option<TcpRuleListener>,
    udp_sessions: Option<Arc<UdpSessionManager>>,
    broadcast: Option<Arc<BroadcastEngine>>,
}

/// Rule lifecycle state machine and top-level composition root: wires the
/// four collaborator interfaces (§6) into whichever of C3/C5/C6/C7 a rule's
/// protocol needs and tracks them under `(bindKey, suffix)`.
pub struct ForwardingEngine {
    registry: Arc<ClientRegistry>,
    access: Arc<AccessDecider>,
    connection_sink: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    listener_status: Arc<dyn ListenerStatusSink>,
    telemetry: Arc<TelemetryHistory>,
    active: DashMap<(IpAddr, u16, Suffix), ActiveRule>,
    rules: RwLock<HashMap<i64, Rule>>,
}

impl ForwardingEngine {
    pub fn new(
        access_policy: Arc<dyn AccessPolicy>,
        connection_sink: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
        listener_status: Arc<dyn ListenerStatusSink>,
    ) -> Arc<Self> {
        let telemetry = Arc::new(TelemetryHistory::new(500, 24));
        Arc::new(Self {
            registry: ClientRegistry::new(Some(metrics.clone())),
            access: Arc::new(AccessDecider::new(access_policy).with_telemetry(telemetry.clone())),
            connection_sink,
            metrics,
            listener_status,
            telemetry,
            active: DashMap::new(),
            rules: RwLock::new(HashMap::new()),
        })
    }

    pub fn telemetry(&self) -> Arc<TelemetryHistory> {
        self.telemetry.clone()
    }

    pub async fn is_running(&self, rule_id: i64) -> bool {
        self.rules.read().await.contains_key(&rule_id)
    }

    pub fn active_server_count(&self) -> usize {
        self.active.len()
    }

    async fn bind_key_of(&self, rule_id: i64) -> Option<(IpAddr, u16)> {
        self.rules.read().await.get(&rule_id).map(Rule::bind_key)
    }

    /// §6 read-only view: `(slotIndex, state, reconnectAttempts)` per slot of
    /// the rule's upstream pool, or `None` if the rule has no pool (not
    /// active, or a UDP broadcast rule which skips C3 entirely).
    pub async fn pool_status(
        &self,
        rule_id: i64,
    ) -> Option<Vec<(usize, crate::server::pool::SlotState, u32)>> {
        let (bind_ip, port) = self.bind_key_of(rule_id).await?;
        for suffix in [Suffix::Tcp, Suffix::Udp] {
            if let Some(active) = self.active.get(&(bind_ip, port, suffix)) {
                if let Some(pool) = &active.pool {
                    return Some(pool.status().await);
                }
            }
        }
        None
    }

    /// §6 read-only view: C4's per-rule client count, aggregate traffic, and
    /// buffered-bytes total.
    pub fn client_stats(&self, rule_id: i64) -> crate::server::registry::ClientStats {
        self.registry.rule_stats(rule_id)
    }

    /// §6 read-only view: `(total, active, expired, current)` for the rule's
    /// UDP point-to-point session table, or `None` if the rule isn't an
    /// active point-to-point UDP rule.
    pub async fn udp_session_stats(&self, rule_id: i64) -> Option<(u64, usize, u64, usize)> {
        let (bind_ip, port) = self.bind_key_of(rule_id).await?;
        let active = self.active.get(&(bind_ip, port, Suffix::Udp))?;
        let sessions = active.udp_sessions.as_ref()?;
        let current = sessions.current();
        Some((sessions.total(), current, sessions.expired(), current))
    }

    /// §6 read-only view: `(downstreamCount, upstreamCount, bytesRx, bytesTx)`
    /// for the rule's broadcast engine, or `None` if the rule isn't an active
    /// broadcast rule.
    pub async fn broadcast_stats(&self, rule_id: i64) -> Option<(usize, usize, u64, u64)> {
        let (bind_ip, port) = self.bind_key_of(rule_id).await?;
        let active = self.active.get(&(bind_ip, port, Suffix::UdpBroadcast))?;
        let engine = active.broadcast.as_ref()?;
        Some((
            engine.subscriber_count(),
            engine.sender_count(),
            engine.bytes_rx(),
            engine.bytes_tx(),
        ))
    }

    /// INACTIVE -> STARTING -> RUNNING. Any sub-start failure rolls the
    /// rule back to INACTIVE (closing whatever partially succeeded) and
    /// returns false.
    pub async fn activate(self: &Arc<Self>, rule: Rule) -> bool {
        if let Err(err) = rule.validate() {
            warn!(rule_id = rule.id, %err, "rule failed validation, refusing to activate");
            return false;
        }

        {
            let existing = self.rules.read().await;
            for other in existing.values() {
                if other.id != rule.id && rule.conflicts_with(other) {
                    warn!(
                        rule_id = rule.id,
                        other_rule_id = other.id,
                        "rule conflicts with an already-active rule on the same bind key"
                    );
                    return false;
                }
            }
        }

        let started = match rule.protocol {
            RuleProtocol::Tcp => self.start_tcp(&rule).await,
            RuleProtocol::Udp => self.start_udp(&rule).await,
            RuleProtocol::TcpUdp => self.start_tcp(&rule).await && self.start_udp(&rule).await,
        };

        if !started {
            self.deactivate(&rule).await;
            return false;
        }

        self.rules.write().await.insert(rule.id, rule);
        self.metrics.inc_forwarding_rule_count();
        true
    }

    async fn start_tcp(self: &Arc<Self>, rule: &Rule) -> bool {
        let pool = UpstreamPool::new(
            rule.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.telemetry.clone(),
        );

        match TcpRuleListener::bind(
            rule.clone(),
            pool.clone(),
            self.registry.clone(),
            self.access.clone(),
            self.connection_sink.clone(),
            self.metrics.clone(),
            self.listener_status.clone(),
        )
        .await
        {
            Ok(listener) => {
                self.active.insert(
                    (rule.bind_ip(), rule.source_port, Suffix::Tcp),
                    ActiveRule {
                        lifecycle: RwLock::new(RuleLifecycle::Running),
                        pool: Some(pool),
                        tcp_listener: Some(listener),
                        udp_sessions: None,
                        broadcast: None,
                    },
                );
                info!(rule_id = rule.id, "tcp rule activated");
                true
            }
            Err(err) => {
                error!(rule_id = rule.id, %err, "tcp listener bind failed");
                pool.shutdown().await;
                false
            }
        }
    }

    async fn start_udp(self: &Arc<Self>, rule: &Rule) -> bool {
        match rule.udp_mode {
            Some(UdpMode::Broadcast) => match BroadcastEngine::bind(
                rule.clone(),
                self.connection_sink.clone(),
                self.metrics.clone(),
                self.listener_status.clone(),
            )
            .await
            {
                Ok(engine) => {
                    self.active.insert(
                        (rule.bind_ip(), rule.source_port, Suffix::UdpBroadcast),
                        ActiveRule {
                            lifecycle: RwLock::new(RuleLifecycle::Running),
                            pool: None,
                            tcp_listener: None,
                            udp_sessions: None,
                            broadcast: Some(engine),
                        },
                    );
                    info!(rule_id = rule.id, "udp broadcast rule activated");
                    true
                }
                Err(err) => {
                    error!(rule_id = rule.id, %err, "broadcast engine bind failed");
                    false
                }
            },
            Some(UdpMode::PointToPoint) | None => match UdpSessionManager::bind(
                rule.clone(),
                self.connection_sink.clone(),
                self.metrics.clone(),
                self.listener_status.clone(),
            )
            .await
            {
                Ok(manager) => {
                    self.active.insert(
                        (rule.bind_ip(), rule.source_port, Suffix::Udp),
                        ActiveRule {
                            lifecycle: RwLock::new(RuleLifecycle::Running),
                            pool: None,
                            tcp_listener: None,
                            udp_sessions: Some(manager),
                            broadcast: None,
                        },
                    );
                    info!(rule_id = rule.id, "udp point-to-point rule activated");
                    true
                }
                Err(err) => {
                    error!(rule_id = rule.id, %err, "udp session manager bind failed");
                    false
                }
            },
        }
    }

    /// Idempotent: deactivating an already-inactive rule is a no-op success.
    pub async fn deactivate(self: &Arc<Self>, rule: &Rule) -> bool {
        let bind_ip = rule.bind_ip();
        let mut found_any = false;

        for suffix in [Suffix::Tcp, Suffix::Udp, Suffix::UdpBroadcast] {
            if let Some((_, active)) = self.active.remove(&(bind_ip, rule.source_port, suffix)) {
                found_any = true;
                *active.lifecycle.write().await = RuleLifecycle::Stopping;
                if let Some(listener) = &active.tcp_listener {
                    listener.stop();
                }
                if let Some(pool) = &active.pool {
                    pool.shutdown().await;
                }
                if let Some(sessions) = &active.udp_sessions {
                    sessions.shutdown();
                }
                if let Some(broadcast) = &active.broadcast {
                    broadcast.shutdown();
                }
                self.registry.remove_rule(rule.id);
            }
        }

        if found_any {
            self.listener_status.stop_listener(rule.id).await;
            self.metrics.dec_forwarding_rule_count();
        }

        self.rules.write().await.remove(&rule.id);
        true
    }

    /// Cascades deactivate over every active rule.
    pub async fn shutdown(self: &Arc<Self>) {
        let rules: Vec<Rule> = self.rules.read().await.values().cloned().collect();
        for rule in rules {
            self.deactivate(&rule).await;
        }
    }
}
