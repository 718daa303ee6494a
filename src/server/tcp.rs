//! C5 — TCP listener & pipeline. Accepts clients, enforces the access
//! decider before any other work, wires C3 (upstream pool) to C4 (client
//! registry), and enforces the 300s idle timeout.
//!
//! Follows the same accept/dispatch shape and `tokio::select!`-based
//! read/idle loop as this codebase's other per-connection handlers, stripped
//! of SOCKS handshake framing since this path is byte-transparent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::access::AccessDecider;
use crate::rule::{Rule, RuleProtocol};
use crate::server::pool::UpstreamPool;
use crate::server::registry::ClientRegistry;
use crate::sinks::{ConnectionRecord, ConnectionSink, ConnectionStatus, ListenerStatusSink, MetricsSink};

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct TcpRuleListener {
    rule: Rule,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TcpRuleListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl TcpRuleListener {
    /// Binds the listener and spawns the accept loop. Returns `Err` if the
    /// bind fails, which the engine treats as fatal for this activation.
    pub async fn bind(
        rule: Rule,
        pool: Arc<UpstreamPool>,
        registry: Arc<ClientRegistry>,
        access: Arc<AccessDecider>,
        connection_sink: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
        listener_status: Arc<dyn ListenerStatusSink>,
    ) -> crate::utils::error::Result<Self> {
        let addr = SocketAddr::new(rule.bind_ip(), rule.source_port);
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            crate::utils::error::RelayError::ListenerBind {
                rule_id: rule.id,
                addr: addr.to_string(),
                source,
            }
        })?;

        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        listener_status
            .create_listener(rule.id, rule.source_port, RuleProtocol::Tcp)
            .await;
        listener_status
            .set_waiting_for_clients(rule.id, RuleProtocol::Tcp)
            .await;

        let this = Self {
            rule: rule.clone(),
            local_addr,
            shutdown: shutdown.clone(),
        };

        tokio::spawn(accept_loop(
            rule,
            listener,
            pool,
            registry,
            access,
            connection_sink,
            metrics,
            listener_status,
            shutdown,
        ));

        Ok(this)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    rule: Rule,
    listener: TcpListener,
    pool: Arc<UpstreamPool>,
    registry: Arc<ClientRegistry>,
    access: Arc<AccessDecider>,
    connection_sink: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    listener_status: Arc<dyn ListenerStatusSink>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => result,
        };

        let (stream, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(rule_id = rule.id, %err, "accept failed");
                continue;
            }
        };

        let rule = rule.clone();
        let pool = pool.clone();
        let registry = registry.clone();
        let access = access.clone();
        let connection_sink = connection_sink.clone();
        let metrics = metrics.clone();
        let listener_status = listener_status.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            handle_client(
                rule,
                stream,
                remote_addr,
                pool,
                registry,
                access,
                connection_sink,
                metrics,
                listener_status,
                shutdown,
            )
            .await;
        });
    }

    listener_status.stop_listener(rule.id).await;
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(rule_id = rule.id, remote = %remote_addr))]
async fn handle_client(
    rule: Rule,
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    pool: Arc<UpstreamPool>,
    registry: Arc<ClientRegistry>,
    access: Arc<AccessDecider>,
    connection_sink: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    listener_status: Arc<dyn ListenerStatusSink>,
    shutdown: CancellationToken,
) {
    if !access.allowed(remote_addr.ip(), rule.id).await {
        metrics.inc_connection_errors();
        debug!("connection denied by access control");
        return;
    }

    let connection_id = Uuid::new_v4();
    let mut record = ConnectionRecord::new_connecting(
        rule.id,
        RuleProtocol::Tcp,
        rule.source_port,
        remote_addr.ip(),
        remote_addr.port(),
    );
    record.status = ConnectionStatus::Connected;
    record.connection_id = connection_id;
    connection_sink.save(record.clone()).await;

    let (mut read_half, write_half) = stream.into_split();
    registry.register(rule.id, connection_id, write_half);
    metrics.inc_active_connections();
    metrics.inc_total_connections();
    listener_status
        .on_client_connected(rule.id, RuleProtocol::Tcp)
        .await;
    info!("client connected");

    let mut buf = vec![0u8; 16 * 1024];
    let mut final_status = ConnectionStatus::Disconnected;
    let mut error_message = None;

    loop {
        // The 300s idle deadline tracks both reads (this loop) and writes
        // (the upstream reader task delivering into this client via C4),
        // so recompute the remaining wait against the registry's activity
        // clock rather than resetting a fixed timer on reads alone.
        let idle_elapsed = registry
            .idle_for(rule.id, connection_id)
            .unwrap_or(Duration::ZERO);
        let remaining = IDLE_TIMEOUT.saturating_sub(idle_elapsed);

        let read_result = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(remaining) => {
                let still_idle = registry
                    .idle_for(rule.id, connection_id)
                    .unwrap_or(Duration::ZERO);
                if still_idle >= IDLE_TIMEOUT {
                    final_status = ConnectionStatus::Timeout;
                    break;
                }
                continue;
            }
            result = read_half.read(&mut buf) => result,
        };

        match read_result {
            Ok(0) => break,
            Ok(n) => {
                let payload = Bytes::copy_from_slice(&buf[..n]);
                registry
                    .forward_to_upstream(rule.id, connection_id, payload, &pool)
                    .await;
                connection_sink
                    .update_traffic_stats(connection_id, 0, n as u64, 0, 1)
                    .await;
                metrics.add_bytes_transferred(n as u64);
            }
            Err(err) => {
                final_status = ConnectionStatus::Error;
                error_message = Some(err.to_string());
                break;
            }
        }
    }

    registry.unregister(rule.id, connection_id);
    metrics.dec_active_connections();
    listener_status
        .on_client_disconnected(rule.id, RuleProtocol::Tcp)
        .await;

    // Apply the final status transition (§4.4: TIMEOUT / ERROR with cause,
    // or plain DISCONNECTED) before the record is deleted. TCP records are
    // still deleted on disconnect by design; only UDP/broadcast paths
    // retain a record after the connection ends.
    record.status = final_status;
    record.error_message = error_message;
    record.disconnected_at = Some(Utc::now());
    connection_sink.update(record).await;
    connection_sink.delete(connection_id).await;
    debug!("client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessDecider;
    use crate::rule::RuleProtocol;
    use crate::sinks::{
        AllowAllAccessPolicy, CountingMetricsSink, NullListenerStatusSink, RecordingConnectionSink,
    };
    use crate::telemetry::TelemetryHistory;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    fn test_rule(id: i64, source_port: u16, target_port: u16) -> Rule {
        Rule {
            id,
            name: format!("tcp-test-{id}"),
            source_ip: Some("127.0.0.1".parse().unwrap()),
            source_port,
            target_ip: "127.0.0.1".parse().unwrap(),
            target_port,
            protocol: RuleProtocol::Tcp,
            udp_mode: None,
            enabled: true,
            auto_reconnect: true,
            reconnect_interval_ms: 50,
            max_reconnect_attempts: 5,
            pool_size: 1,
        }
    }

    #[tokio::test]
    async fn happy_path_echoes_through_upstream() {
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = upstream_listener.accept().await {
                let mut buf = [0u8; 5];
                if sock.read_exact(&mut buf).await.is_ok() {
                    let _ = sock.write_all(&buf).await;
                }
            }
        });

        let rule = test_rule(1, 0, upstream_port);
        let registry = ClientRegistry::new(None);
        let metrics = CountingMetricsSink::new();
        let telemetry = Arc::new(TelemetryHistory::new(64, 1));
        let pool = UpstreamPool::new(rule.clone(), registry.clone(), metrics.clone(), telemetry);
        let access = Arc::new(AccessDecider::new(Arc::new(AllowAllAccessPolicy)));
        let connection_sink = Arc::new(RecordingConnectionSink::new());

        let listener = TcpRuleListener::bind(
            rule,
            pool,
            registry,
            access,
            connection_sink,
            metrics.clone(),
            Arc::new(NullListenerStatusSink),
        )
        .await
        .unwrap();

        let mut client = tokio::net::TcpStream::connect(listener.local_addr())
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        listener.stop();
    }
}
