//! C1 — rule model and key derivation.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::utils::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    TcpUdp,
}

impl RuleProtocol {
    /// Whether `self` and `other` would contend for the same `(ip, port)` bind.
    ///
    /// TCP_UDP is treated as both TCP and UDP for conflict detection.
    pub fn overlaps(self, other: RuleProtocol) -> bool {
        use RuleProtocol::*;
        match (self, other) {
            (Tcp, Udp) | (Udp, Tcp) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    PointToPoint,
    Broadcast,
}

/// A declarative forwarding rule. Immutable once activated; the caller must
/// deactivate before editing transport-defining fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    pub source_port: u16,
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub protocol: RuleProtocol,
    #[serde(default)]
    pub udp_mode: Option<UdpMode>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_pool_size() -> usize {
    1
}

impl Rule {
    /// Effective bind address, with the empty-source-ip convention resolved.
    pub fn bind_ip(&self) -> IpAddr {
        self.source_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn bind_key(&self) -> (IpAddr, u16) {
        (self.bind_ip(), self.source_port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Whether this rule would contend with `other` for the same `(ip, port)`
    /// across overlapping protocols, per the uniqueness invariant in the data
    /// model: no two *enabled* rules may share `(sourceIp, sourcePort,
    /// protocol)` unless their protocols are disjoint.
    pub fn conflicts_with(&self, other: &Rule) -> bool {
        if !self.enabled || !other.enabled {
            return false;
        }
        self.bind_key() == other.bind_key() && self.protocol.overlaps(other.protocol)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RelayError::Config("rule name cannot be empty".into()));
        }
        if self.source_port == 0 {
            return Err(RelayError::Config(format!(
                "rule {}: source_port cannot be 0",
                self.id
            )));
        }
        if self.target_port == 0 {
            return Err(RelayError::Config(format!(
                "rule {}: target_port cannot be 0",
                self.id
            )));
        }
        if self.pool_size == 0 {
            return Err(RelayError::Config(format!(
                "rule {}: pool_size must be at least 1",
                self.id
            )));
        }
        if matches!(self.protocol, RuleProtocol::Udp) && self.udp_mode.is_none() {
            return Err(RelayError::Config(format!(
                "rule {}: UDP rules must declare udp_mode",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_rule(id: i64, port: u16, proto: RuleProtocol) -> Rule {
        Rule {
            id,
            name: format!("rule-{id}"),
            source_ip: None,
            source_port: port,
            target_ip: "127.0.0.1".parse().unwrap(),
            target_port: 7000,
            protocol: proto,
            udp_mode: None,
            enabled: true,
            auto_reconnect: true,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 10,
            pool_size: 1,
        }
    }

    #[test]
    fn tcp_and_udp_on_same_port_do_not_conflict() {
        let a = base_rule(1, 9000, RuleProtocol::Tcp);
        let b = base_rule(2, 9000, RuleProtocol::Udp);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn tcp_udp_conflicts_with_either() {
        let a = base_rule(1, 9000, RuleProtocol::TcpUdp);
        let b = base_rule(2, 9000, RuleProtocol::Tcp);
        let c = base_rule(3, 9000, RuleProtocol::Udp);
        assert!(a.conflicts_with(&b));
        assert!(a.conflicts_with(&c));
    }

    #[test]
    fn disabled_rules_never_conflict() {
        let mut a = base_rule(1, 9000, RuleProtocol::Tcp);
        a.enabled = false;
        let b = base_rule(2, 9000, RuleProtocol::Tcp);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn different_ports_never_conflict() {
        let a = base_rule(1, 9000, RuleProtocol::Tcp);
        let b = base_rule(2, 9001, RuleProtocol::Tcp);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn validate_rejects_zero_ports_and_pool_size() {
        let mut r = base_rule(1, 9000, RuleProtocol::Tcp);
        r.source_port = 0;
        assert!(r.validate().is_err());

        let mut r = base_rule(1, 9000, RuleProtocol::Tcp);
        r.target_port = 0;
        assert!(r.validate().is_err());

        let mut r = base_rule(1, 9000, RuleProtocol::Tcp);
        r.pool_size = 0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn udp_rule_requires_mode() {
        let r = base_rule(1, 9000, RuleProtocol::Udp);
        assert!(r.validate().is_err());
    }
}
