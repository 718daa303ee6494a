use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::access::{Action, AccessRule};
use crate::sinks::AccessPolicy;
use crate::telemetry::{TelemetryHistory, TelemetrySeverity};

/// Given `(clientIp, ruleId)`, decide allow/deny using the ordered
/// effective CIDR rule set. The policy lookup itself can never fail here
/// (the trait has no `Result`); a collaborator-side lookup failure
/// corresponds to it returning an empty/stale set or swallowing its own
/// internal error before it reaches this decider — either way this
/// component always resolves to a verdict.
pub struct AccessDecider {
    policy: Arc<dyn AccessPolicy>,
    telemetry: Option<Arc<TelemetryHistory>>,
}

impl AccessDecider {
    pub fn new(policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            policy,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryHistory>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub async fn allowed(&self, client_ip: IpAddr, rule_id: i64) -> bool {
        let mut rules = self.policy.effective_rules(rule_id).await;
        rules.retain(|r| r.enabled);
        rules.sort_by_key(|r| r.priority);

        if let Some(decision) = Self::first_match(&rules, client_ip) {
            return decision == Action::Allow;
        }

        // No rule matched. Implicit-deny when whitelisting is in use
        // (an ALLOW rule exists in the effective set), otherwise
        // blacklist-only semantics default to allow.
        let has_allow_rule = rules.iter().any(|r| r.action == Action::Allow);
        !has_allow_rule
    }

    fn first_match(rules: &[AccessRule], client_ip: IpAddr) -> Option<Action> {
        rules
            .iter()
            .find(|r| r.cidr.contains(&client_ip))
            .map(|r| r.action)
    }

    /// Fail-open entry point for callers that hit a policy-lookup error
    /// before reaching `allowed` (e.g. the collaborator's own I/O failed).
    /// Permits access rather than self-DoS when the policy store is
    /// unavailable, and emits a warning event for the condition.
    pub async fn allow_on_policy_error(&self, rule_id: i64, reason: &str) -> bool {
        warn!(rule_id, reason, "access policy lookup failed, failing open");
        if let Some(telemetry) = &self.telemetry {
            telemetry
                .record_event(
                    TelemetrySeverity::Warning,
                    "access_control",
                    format!("policy lookup failed for rule {rule_id}: {reason}; failing open"),
                    None,
                )
                .await;
        }
        true
    }
}
