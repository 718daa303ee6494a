use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Deny,
}

/// `(id, ruleId?, cidr, action, priority, enabled)`. A null `rule_id` makes
/// the rule global; the effective set for a forwarding rule is
/// `global ∪ per-rule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: i64,
    pub rule_id: Option<i64>,
    #[serde(with = "cidr_serde")]
    pub cidr: IpNet,
    pub action: Action,
    pub priority: i32,
    pub enabled: bool,
}

mod cidr_serde {
    use ipnet::IpNet;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &IpNet, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    /// Accepts either `a.b.c.d/N` or a bare `a.b.c.d` (implicitly `/32`),
    /// per the `AccessRule.cidr` invariant: a single IPv4 address is a
    /// valid CIDR spec, not just the slash form.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<IpNet, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.contains('/') {
            s.parse().map_err(serde::de::Error::custom)
        } else {
            format!("{s}/32").parse().map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "cidr_serde")]
        cidr: IpNet,
    }

    #[test]
    fn bare_ipv4_address_is_treated_as_slash_32() {
        let w: Wrapper = serde_json::from_str(r#"{"cidr":"10.1.2.3"}"#).unwrap();
        assert_eq!(w.cidr, "10.1.2.3/32".parse::<IpNet>().unwrap());
    }

    #[test]
    fn slash_notation_round_trips() {
        let w: Wrapper = serde_json::from_str(r#"{"cidr":"10.0.0.0/8"}"#).unwrap();
        assert_eq!(w.cidr, "10.0.0.0/8".parse::<IpNet>().unwrap());
    }
}
