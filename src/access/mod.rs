//! C2 — access-control decider. Ordered-CIDR allow/deny on the connection
//! hot path, reduced to a simple (ruleId, cidr, action, priority) shape — no
//! users/groups, no domain/wildcard matchers, since this relay decides on
//! IP alone.

mod decider;
mod types;

pub use decider::AccessDecider;
pub use types::{Action, AccessRule};
