//! Priority policy: static lookup from priority level to TTL, delivery mode
//! and retention period.
//!
//! Unknown priority strings resolve to the medium row.

use std::time::Duration;

use serde::Serialize;

use beacon_common::types::Priority;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// How urgently a priority level should reach the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Immediate,
    Normal,
    Batch,
}

/// One row of the priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRule {
    /// How long a notification of this priority stays relevant.
    pub ttl: Duration,
    pub delivery_mode: DeliveryMode,
    /// How long a *read* notification is kept before the cleanup sweep deletes it.
    pub retention: Duration,
}

const HIGH: PriorityRule = PriorityRule {
    ttl: Duration::from_secs(HOUR),
    delivery_mode: DeliveryMode::Immediate,
    retention: Duration::from_secs(DAY),
};

const MEDIUM: PriorityRule = PriorityRule {
    ttl: Duration::from_secs(DAY),
    delivery_mode: DeliveryMode::Normal,
    retention: Duration::from_secs(7 * DAY),
};

const LOW: PriorityRule = PriorityRule {
    ttl: Duration::from_secs(7 * DAY),
    delivery_mode: DeliveryMode::Batch,
    retention: Duration::from_secs(30 * DAY),
};

/// Parse a raw priority, falling back to medium for anything unrecognised.
pub fn resolve(raw: &str) -> Priority {
    raw.parse().unwrap_or(Priority::Medium)
}

pub fn rule(priority: Priority) -> PriorityRule {
    match priority {
        Priority::High => HIGH,
        Priority::Medium => MEDIUM,
        Priority::Low => LOW,
    }
}

pub fn ttl(raw: &str) -> Duration {
    rule(resolve(raw)).ttl
}

pub fn delivery_mode(raw: &str) -> DeliveryMode {
    rule(resolve(raw)).delivery_mode
}

pub fn retention(priority: Priority) -> Duration {
    rule(priority).retention
}

pub fn is_immediate(raw: &str) -> bool {
    delivery_mode(raw) == DeliveryMode::Immediate
}

pub fn is_batch(raw: &str) -> bool {
    delivery_mode(raw) == DeliveryMode::Batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_match_priority() {
        for raw in ["high", "medium", "low", "urgent", "", "HIGH"] {
            assert_eq!(is_immediate(raw), raw == "high", "is_immediate({raw:?})");
            assert_eq!(is_batch(raw), raw == "low", "is_batch({raw:?})");
        }
    }

    #[test]
    fn test_unknown_priority_behaves_as_medium() {
        assert_eq!(resolve("critical"), Priority::Medium);
        assert_eq!(ttl("critical"), ttl("medium"));
        assert_eq!(delivery_mode("critical"), DeliveryMode::Normal);
    }

    #[test]
    fn test_ttl_table() {
        assert_eq!(ttl("high"), Duration::from_secs(3600));
        assert_eq!(ttl("medium"), Duration::from_secs(86_400));
        assert_eq!(ttl("low"), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_retention_table() {
        assert_eq!(retention(Priority::High), Duration::from_secs(86_400));
        assert_eq!(retention(Priority::Medium), Duration::from_secs(7 * 86_400));
        assert_eq!(retention(Priority::Low), Duration::from_secs(30 * 86_400));
    }
}
