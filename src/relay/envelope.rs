//! Relay message envelopes and budgets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default hop allowance for envelopes published without a budget.
pub const DEFAULT_MAX_HOPS: u32 = 8;
/// Default time-to-live for envelopes published without a budget.
pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;
/// Default call budget for envelopes published without a budget.
pub const DEFAULT_CALL_BUDGET: i64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub max_hops: u32,
    pub ttl_unix_ms: i64,
    pub call_budget_remaining: i64,
}

impl Budget {
    /// The effective budget for a publish: caller-provided values win,
    /// absent fields take defaults relative to `now`.
    pub fn effective(provided: Option<BudgetSpec>, now: DateTime<Utc>) -> Self {
        let spec = provided.unwrap_or_default();
        Self {
            max_hops: spec.max_hops.unwrap_or(DEFAULT_MAX_HOPS),
            ttl_unix_ms: spec
                .ttl_unix_ms
                .unwrap_or_else(|| now.timestamp_millis() + DEFAULT_TTL_MS),
            call_budget_remaining: spec.call_budget_remaining.unwrap_or(DEFAULT_CALL_BUDGET),
        }
    }

    /// Why this envelope cannot be delivered, if anything.
    pub fn rejection_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if now.timestamp_millis() > self.ttl_unix_ms {
            Some("ttl_expired")
        } else if self.max_hops == 0 {
            Some("hops_exhausted")
        } else if self.call_budget_remaining <= 0 {
            Some("call_budget_exhausted")
        } else {
            None
        }
    }

    /// The budget a subscriber observes after delivery: one hop and one
    /// call consumed. An exhausted post-delivery budget cannot be used to
    /// publish a reply.
    pub fn after_delivery(&self) -> Self {
        Self {
            max_hops: self.max_hops.saturating_sub(1),
            ttl_unix_ms: self.ttl_unix_ms,
            call_budget_remaining: self.call_budget_remaining - 1,
        }
    }
}

/// Caller-supplied partial budget on publish.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hops: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_unix_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_budget_remaining: Option<i64>,
}

impl From<Budget> for BudgetSpec {
    fn from(budget: Budget) -> Self {
        Self {
            max_hops: Some(budget.max_hops),
            ttl_unix_ms: Some(budget.ttl_unix_ms),
            call_budget_remaining: Some(budget.call_budget_remaining),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: String,
    pub subject: String,
    /// Sender subject.
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub payload: Value,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub published_at: DateTime<Utc>,
    pub budget: Budget,
}
