use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Lower rank sorts first: HIGH < NORMAL < LOW.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Three independently-optional numeric ceilings. `None` means "no constraint
/// at this level."
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sse_connections: Option<u32>,
}

impl RateLimitRule {
    pub const fn new(
        max_concurrent: Option<u32>,
        max_requests_per_minute: Option<u32>,
        max_sse_connections: Option<u32>,
    ) -> Self {
        Self {
            max_concurrent,
            max_requests_per_minute,
            max_sse_connections,
        }
    }

    /// Field-wise merge: a `Some` in `override_rule` wins over `self`.
    pub fn merged_with(&self, override_rule: &RateLimitRule) -> RateLimitRule {
        RateLimitRule {
            max_concurrent: override_rule.max_concurrent.or(self.max_concurrent),
            max_requests_per_minute: override_rule
                .max_requests_per_minute
                .or(self.max_requests_per_minute),
            max_sse_connections: override_rule.max_sse_connections.or(self.max_sse_connections),
        }
    }
}

/// A bearer-token credential. The raw token itself is never stored; only its
/// SHA-256 hash and a short display prefix survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rate_limit_override: Option<RateLimitRule>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|e| e <= Utc::now()).unwrap_or(false)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_valid(&self) -> bool {
        !self.is_expired() && !self.is_revoked()
    }
}

/// One row posted to the usage sink after a request completes.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub api_key_id: String,
    pub api_identifier: String,
    pub method: String,
    pub path: String,
    pub response_status: u16,
    pub request_time: DateTime<Utc>,
    pub response_time_ms: u64,
    pub client_ip: String,
    pub is_sse: bool,
    pub sse_message_count: u32,
}
