use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{api_key_prefix, generate_api_key, hash_api_key};
use crate::model::{Credential, Priority, RateLimitRule, RequestLog};
use crate::ratelimit::UserRuleLoader;

/// Read path the core's Credential Validator and user-rule loader both use.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup_by_hash(&self, hash_hex: &str) -> anyhow::Result<Option<Credential>>;
}

/// Fire-and-forget usage sink: persistence errors are logged, never surfaced.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, log: RequestLog);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialCounts {
    pub total: i64,
    pub active: i64,
    pub expired: i64,
    pub revoked: i64,
}

/// Usage summary over a time range, optionally narrowed to one user or API.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_requests: i64,
    pub total_sse_messages: i64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub sse_connections: i64,
    pub rate_limited_count: i64,
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                priority TEXT NOT NULL DEFAULT 'normal',
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked_at TEXT,
                rate_limit_override TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_key_hash ON credentials(key_hash);

            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key_id TEXT NOT NULL,
                api_identifier TEXT NOT NULL,
                request_path TEXT NOT NULL,
                request_method TEXT NOT NULL,
                response_status INTEGER NOT NULL,
                request_time TEXT NOT NULL,
                response_time_ms INTEGER NOT NULL,
                client_ip TEXT NOT NULL,
                is_sse INTEGER NOT NULL DEFAULT 0,
                sse_message_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_api_key_id ON request_logs(api_key_id);
            CREATE INDEX IF NOT EXISTS idx_request_logs_api_identifier ON request_logs(api_identifier);
            CREATE INDEX IF NOT EXISTS idx_request_logs_request_time ON request_logs(request_time);
            ",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn create(
        &self,
        description: String,
        priority: Priority,
        expires_in_days: Option<i64>,
        rate_limit_override: Option<RateLimitRule>,
    ) -> anyhow::Result<(String, Credential)> {
        let raw_key = generate_api_key();
        let credential = Credential {
            id: Uuid::new_v4().to_string(),
            key_hash: hash_api_key(&raw_key),
            key_prefix: api_key_prefix(&raw_key),
            description,
            priority,
            created_at: Utc::now(),
            expires_at: expires_in_days.map(|d| Utc::now() + ChronoDuration::days(d)),
            revoked_at: None,
            rate_limit_override,
        };

        let conn = self.conn.clone();
        let row = credential.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO credentials (id, key_hash, key_prefix, description, priority, created_at, expires_at, revoked_at, rate_limit_override)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.id,
                    row.key_hash,
                    row.key_prefix,
                    row.description,
                    priority_to_str(row.priority),
                    row.created_at.to_rfc3339(),
                    row.expires_at.map(|t| t.to_rfc3339()),
                    row.revoked_at.map(|t| t.to_rfc3339()),
                    row.rate_limit_override.map(|r| serde_json::to_string(&r).unwrap()),
                ],
            )?;
            Ok(())
        })
        .await??;

        Ok((raw_key, credential))
    }

    pub async fn list(&self, include_revoked: bool, include_expired: bool) -> anyhow::Result<Vec<Credential>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Credential>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT * FROM credentials ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], row_to_credential)?;
            let mut out = Vec::new();
            for row in rows {
                let credential = row?;
                if !include_revoked && credential.is_revoked() {
                    continue;
                }
                if !include_expired && credential.is_expired() {
                    continue;
                }
                out.push(credential);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Credential>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Credential>> {
            let conn = conn.blocking_lock();
            conn.query_row("SELECT * FROM credentials WHERE id = ?1", params![id], row_to_credential)
                .optional()
                .map_err(Into::into)
        })
        .await?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update(
        &self,
        id: &str,
        description: Option<String>,
        priority: Option<Priority>,
        expires_at: Option<Option<DateTime<Utc>>>,
        rate_limit_override: Option<Option<RateLimitRule>>,
    ) -> anyhow::Result<Option<Credential>> {
        let Some(mut credential) = self.get(id).await? else {
            return Ok(None);
        };
        if let Some(d) = description {
            credential.description = d;
        }
        if let Some(p) = priority {
            credential.priority = p;
        }
        if let Some(e) = expires_at {
            credential.expires_at = e;
        }
        if let Some(r) = rate_limit_override {
            credential.rate_limit_override = r;
        }

        let conn = self.conn.clone();
        let row = credential.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE credentials SET description = ?1, priority = ?2, expires_at = ?3, rate_limit_override = ?4 WHERE id = ?5",
                params![
                    row.description,
                    priority_to_str(row.priority),
                    row.expires_at.map(|t| t.to_rfc3339()),
                    row.rate_limit_override.map(|r| serde_json::to_string(&r).unwrap()),
                    row.id,
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(Some(credential))
    }

    pub async fn revoke(&self, id: &str) -> anyhow::Result<Option<Credential>> {
        let Some(mut credential) = self.get(id).await? else {
            return Ok(None);
        };
        credential.revoked_at = Some(Utc::now());
        let conn = self.conn.clone();
        let revoked_at = credential.revoked_at.unwrap().to_rfc3339();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            conn.blocking_lock()
                .execute("UPDATE credentials SET revoked_at = ?1 WHERE id = ?2", params![revoked_at, id])?;
            Ok(())
        })
        .await??;
        Ok(Some(credential))
    }

    pub async fn refresh(&self, id: &str) -> anyhow::Result<Option<(String, Credential)>> {
        let Some(mut credential) = self.get(id).await? else {
            return Ok(None);
        };
        let new_raw_key = generate_api_key();
        credential.key_hash = hash_api_key(&new_raw_key);
        credential.key_prefix = api_key_prefix(&new_raw_key);

        let conn = self.conn.clone();
        let row = credential.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            conn.blocking_lock().execute(
                "UPDATE credentials SET key_hash = ?1, key_prefix = ?2 WHERE id = ?3",
                params![row.key_hash, row.key_prefix, row.id],
            )?;
            Ok(())
        })
        .await??;
        Ok(Some((new_raw_key, credential)))
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let changed = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            Ok(conn.blocking_lock().execute("DELETE FROM credentials WHERE id = ?1", params![id])?)
        })
        .await??;
        Ok(changed > 0)
    }

    pub async fn counts(&self) -> anyhow::Result<CredentialCounts> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<CredentialCounts> {
            let conn = conn.blocking_lock();
            let now = Utc::now().to_rfc3339();
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM credentials", [], |r| r.get(0))?;
            let active: i64 = conn.query_row(
                "SELECT COUNT(*) FROM credentials WHERE revoked_at IS NULL AND (expires_at IS NULL OR expires_at > ?1)",
                params![now],
                |r| r.get(0),
            )?;
            let expired: i64 = conn.query_row(
                "SELECT COUNT(*) FROM credentials WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
                |r| r.get(0),
            )?;
            let revoked: i64 =
                conn.query_row("SELECT COUNT(*) FROM credentials WHERE revoked_at IS NOT NULL", [], |r| r.get(0))?;
            Ok(CredentialCounts { total, active, expired, revoked })
        })
        .await?
    }

    /// Aggregates `request_logs` over `[start, end]` (defaulting to the last
    /// 7 days), optionally narrowed to one credential or API identifier.
    pub async fn usage_stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        api_key_id: Option<String>,
        api_identifier: Option<String>,
    ) -> anyhow::Result<UsageStats> {
        let conn = self.conn.clone();
        let end = end.unwrap_or_else(Utc::now);
        let start = start.unwrap_or(end - ChronoDuration::days(7));
        tokio::task::spawn_blocking(move || -> anyhow::Result<UsageStats> {
            let conn = conn.blocking_lock();

            let mut clauses = vec!["request_time >= ?1".to_string(), "request_time <= ?2".to_string()];
            let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(start.to_rfc3339()), Box::new(end.to_rfc3339())];
            if let Some(id) = api_key_id {
                clauses.push(format!("api_key_id = ?{}", params.len() + 1));
                params.push(Box::new(id));
            }
            if let Some(api) = api_identifier {
                clauses.push(format!("api_identifier = ?{}", params.len() + 1));
                params.push(Box::new(api));
            }

            let sql = format!(
                "SELECT COUNT(*), COALESCE(SUM(sse_message_count), 0), COALESCE(AVG(response_time_ms), 0.0), \
                 COALESCE(SUM(is_sse), 0), \
                 COALESCE(SUM(CASE WHEN response_status BETWEEN 200 AND 299 THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN response_status = 429 THEN 1 ELSE 0 END), 0) \
                 FROM request_logs WHERE {}",
                clauses.join(" AND ")
            );
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

            let (total_requests, total_sse_messages, avg_response_time_ms, sse_connections, success_count, rate_limited_count): (
                i64,
                i64,
                f64,
                i64,
                i64,
                i64,
            ) = conn.query_row(&sql, param_refs.as_slice(), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })?;

            let success_rate =
                if total_requests > 0 { success_count as f64 / total_requests as f64 * 100.0 } else { 0.0 };

            Ok(UsageStats {
                start_time: start,
                end_time: end,
                total_requests,
                total_sse_messages,
                success_rate,
                avg_response_time_ms,
                sse_connections,
                rate_limited_count,
            })
        })
        .await?
    }

    /// Deletes request logs older than `retention_days`; returns the number removed.
    pub async fn sweep_old_logs(&self, retention_days: i64) -> anyhow::Result<usize> {
        let conn = self.conn.clone();
        let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).to_rfc3339();
        tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            Ok(conn
                .blocking_lock()
                .execute("DELETE FROM request_logs WHERE request_time < ?1", params![cutoff])?)
        })
        .await?
    }
}

fn priority_to_str(p: Priority) -> &'static str {
    match p {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn priority_from_str(s: &str) -> Priority {
    match s {
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Normal,
    }
}

fn row_to_credential(row: &rusqlite::Row) -> rusqlite::Result<Credential> {
    let priority: String = row.get("priority")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let revoked_at: Option<String> = row.get("revoked_at")?;
    let rate_limit_override: Option<String> = row.get("rate_limit_override")?;
    Ok(Credential {
        id: row.get("id")?,
        key_hash: row.get("key_hash")?,
        key_prefix: row.get("key_prefix")?,
        description: row.get("description")?,
        priority: priority_from_str(&priority),
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        expires_at: expires_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        revoked_at: revoked_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        rate_limit_override: rate_limit_override.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn lookup_by_hash(&self, hash_hex: &str) -> anyhow::Result<Option<Credential>> {
        let conn = self.conn.clone();
        let hash_hex = hash_hex.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Credential>> {
            conn.blocking_lock()
                .query_row("SELECT * FROM credentials WHERE key_hash = ?1", params![hash_hex], row_to_credential)
                .optional()
                .map_err(Into::into)
        })
        .await?
    }
}

#[async_trait]
impl UsageSink for SqliteStore {
    async fn record(&self, log: RequestLog) {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            conn.blocking_lock().execute(
                "INSERT INTO request_logs (api_key_id, api_identifier, request_path, request_method, response_status, request_time, response_time_ms, client_ip, is_sse, sse_message_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    log.api_key_id,
                    log.api_identifier,
                    log.path,
                    log.method,
                    log.response_status,
                    log.request_time.to_rfc3339(),
                    log.response_time_ms,
                    log.client_ip,
                    log.is_sse as i64,
                    log.sse_message_count,
                ],
            )?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to persist request log"),
            Err(err) => warn!(error = %err, "request log persistence task panicked"),
        }
    }
}

/// Adapts the credential store's per-credential override into the
/// rate-limiter's `UserRuleLoader` collaborator: the "user id" is the
/// credential id, and the loaded rule is whatever override is stored there.
pub struct StoreBackedRuleLoader {
    pub store: Arc<SqliteStore>,
}

#[async_trait]
impl UserRuleLoader for StoreBackedRuleLoader {
    async fn load_rule(&self, user_id: &str) -> anyhow::Result<Option<RateLimitRule>> {
        Ok(self.store.get(user_id).await?.and_then(|c| c.rate_limit_override))
    }
}

pub async fn run_retention_sweeper(store: Arc<SqliteStore>, retention_days: i64, interval_hours: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_hours * 3600));
    loop {
        interval.tick().await;
        match store.sweep_old_logs(retention_days).await {
            Ok(0) => {}
            Ok(n) => info!(deleted = n, retention_days, "cleaned up old request logs"),
            Err(err) => warn!(error = %err, "request log retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_lookup_revoke_round_trip() {
        let store = SqliteStore::open(":memory:").unwrap();
        let (raw_key, credential) = store.create("test".into(), Priority::Normal, None, None).await.unwrap();

        let hash = hash_api_key(&raw_key);
        let looked_up = store.lookup_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(looked_up.id, credential.id);
        assert!(looked_up.is_valid());

        let revoked = store.revoke(&credential.id).await.unwrap().unwrap();
        assert!(revoked.is_revoked());
        let looked_up_again = store.lookup_by_hash(&hash).await.unwrap().unwrap();
        assert!(!looked_up_again.is_valid());
    }

    #[tokio::test]
    async fn refresh_rotates_hash_but_keeps_id() {
        let store = SqliteStore::open(":memory:").unwrap();
        let (old_raw, credential) = store.create("test".into(), Priority::Normal, None, None).await.unwrap();
        let (new_raw, refreshed) = store.refresh(&credential.id).await.unwrap().unwrap();

        assert_eq!(refreshed.id, credential.id);
        assert_ne!(old_raw, new_raw);
        assert!(store.lookup_by_hash(&hash_api_key(&old_raw)).await.unwrap().is_none());
        assert!(store.lookup_by_hash(&hash_api_key(&new_raw)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let store = SqliteStore::open(":memory:").unwrap();
        let (_, credential) = store.create("test".into(), Priority::Normal, None, None).await.unwrap();
        assert!(store.delete(&credential.id).await.unwrap());
        assert!(store.get(&credential.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_logs_older_than_retention() {
        let store = SqliteStore::open(":memory:").unwrap();
        store
            .record(RequestLog {
                api_key_id: "k".into(),
                api_identifier: "GET /x".into(),
                method: "GET".into(),
                path: "/x".into(),
                response_status: 200,
                request_time: Utc::now() - ChronoDuration::days(40),
                response_time_ms: 5,
                client_ip: "127.0.0.1".into(),
                is_sse: false,
                sse_message_count: 0,
            })
            .await;
        let deleted = store.sweep_old_logs(30).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
