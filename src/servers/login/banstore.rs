//! The `ipbanlist` durable store: ban-record CRUD and expiry sweeping.
//!
//! Pure pattern matching (turning an address into its wildcard
//! candidates, testing a stored pattern against an address) lives in
//! [`crate::network::ipban`]; this module is the database-backed half.

use crate::network::ipban::{pattern_matches, prefix24_pattern};
use sqlx::MySqlPool;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct BanRecord {
    pattern: String,
    start: i64,
    expiry: i64,
    reason: String,
}

pub struct BanStore {
    pool: Option<MySqlPool>,
    table: String,
    fake: Mutex<Vec<BanRecord>>,
}

impl BanStore {
    pub fn new(pool: Option<MySqlPool>, table: String) -> Self {
        BanStore { pool, table, fake: Mutex::new(Vec::new()) }
    }

    /// Returns true if any non-expired ban record matches one of `ip`'s
    /// four wildcard candidates. A query failure is treated as a hit —
    /// fail closed, unlike the fail-open pattern used elsewhere in this
    /// codebase.
    pub async fn is_banned(&self, ip: Ipv4Addr, now: i64) -> bool {
        let Some(pool) = &self.pool else {
            let fake = self.fake.lock().await;
            return fake.iter().any(|r| r.expiry > now && pattern_matches(&r.pattern, ip));
        };

        let sql = format!("SELECT list, btime, rtime, reason FROM `{}`", self.table);
        let rows: Result<Vec<(String, i64, i64, String)>, _> =
            sqlx::query_as(&sql).fetch_all(pool).await;
        match rows {
            Ok(rows) => rows
                .iter()
                .any(|(pattern, _, rtime, _)| *rtime > now && pattern_matches(pattern, ip)),
            Err(e) => {
                tracing::error!("[ipban] [query_failed] {}", e);
                true
            }
        }
    }

    /// Inserts a `/24` ban record for `ip`, expiring `duration_secs`
    /// from `now`.
    pub async fn record_dynamic_ban(&self, ip: Ipv4Addr, now: i64, duration_secs: i64, reason: &str) {
        let pattern = prefix24_pattern(ip);
        let expiry = now + duration_secs;

        if let Some(pool) = &self.pool {
            let sql = format!(
                "INSERT INTO `{}` (list, btime, rtime, reason) VALUES (?, ?, ?, ?)",
                self.table
            );
            let _ = sqlx::query(&sql)
                .bind(&pattern)
                .bind(now)
                .bind(expiry)
                .bind(reason)
                .execute(pool)
                .await;
            return;
        }

        let mut fake = self.fake.lock().await;
        fake.push(BanRecord { pattern, start: now, expiry, reason: reason.to_string() });
    }

    /// Deletes every record whose expiry has passed; returns the count removed.
    pub async fn sweep_expired(&self, now: i64) -> u64 {
        if let Some(pool) = &self.pool {
            let sql = format!("DELETE FROM `{}` WHERE rtime <= ?", self.table);
            return sqlx::query(&sql)
                .bind(now)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
                .unwrap_or(0);
        }
        let mut fake = self.fake.lock().await;
        let before = fake.len();
        fake.retain(|r| r.expiry > now);
        (before - fake.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbanned_ip_passes() {
        let store = BanStore::new(None, "ipbanlist".into());
        assert!(!store.is_banned("10.0.0.5".parse().unwrap(), 1000).await);
    }

    #[tokio::test]
    async fn dynamic_ban_matches_same_24() {
        let store = BanStore::new(None, "ipbanlist".into());
        store.record_dynamic_ban("10.0.0.5".parse().unwrap(), 1000, 300, "password error ban: alice").await;
        assert!(store.is_banned("10.0.0.200".parse().unwrap(), 1000).await);
        assert!(!store.is_banned("10.0.1.5".parse().unwrap(), 1000).await);
    }

    #[tokio::test]
    async fn expired_ban_does_not_match() {
        let store = BanStore::new(None, "ipbanlist".into());
        store.record_dynamic_ban("10.0.0.5".parse().unwrap(), 1000, 300, "reason").await;
        assert!(!store.is_banned("10.0.0.5".parse().unwrap(), 2000).await);
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_rows() {
        let store = BanStore::new(None, "ipbanlist".into());
        store.record_dynamic_ban("10.0.0.5".parse().unwrap(), 1000, 300, "reason").await;
        let removed = store.sweep_expired(2000).await;
        assert_eq!(removed, 1);
        assert!(!store.is_banned("10.0.0.5".parse().unwrap(), 1000).await);
    }
}
