//! Exclusive lease repository
//!
//! A lease row is taken with a single upsert that only overwrites the row
//! when it expired or already belongs to the caller.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::repository::{LeaseStore, PgStore};

#[async_trait]
impl LeaseStore for PgStore {
    async fn try_obtain_lease(&self, key: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));

        let result = sqlx::query(
            r#"
            INSERT INTO exclusive_leases (key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE exclusive_leases.expires_at <= $4 OR exclusive_leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, key: &str, owner: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM exclusive_leases WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
