//! Exclusive leases
//!
//! A lease is a keyed lock with a time to live. Failing to take one is a
//! soft failure: [`in_lock`] returns `Ok(None)` and the caller defers.

use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceResult;
use crate::service::context::ServiceContext;

pub fn processing_key(pipeline_id: i64) -> String {
    format!("pipeline_processing:{}", pipeline_id)
}

pub fn trace_write_key(job_id: i64) -> String {
    format!("trace_write:{}", job_id)
}

pub fn unlock_pipeline_key(pipeline_id: i64) -> String {
    format!("unlock_pipeline:{}", pipeline_id)
}

pub const EXPIRE_ARTIFACTS_KEY: &str = "expire_job_artifacts";

/// Run `work` while holding the lease `key`
///
/// Returns `Ok(None)` without running `work` when another owner holds the
/// lease. The lease is released afterwards whatever `work` returned.
pub async fn in_lock<T, F, Fut>(
    ctx: &ServiceContext,
    key: &str,
    ttl: Duration,
    work: F,
) -> ServiceResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let owner = Uuid::new_v4();
    if !ctx.store.try_obtain_lease(key, owner, ttl).await? {
        tracing::debug!(key, "Lease is held elsewhere");
        return Ok(None);
    }

    let result = work().await;

    if let Err(err) = ctx.store.release_lease(key, owner).await {
        // Expires on its own
        tracing::warn!(key, "Failed to release lease: {}", err);
    }

    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::service::test_support::TestEnv;

    #[tokio::test]
    async fn test_in_lock_runs_and_releases() {
        let env = TestEnv::new();
        let ttl = Duration::from_secs(60);

        let value = in_lock(&env.ctx, "k", ttl, || async { Ok(7) }).await.unwrap();
        assert_eq!(value, Some(7));

        // Released, so it can be taken again
        let value = in_lock(&env.ctx, "k", ttl, || async { Ok(8) }).await.unwrap();
        assert_eq!(value, Some(8));
    }

    #[tokio::test]
    async fn test_in_lock_defers_when_held() {
        let env = TestEnv::new();
        let ttl = Duration::from_secs(60);
        env.ctx
            .store
            .try_obtain_lease("k", Uuid::new_v4(), ttl)
            .await
            .unwrap();

        let value = in_lock(&env.ctx, "k", ttl, || async { Ok(1) }).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_in_lock_releases_after_error() {
        let env = TestEnv::new();
        let ttl = Duration::from_secs(60);

        let result: ServiceResult<Option<()>> = in_lock(&env.ctx, "k", ttl, || async {
            Err(ServiceError::internal("boom"))
        })
        .await;
        assert!(result.is_err());

        let value = in_lock(&env.ctx, "k", ttl, || async { Ok(()) }).await.unwrap();
        assert_eq!(value, Some(()));
    }
}
