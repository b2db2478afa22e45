//! Optimistic locking with bounded retries
//!
//! [`retry_lock`] applies a change to a record and saves it with a
//! compare-and-set on `lock_version`. A stale write or an invalid status
//! transition reloads the record and tries again, up to `max_lock_retries`
//! attempts; the last error is returned after that.

use async_trait::async_trait;
use conduit_core::domain::job::Job;
use conduit_core::domain::pipeline::Pipeline;

use crate::error::{Reason, ServiceError, ServiceResult, StoreResult};
use crate::repository::Store;
use crate::service::context::ServiceContext;

/// Record persisted with a `lock_version`
#[async_trait]
pub trait Versioned: Clone + Send + Sync + Sized {
    const ENTITY: &'static str;

    fn id(&self) -> i64;
    async fn save(&self, store: &dyn Store) -> StoreResult<Self>;
    async fn reload(&self, store: &dyn Store) -> StoreResult<Option<Self>>;
}

#[async_trait]
impl Versioned for Job {
    const ENTITY: &'static str = "job";

    fn id(&self) -> i64 {
        self.id
    }

    async fn save(&self, store: &dyn Store) -> StoreResult<Self> {
        store.update_job(self).await
    }

    async fn reload(&self, store: &dyn Store) -> StoreResult<Option<Self>> {
        store.find_job(self.id).await
    }
}

#[async_trait]
impl Versioned for Pipeline {
    const ENTITY: &'static str = "pipeline";

    fn id(&self) -> i64 {
        self.id
    }

    async fn save(&self, store: &dyn Store) -> StoreResult<Self> {
        store.update_pipeline(self).await
    }

    async fn reload(&self, store: &dyn Store) -> StoreResult<Option<Self>> {
        store.find_pipeline(self.id).await
    }
}

/// Apply `change` and save, retrying against fresh state on conflicts
pub async fn retry_lock<T, F>(ctx: &ServiceContext, record: T, mut change: F) -> ServiceResult<T>
where
    T: Versioned,
    F: FnMut(&mut T) -> ServiceResult<()> + Send,
{
    let max_attempts = ctx.limits().max_lock_retries.max(1);
    let mut current = record;
    let mut attempt = 0;

    loop {
        attempt += 1;

        let mut candidate = current.clone();
        let error = match change(&mut candidate) {
            Ok(()) => match candidate.save(ctx.store.as_ref()).await {
                Ok(saved) => return Ok(saved),
                Err(err) if err.is_stale() => ServiceError::from(err),
                Err(err) => return Err(err.into()),
            },
            Err(err) if err.reason == Reason::UnprocessableEntity => err,
            Err(err) => return Err(err),
        };

        if attempt >= max_attempts {
            tracing::debug!(
                entity = T::ENTITY,
                id = current.id(),
                attempt,
                "Giving up after repeated conflicts"
            );
            return Err(error);
        }

        current = current.reload(ctx.store.as_ref()).await?.ok_or_else(|| {
            ServiceError::not_found(format!("{} {} not found", T::ENTITY, current.id()))
        })?;
    }
}
