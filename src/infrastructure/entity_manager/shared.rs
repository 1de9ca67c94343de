// Shared Entity Manager - a manager behind an async mutex
// The lock is never held across a transport call, so other tasks can read
// and edit the cache while a query or save is in flight.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::query::{QueryOutcome, QueryPlan};
use super::save::SaveOutcome;
use super::EntityManager;
use crate::core::strong_types::EntityId;
use crate::error::AppResult;
use crate::query::entity_query::EntityQuery;

#[derive(Clone)]
pub struct SharedEntityManager {
    inner: Arc<Mutex<EntityManager>>,
}

impl SharedEntityManager {
    pub fn new(manager: EntityManager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    /// Exclusive access for synchronous work.
    pub async fn lock(&self) -> MutexGuard<'_, EntityManager> {
        self.inner.lock().await
    }

    pub async fn fetch_metadata(&self) -> AppResult<()> {
        let (adapter, service_name) = {
            let manager = self.inner.lock().await;
            (
                manager.begin_fetch_metadata()?,
                manager.config().service_name.clone(),
            )
        };
        let raw = adapter.fetch_metadata(&service_name).await;
        self.inner.lock().await.complete_fetch_metadata(raw)
    }

    pub async fn execute_query(&self, query: &EntityQuery) -> AppResult<QueryOutcome> {
        if self.inner.lock().await.needs_metadata() {
            self.fetch_metadata().await?;
        }
        let plan = self.inner.lock().await.plan_query(query)?;
        match plan {
            QueryPlan::Local(outcome) => Ok(outcome),
            QueryPlan::Remote { uri, adapter } => {
                debug!(uri = %uri, "remote query dispatched without the manager lock");
                let raw = adapter.execute_query(&uri).await;
                self.inner.lock().await.complete_remote_query(query, uri, raw)
            }
        }
    }

    /// Entities stay flagged as being saved while the request is in flight;
    /// a second save touching any of them fails with `ConcurrentSave`
    /// unless concurrent saves are allowed.
    pub async fn save_changes(&self, entities: Option<Vec<EntityId>>) -> AppResult<SaveOutcome> {
        let prepared = self.inner.lock().await.begin_save(entities.as_deref())?;
        let Some(adapter) = prepared.adapter.clone() else {
            return Ok(SaveOutcome::default());
        };
        let raw = adapter.save_changes(&prepared.bundle).await;
        self.inner.lock().await.complete_save(prepared, raw)
    }
}
