//! Async facade over the runner, worker pool and run store.

use std::sync::Arc;

use hypothesis_protocol_core::{
    AnalysisError, AnalysisResult, ColumnRoles, Dataset, Engine, MethodId, Selection,
    SelectionRequest,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::pool::{PoolError, WorkerPool};
use crate::protocol::{Protocol, ProtocolRunRecord};
use crate::runner::ProtocolRunner;
use crate::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Methods sent to the worker pool rather than run inline.
fn is_heavy(method: MethodId) -> bool {
    matches!(
        method,
        MethodId::MixedEffects | MethodId::ClusteredCorrelation | MethodId::CoxRegression
    )
}

pub struct ProtocolService {
    runner: ProtocolRunner,
    pool: Arc<WorkerPool>,
    store: Option<Arc<dyn RunStore>>,
}

impl ProtocolService {
    pub fn new(engine: Engine, pool: Arc<WorkerPool>, store: Option<Arc<dyn RunStore>>) -> Self {
        Self {
            runner: ProtocolRunner::new(engine),
            pool,
            store,
        }
    }

    pub fn engine(&self) -> &Engine {
        self.runner.engine()
    }

    pub fn select_method(
        &self,
        dataset: &Dataset,
        request: &SelectionRequest<'_>,
    ) -> Result<Selection, ServiceError> {
        Ok(self.engine().select_method(dataset, request)?)
    }

    /// Execute one method; heavy methods go through the worker pool.
    pub async fn execute(
        &self,
        method: MethodId,
        dataset: Arc<Dataset>,
        roles: ColumnRoles,
        options: Map<String, Value>,
    ) -> Result<AnalysisResult, ServiceError> {
        if !is_heavy(method) {
            return Ok(self.engine().execute(method, &dataset, &roles, &options)?);
        }
        let engine = self.engine().clone();
        let result = self
            .pool
            .run(method.as_str(), move || {
                engine.execute(method, &dataset, &roles, &options)
            })
            .await?;
        Ok(result?)
    }

    /// Run a protocol on the worker pool and persist the record.
    pub async fn run_protocol(
        &self,
        dataset: Arc<Dataset>,
        protocol: Protocol,
    ) -> Result<ProtocolRunRecord, ServiceError> {
        let runner = self.runner.clone();
        let label = format!("protocol '{}'", protocol.name);
        let record = self
            .pool
            .run(&label, move || runner.run(&dataset, &protocol))
            .await?;

        if let Some(store) = &self.store {
            let path = store.save(&record)?;
            info!(run_id = %record.run_id, path = %path.display(), "run persisted");
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RunStatus;
    use crate::store::JsonRunStore;
    use hypothesis_protocol_core::Column;
    use std::time::Duration;
    use tempfile::TempDir;

    fn dataset() -> Arc<Dataset> {
        Arc::new(
            Dataset::new("svc")
                .with_column("y", Column::numeric([1.0, 2.0, 3.0, 4.0, 6.0, 7.0, 8.0, 9.0]))
                .unwrap()
                .with_column("g", Column::categorical(["a", "a", "a", "a", "b", "b", "b", "b"]))
                .unwrap(),
        )
    }

    fn protocol() -> Protocol {
        serde_json::from_value(serde_json::json!({
            "name": "svc",
            "steps": [{"id": "s1", "type": "compare", "target": "y", "group": "g"}]
        }))
        .unwrap()
    }

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(2, Duration::from_secs(30), 3))
    }

    #[tokio::test]
    async fn test_run_protocol_persists() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(dir.path()));
        let service = ProtocolService::new(Engine::default(), pool(), Some(Arc::clone(&store)));

        let record = service.run_protocol(dataset(), protocol()).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(store.list("svc").unwrap(), vec![record.run_id.clone()]);
        let loaded = store.load("svc", &record.run_id).unwrap();
        assert_eq!(loaded.run_id, record.run_id);
        assert_eq!(loaded.log, record.log);
        assert!(loaded.results["s1"].analysis().is_some());
    }

    #[tokio::test]
    async fn test_reruns_produce_new_records() {
        let service = ProtocolService::new(Engine::default(), pool(), None);
        let first = service.run_protocol(dataset(), protocol()).await.unwrap();
        let second = service.run_protocol(dataset(), protocol()).await.unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.results, second.results);
    }

    #[tokio::test]
    async fn test_execute_inline_and_error() {
        let service = ProtocolService::new(Engine::default(), pool(), None);
        let result = service
            .execute(
                MethodId::TTestInd,
                dataset(),
                ColumnRoles::grouped("y", "g"),
                Map::new(),
            )
            .await
            .unwrap();
        assert!(result.p_value.is_some());

        let err = service
            .execute(
                MethodId::ClusteredCorrelation,
                dataset(),
                ColumnRoles::default(),
                Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Analysis(_)));
    }
}
