use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::error::internal_error;
use crate::models::{CoreError, TaskKind};

/// Which shared resource a task kind is bound by.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResourceClass {
    Inference,
    Store,
}

impl ResourceClass {
    pub fn of(kind: TaskKind) -> Self {
        match kind {
            TaskKind::QueryGeneration
            | TaskKind::RelevanceScoring
            | TaskKind::CitationExtraction
            | TaskKind::ReportSynthesis
            | TaskKind::CounterfactualAnalysis => Self::Inference,
        }
    }
}

/// Process-wide admission control. The inference gate has exactly one permit; the store
/// gate allows a configured number of parallel readers.
#[derive(Clone, Debug)]
pub struct ResourceGates {
    inference: Arc<Semaphore>,
    store: Arc<Semaphore>,
}

impl ResourceGates {
    pub fn new(store_concurrency: usize) -> Self {
        Self {
            inference: Arc::new(Semaphore::new(1)),
            store: Arc::new(Semaphore::new(store_concurrency.max(1))),
        }
    }

    pub async fn acquire(&self, class: ResourceClass) -> Result<OwnedSemaphorePermit, CoreError> {
        let semaphore = match class {
            ResourceClass::Inference => self.inference.clone(),
            ResourceClass::Store => self.store.clone(),
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| internal_error(format!("{class:?} gate was closed")))
    }

    pub fn available(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Inference => self.inference.available_permits(),
            ResourceClass::Store => self.store.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ResourceClass, ResourceGates};

    #[tokio::test]
    async fn inference_gate_admits_one_caller() {
        let gates = ResourceGates::new(3);
        assert_eq!(gates.available(ResourceClass::Inference), 1);
        assert_eq!(gates.available(ResourceClass::Store), 3);

        let held = gates.acquire(ResourceClass::Inference).await.unwrap();
        assert_eq!(gates.available(ResourceClass::Inference), 0);
        assert_eq!(gates.available(ResourceClass::Store), 3);
        drop(held);
        assert_eq!(gates.available(ResourceClass::Inference), 1);
    }

    #[test]
    fn zero_store_concurrency_still_admits_one() {
        let gates = ResourceGates::new(0);
        assert_eq!(gates.available(ResourceClass::Store), 1);
    }
}
