pub mod analysis;
mod normalize;

pub use normalize::PlanNormalizer;

use std::sync::Arc;
use sysop_core::{Plan, PlanContext};
use sysop_llm::BackendRegistry;
use sysop_observe::Observer;
use sysop_store::PlanStore;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum PlanningError {
    /// The planning backend was unknown, unreachable or replied with junk.
    #[error("planning backend failed: {0:#}")]
    Collaborator(anyhow::Error),
    #[error("plan storage failed: {0:#}")]
    Storage(anyhow::Error),
}

/// Creates plans through a backend, normalizes and stores them.
pub struct PlanService {
    backends: BackendRegistry,
    normalizer: PlanNormalizer,
    store: PlanStore,
    observer: Arc<Observer>,
}

impl PlanService {
    pub fn new(backends: BackendRegistry, store: PlanStore, observer: Arc<Observer>) -> Self {
        Self {
            backends,
            normalizer: PlanNormalizer::new(),
            store,
            observer,
        }
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    /// Asks `backend` (or the default) for a plan. Plans without steps are
    /// returned but not persisted.
    pub fn create(
        &self,
        request: &str,
        context: &PlanContext,
        backend: Option<&str>,
    ) -> Result<Plan, PlanningError> {
        let backend = self.backends.get(backend).map_err(PlanningError::Collaborator)?;
        let raw = backend.generate(request, context).map_err(|err| {
            warn!(backend = backend.name(), error = %err, "planning backend failed");
            PlanningError::Collaborator(err)
        })?;
        let plan = self.normalizer.normalize(&raw, request, Some(context));
        if plan.steps.is_empty() {
            info!(backend = backend.name(), "backend returned a plan with no steps");
            return Ok(plan);
        }
        self.store.save(&plan).map_err(PlanningError::Storage)?;
        self.observer.plan_created(&plan);
        info!(plan_id = %plan.id, name = %plan.name, steps = plan.steps.len(), "plan created");
        Ok(plan)
    }

    pub fn get(&self, plan_id: &str) -> Result<Option<Plan>, PlanningError> {
        self.store.load(plan_id).map_err(PlanningError::Storage)
    }

    pub fn list(&self) -> Result<Vec<Plan>, PlanningError> {
        self.store.list().map_err(PlanningError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sysop_testkit::ScriptedBackend;

    fn service(backend: ScriptedBackend, dir: &std::path::Path) -> PlanService {
        let registry = BackendRegistry::new(Arc::new(backend));
        let store = PlanStore::open(&dir.join("plans")).expect("store");
        PlanService::new(registry, store, Arc::new(Observer::disabled()))
    }

    #[test]
    fn create_persists_plans_with_steps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(
            ScriptedBackend::new("scripted", vec![json!({"plan": "Disk", "steps": ["df -h"]})]),
            dir.path(),
        );
        let plan = svc
            .create("check disk", &PlanContext::default(), None)
            .expect("plan");
        let loaded = svc.get(&plan.id).expect("load").expect("stored");
        assert_eq!(loaded.name, "Disk");
        assert_eq!(loaded.steps, plan.steps);
        assert_eq!(svc.list().expect("list").len(), 1);
    }

    #[test]
    fn empty_plans_are_not_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(
            ScriptedBackend::new("scripted", vec![json!({"plan": "Nothing", "steps": []})]),
            dir.path(),
        );
        let plan = svc.create("nothing", &PlanContext::default(), None).expect("plan");
        assert!(plan.steps.is_empty());
        assert!(svc.get(&plan.id).expect("load").is_none());
    }

    #[test]
    fn backend_failures_and_unknown_names_are_collaborator_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(ScriptedBackend::failing("scripted", "quota exceeded"), dir.path());
        let err = svc
            .create("x", &PlanContext::default(), None)
            .expect_err("failure");
        assert!(matches!(err, PlanningError::Collaborator(_)));
        assert!(err.to_string().contains("quota exceeded"));

        let err = svc
            .create("x", &PlanContext::default(), Some("gemini"))
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown planning backend 'gemini'"));
    }
}
