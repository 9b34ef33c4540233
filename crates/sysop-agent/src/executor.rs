use crate::planner::{PlanService, PlanningError};
use anyhow::anyhow;
use serde_json::{Value, json};
use std::sync::Arc;
use sysop_core::{
    DeferredExecutionRequest, ExecutionOutcome, ExecutionRequest, ExecutionResult, Plan,
    PlanContext, Step, StepOutcome, StepSelection,
};
use sysop_jsonrpc::{DispatchError, Dispatcher};
use sysop_observe::Observer;
use sysop_policy::{PolicyError, SafetyGate};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("no_plan_provided")]
    NoPlanProvided,
    #[error("plan not found: {0}")]
    PlanNotFound(String),
    #[error("backend returned a plan with no steps")]
    EmptyPlan,
    #[error(transparent)]
    Planning(#[from] PlanningError),
}

/// Runs plan steps through the command dispatcher once the safety gate
/// allows it. Steps run in the order requested; a failing step never stops
/// the ones after it.
pub struct ExecutionEngine {
    commands: Arc<Dispatcher>,
    planner: Arc<PlanService>,
    gate: SafetyGate,
    observer: Arc<Observer>,
}

enum Prepared {
    Blocked(ExecutionOutcome),
    Preview(ExecutionOutcome),
    Run(Vec<usize>),
}

impl ExecutionEngine {
    pub fn new(commands: Arc<Dispatcher>, planner: Arc<PlanService>, observer: Arc<Observer>) -> Self {
        Self {
            commands,
            planner,
            gate: SafetyGate::new(),
            observer,
        }
    }

    pub fn planner(&self) -> &Arc<PlanService> {
        &self.planner
    }

    pub fn execute(&self, plan: &Plan, selection: &StepSelection) -> ExecutionOutcome {
        let indices = match self.prepare(plan, selection) {
            Prepared::Blocked(outcome) | Prepared::Preview(outcome) => return outcome,
            Prepared::Run(indices) => indices,
        };
        let results = indices
            .into_iter()
            .map(|index| match plan.step(index) {
                Some(step) => settle(step, self.commands.invoke(&step.command, step_params(step))),
                None => out_of_range(index),
            })
            .collect();
        self.finish(plan, results)
    }

    pub async fn execute_async(&self, plan: &Plan, selection: &StepSelection) -> ExecutionOutcome {
        let indices = match self.prepare(plan, selection) {
            Prepared::Blocked(outcome) | Prepared::Preview(outcome) => return outcome,
            Prepared::Run(indices) => indices,
        };
        let mut results = Vec::with_capacity(indices.len());
        for index in indices {
            let outcome = match plan.step(index) {
                Some(step) => settle(
                    step,
                    self.commands
                        .invoke_async(&step.command, step_params(step))
                        .await,
                ),
                None => out_of_range(index),
            };
            results.push(outcome);
        }
        self.finish(plan, results)
    }

    /// Loads a stored plan and executes it.
    pub fn execute_request(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutionError> {
        let plan = self.load(&request.plan_id)?;
        Ok(self.execute(&plan, &request.selection))
    }

    /// Like [`execute_request`](Self::execute_request) but may first create
    /// the plan from `prompt`. Creation and the gate check each happen once,
    /// before any step runs.
    pub async fn execute_deferred(
        &self,
        request: DeferredExecutionRequest,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let plan = match (request.plan_id, request.prompt) {
            (Some(plan_id), _) => self.load(&plan_id)?,
            (None, Some(prompt)) => {
                let planner = Arc::clone(&self.planner);
                let backend = request.backend;
                let plan = tokio::task::spawn_blocking(move || {
                    planner.create(&prompt, &PlanContext::default(), backend.as_deref())
                })
                .await
                .map_err(|join| PlanningError::Collaborator(anyhow!("plan creation task failed: {join}")))??;
                if plan.steps.is_empty() {
                    return Err(ExecutionError::EmptyPlan);
                }
                info!(plan_id = %plan.id, "created plan for deferred execution");
                plan
            }
            (None, None) => return Err(ExecutionError::NoPlanProvided),
        };
        Ok(self.execute_async(&plan, &request.selection).await)
    }

    fn load(&self, plan_id: &str) -> Result<Plan, ExecutionError> {
        self.planner
            .get(plan_id)?
            .ok_or_else(|| ExecutionError::PlanNotFound(plan_id.to_string()))
    }

    fn prepare(&self, plan: &Plan, selection: &StepSelection) -> Prepared {
        let indices = selection.indices(plan);
        if selection.dry_run {
            let results = indices
                .iter()
                .map(|&index| match plan.step(index) {
                    Some(step) => preview(step),
                    None => out_of_range(index),
                })
                .collect();
            let result = ExecutionResult {
                plan_id: plan.id.clone(),
                results,
            };
            self.observer.execution_completed(&result, true);
            return Prepared::Preview(ExecutionOutcome::Completed(result));
        }
        match self.gate.check(plan, &indices, &selection.confirmed()) {
            Ok(()) => Prepared::Run(indices),
            Err(PolicyError::ConfirmationRequired(refusal)) => {
                self.observer.confirmation_required(&refusal);
                Prepared::Blocked(ExecutionOutcome::ConfirmationRequired(refusal))
            }
        }
    }

    fn finish(&self, plan: &Plan, results: Vec<StepOutcome>) -> ExecutionOutcome {
        let result = ExecutionResult {
            plan_id: plan.id.clone(),
            results,
        };
        info!(
            plan_id = %plan.id,
            completed = result.completed_count(),
            total = result.results.len(),
            "plan executed"
        );
        self.observer.execution_completed(&result, false);
        ExecutionOutcome::Completed(result)
    }
}

fn step_params(step: &Step) -> Value {
    Value::Object(step.args.clone())
}

fn settle(step: &Step, outcome: Result<Value, DispatchError>) -> StepOutcome {
    let output = match outcome {
        Ok(value) => value,
        Err(DispatchError::MethodNotFound(name)) => json!({"error": format!("Unknown command {name}")}),
        Err(err) => json!({"error": err.to_string()}),
    };
    let success = !output.get("error").is_some_and(is_truthy);
    if success {
        debug!(step = step.id, command = %step.command, "step succeeded");
    } else {
        warn!(step = step.id, command = %step.command, "step failed");
    }
    StepOutcome {
        index: step.id,
        command: step.command.clone(),
        success,
        output,
    }
}

fn out_of_range(index: usize) -> StepOutcome {
    StepOutcome {
        index,
        command: String::new(),
        success: false,
        output: json!({"error": format!("Step index {index} out of range")}),
    }
}

fn preview(step: &Step) -> StepOutcome {
    StepOutcome {
        index: step.id,
        command: step.command.clone(),
        success: true,
        output: json!({
            "dry_run": true,
            "command": step.command,
            "args": step.args,
            "description": step.description,
            "needs_confirmation": step.needs_confirmation,
        }),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use sysop_llm::BackendRegistry;
    use sysop_store::PlanStore;
    use sysop_testkit::{ScriptedBackend, SpyHandler, fixture_plan, fixture_step, temp_workspace};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        runtime: tokio::runtime::Runtime,
        engine: ExecutionEngine,
        shell: SpyHandler,
    }

    fn harness(shell: SpyHandler, backend: ScriptedBackend) -> Harness {
        let dir = temp_workspace().expect("workspace");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let commands = Arc::new(Dispatcher::new(runtime.handle().clone()));
        shell.install(&commands, "terminal.run");
        let store = PlanStore::open(&dir.path().join("plans")).expect("store");
        let planner = Arc::new(PlanService::new(
            BackendRegistry::new(Arc::new(backend)),
            store,
            Arc::new(Observer::disabled()),
        ));
        let engine = ExecutionEngine::new(commands, planner, Arc::new(Observer::disabled()));
        Harness {
            _dir: dir,
            runtime,
            engine,
            shell,
        }
    }

    fn default_harness(shell: SpyHandler) -> Harness {
        harness(shell, ScriptedBackend::new("scripted", vec![json!({"steps": ["uptime"]})]))
    }

    fn rm_plan() -> Plan {
        fixture_plan(
            "rm-plan",
            vec![fixture_step(0, "terminal.run", json!({"command": "rm -rf /tmp/x"}), false)],
        )
    }

    fn confirm(indices: &[usize]) -> StepSelection {
        StepSelection {
            confirm_steps: Some(indices.iter().copied().collect::<BTreeSet<_>>()),
            ..StepSelection::default()
        }
    }

    #[test]
    fn gate_refusal_invokes_no_handler() {
        let h = default_harness(SpyHandler::new());
        let outcome = h.engine.execute(&rm_plan(), &StepSelection::default());
        let ExecutionOutcome::ConfirmationRequired(refusal) = outcome else {
            panic!("expected refusal");
        };
        assert_eq!(refusal.destructive_steps, vec![0]);
        assert_eq!(refusal.missing_confirmation, vec![0]);
        assert_eq!(h.shell.calls(), 0);
    }

    #[test]
    fn confirmed_destructive_step_runs() {
        let h = default_harness(SpyHandler::new().then_reply(json!({"status": 0, "stdout": ""})));
        let outcome = h.engine.execute(&rm_plan(), &confirm(&[0]));
        let ExecutionOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.results.len(), 1);
        assert!(result.results[0].success);
        assert_eq!(h.shell.calls(), 1);
        assert_eq!(h.shell.seen()[0]["command"], "rm -rf /tmp/x");
    }

    #[test]
    fn continues_after_failure_and_keeps_requested_order() {
        let h = default_harness(
            SpyHandler::new()
                .then_reply(json!({"status": 1, "error": "exit status 1: nope"}))
                .then_reply(json!({"status": 0, "stdout": "ok"})),
        );
        let plan = fixture_plan(
            "two",
            vec![
                fixture_step(0, "terminal.run", json!({"command": "false"}), false),
                fixture_step(1, "terminal.run", json!({"command": "true"}), false),
            ],
        );
        let selection = StepSelection {
            steps: Some(vec![1, 0, 5]),
            ..StepSelection::default()
        };
        let ExecutionOutcome::Completed(result) = h.engine.execute(&plan, &selection) else {
            panic!("expected completion");
        };
        let order: Vec<usize> = result.results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 0, 5]);
        assert!(!result.results[0].success);
        assert!(result.results[1].success);
        assert_eq!(
            result.results[2].error_message().as_deref(),
            Some("Step index 5 out of range")
        );
        assert_eq!(result.completed_count(), 1);
    }

    #[test]
    fn unknown_commands_and_handler_errors_are_per_step() {
        let h = default_harness(SpyHandler::new().then_fail("disk on fire"));
        let plan = fixture_plan(
            "mixed",
            vec![
                fixture_step(0, "cloud.deploy", json!({}), false),
                fixture_step(1, "terminal.run", json!({"command": "ls"}), false),
                fixture_step(2, "terminal.run", json!({"command": "ls"}), false),
            ],
        );
        let ExecutionOutcome::Completed(result) = h.engine.execute(&plan, &StepSelection::default()) else {
            panic!("expected completion");
        };
        assert_eq!(
            result.results[0].error_message().as_deref(),
            Some("Unknown command cloud.deploy")
        );
        assert_eq!(result.results[1].error_message().as_deref(), Some("disk on fire"));
        assert!(result.results[2].success);
    }

    #[test]
    fn falsy_error_fields_do_not_fail_the_step() {
        let h = default_harness(
            SpyHandler::new()
                .then_reply(json!({"error": null}))
                .then_reply(json!({"error": ""}))
                .then_reply(json!({"error": {"code": 2}})),
        );
        let plan = fixture_plan(
            "errs",
            (0..3)
                .map(|i| fixture_step(i, "terminal.run", json!({"command": "ls"}), false))
                .collect(),
        );
        let ExecutionOutcome::Completed(result) = h.engine.execute(&plan, &StepSelection::default()) else {
            panic!("expected completion");
        };
        let flags: Vec<bool> = result.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn dry_run_previews_without_gate_or_handlers() {
        let h = default_harness(SpyHandler::new());
        let selection = StepSelection {
            dry_run: true,
            ..StepSelection::default()
        };
        let ExecutionOutcome::Completed(result) = h.engine.execute(&rm_plan(), &selection) else {
            panic!("dry run is never refused");
        };
        assert_eq!(result.results[0].output["dry_run"], true);
        assert_eq!(result.results[0].output["args"]["command"], "rm -rf /tmp/x");
        assert_eq!(h.shell.calls(), 0);
    }

    #[test]
    fn async_path_matches_sync_semantics() {
        let h = default_harness(SpyHandler::new().then_reply(json!({"stdout": "up"})));
        let plan = fixture_plan(
            "async",
            vec![
                fixture_step(0, "terminal.run", json!({"command": "uptime"}), false),
                fixture_step(1, "nope.missing", json!({}), false),
            ],
        );
        let outcome = h
            .runtime
            .block_on(h.engine.execute_async(&plan, &StepSelection::default()));
        let ExecutionOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert!(result.results[0].success);
        assert!(!result.results[1].success);
        assert_eq!(h.shell.calls(), 1);

        let refused = h.runtime.block_on(h.engine.execute_async(&rm_plan(), &StepSelection::default()));
        assert!(matches!(refused, ExecutionOutcome::ConfirmationRequired(_)));
        assert_eq!(h.shell.calls(), 1);
    }

    #[test]
    fn deferred_execution_creates_plan_once_then_gates() {
        let backend = ScriptedBackend::new(
            "scripted",
            vec![json!({"plan": "Cleanup", "steps": ["rm -rf /tmp/cache", "df -h"]})],
        );
        let h = harness(SpyHandler::new(), backend);
        let request = DeferredExecutionRequest {
            prompt: Some("clean the cache".to_string()),
            ..DeferredExecutionRequest::default()
        };
        let outcome = h
            .runtime
            .block_on(h.engine.execute_deferred(request))
            .expect("deferred");
        let ExecutionOutcome::ConfirmationRequired(refusal) = outcome else {
            panic!("expected refusal");
        };
        assert_eq!(refusal.missing_confirmation, vec![0]);
        assert_eq!(h.shell.calls(), 0);
        let stored = h.engine.planner().list().expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, refusal.plan_id);

        let rerun = ExecutionRequest {
            plan_id: refusal.plan_id.clone(),
            selection: confirm(&[0]),
        };
        let ExecutionOutcome::Completed(result) = h.engine.execute_request(&rerun).expect("stored plan") else {
            panic!("expected completion");
        };
        assert_eq!(result.results.len(), 2);
        assert_eq!(h.shell.calls(), 2);
    }

    #[test]
    fn deferred_execution_rejects_plans_without_steps() {
        let backend = ScriptedBackend::new("scripted", vec![json!({"plan": "Nothing", "steps": []})]);
        let h = harness(SpyHandler::new(), backend);
        let request = DeferredExecutionRequest {
            prompt: Some("do something vague".to_string()),
            ..DeferredExecutionRequest::default()
        };
        let err = h
            .runtime
            .block_on(h.engine.execute_deferred(request))
            .expect_err("empty plan");
        assert!(matches!(err, ExecutionError::EmptyPlan));
        assert_eq!(err.to_string(), "backend returned a plan with no steps");
        assert!(h.engine.planner().list().expect("list").is_empty());
        assert_eq!(h.shell.calls(), 0);
    }

    #[test]
    fn deferred_execution_without_plan_or_prompt() {
        let h = default_harness(SpyHandler::new());
        let err = h
            .runtime
            .block_on(h.engine.execute_deferred(DeferredExecutionRequest::default()))
            .expect_err("nothing to run");
        assert_eq!(err.to_string(), "no_plan_provided");

        let missing = ExecutionRequest {
            plan_id: "nope".to_string(),
            selection: StepSelection::default(),
        };
        assert!(matches!(
            h.engine.execute_request(&missing),
            Err(ExecutionError::PlanNotFound(_))
        ));
    }
}
