use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sysop_core::{Plan, PlanContext, Step};
use sysop_jsonrpc::Dispatcher;
use sysop_llm::PlanBackend;
use tempfile::TempDir;

/// Scratch workspace removed on drop.
pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempfile::tempdir()?)
}

pub fn fixture_step(id: usize, command: &str, args: Value, needs_confirmation: bool) -> Step {
    Step {
        id,
        command: command.to_string(),
        args: args.as_object().cloned().unwrap_or_default(),
        needs_confirmation,
        description: format!("fixture step {id}"),
    }
}

/// Plan with the given steps, renumbered so ids match positions.
pub fn fixture_plan(id: &str, steps: Vec<Step>) -> Plan {
    let steps = steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| Step { id: i, ..step })
        .collect();
    Plan {
        id: id.to_string(),
        name: "Fixture Plan".to_string(),
        steps,
        request: "fixture".to_string(),
        created_at: Utc::now(),
        suggest_execution: false,
        response: String::new(),
        safety_notes: Vec::new(),
        estimated_duration: String::new(),
        prerequisites: Vec::new(),
        rollback_suggestions: Vec::new(),
    }
}

/// Blocking command handler that counts its calls and replays scripted
/// payloads, falling back to `{"ok": true}` once the script runs out.
#[derive(Clone, Default)]
pub struct SpyHandler {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Value>>>,
    script: Arc<Mutex<VecDeque<std::result::Result<Value, String>>>>,
}

impl SpyHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_reply(self, payload: Value) -> Self {
        self.script
            .lock()
            .expect("spy script lock")
            .push_back(Ok(payload));
        self
    }

    /// Queues a handler error, as if the command raised.
    pub fn then_fail(self, message: &str) -> Self {
        self.script
            .lock()
            .expect("spy script lock")
            .push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().expect("spy seen lock").clone()
    }

    pub fn install(&self, dispatcher: &Dispatcher, method: &str) {
        let spy = self.clone();
        dispatcher.register_blocking(method, move |params| spy.handle(params));
    }

    fn handle(&self, params: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("spy seen lock").push(params);
        match self.script.lock().expect("spy script lock").pop_front() {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(json!({"ok": true})),
        }
    }
}

/// Planning backend with canned replies. The last reply repeats once the
/// queue is exhausted.
pub struct ScriptedBackend {
    name: String,
    replies: Mutex<VecDeque<std::result::Result<Value, String>>>,
    last: Mutex<Option<std::result::Result<Value, String>>>,
    prompts: Mutex<Vec<(String, PlanContext)>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, replies: Vec<Value>) -> Self {
        Self::from_script(name, replies.into_iter().map(Ok).collect())
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::from_script(name, vec![Err(message.to_string())])
    }

    fn from_script(name: &str, script: Vec<std::result::Result<Value, String>>) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(script.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("backend prompts lock").len()
    }

    /// Prompts and contexts received so far, oldest first.
    pub fn requests(&self) -> Vec<(String, PlanContext)> {
        self.prompts.lock().expect("backend prompts lock").clone()
    }
}

impl PlanBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, prompt: &str, context: &PlanContext) -> Result<Value> {
        self.prompts
            .lock()
            .expect("backend prompts lock")
            .push((prompt.to_string(), context.clone()));
        let next = self.replies.lock().expect("backend replies lock").pop_front();
        let mut last = self.last.lock().expect("backend last lock");
        if let Some(reply) = next {
            *last = Some(reply);
        }
        match last.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(anyhow!(message.clone())),
            None => Err(anyhow!("scripted backend '{}' has no replies", self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysop_jsonrpc::DispatchRequest;

    #[test]
    fn spy_replays_script_then_falls_back() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let dispatcher = Dispatcher::new(runtime.handle().clone());
        let spy = SpyHandler::new()
            .then_reply(json!({"stdout": "a"}))
            .then_fail("boom");
        spy.install(&dispatcher, "terminal.run");

        let first = dispatcher.call(DispatchRequest::new("terminal.run", json!({"command": "x"})));
        assert_eq!(first.result, Some(json!({"stdout": "a"})));
        let second = dispatcher.call(DispatchRequest::new("terminal.run", json!({})));
        assert_eq!(second.error.as_deref(), Some("boom"));
        let third = dispatcher.call(DispatchRequest::new("terminal.run", json!({})));
        assert_eq!(third.result, Some(json!({"ok": true})));
        assert_eq!(spy.calls(), 3);
        assert_eq!(spy.seen()[0]["command"], "x");
    }

    #[test]
    fn scripted_backend_repeats_last_reply() {
        let backend = ScriptedBackend::new("scripted", vec![json!({"plan": "A"}), json!({"plan": "B"})]);
        let ctx = PlanContext::default();
        assert_eq!(backend.generate("one", &ctx).expect("a")["plan"], "A");
        assert_eq!(backend.generate("two", &ctx).expect("b")["plan"], "B");
        assert_eq!(backend.generate("three", &ctx).expect("b again")["plan"], "B");
        assert_eq!(backend.calls(), 3);

        let failing = ScriptedBackend::failing("down", "service unavailable");
        assert!(failing.generate("x", &ctx).is_err());
    }

    #[test]
    fn fixture_plan_renumbers_steps() {
        let plan = fixture_plan(
            "p",
            vec![
                fixture_step(7, "files.list", json!({"path": "."}), false),
                fixture_step(7, "files.delete", json!({"path": "x"}), true),
            ],
        );
        assert_eq!(plan.steps[1].id, 1);
        assert_eq!(plan.confirmation_count(), 1);
    }
}
