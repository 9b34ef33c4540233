use crate::executor::{ExecutionEngine, ExecutionError};
use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use std::sync::Arc;
use sysop_core::{DeferredExecutionRequest, ExecutionRequest, PlanContext};
use sysop_jsonrpc::{Dispatcher, optional_str, require_str};

pub const PLAN_CREATE: &str = "plan.create";
pub const PLAN_LIST: &str = "plan.list";
pub const PLAN_GET: &str = "plan.get";
pub const PLAN_EXECUTE: &str = "plan.execute";
pub const PLAN_EXECUTE_ASYNC: &str = "plan.execute_async";

/// Registers the `plan.*` methods. Gate refusals are ordinary results
/// carrying `"error": "destructive_steps_found"`.
pub fn register_plan_methods(dispatcher: &Dispatcher, engine: Arc<ExecutionEngine>) {
    let planner = Arc::clone(engine.planner());
    dispatcher.register_blocking(PLAN_CREATE, move |params| {
        let text = require_str(&params, "text")?;
        let plan = planner.create(text, &PlanContext::default(), optional_str(&params, "backend"))?;
        if plan.steps.is_empty() {
            return Err(ExecutionError::EmptyPlan.into());
        }
        Ok(serde_json::to_value(plan)?)
    });

    let planner = Arc::clone(engine.planner());
    dispatcher.register_blocking(PLAN_LIST, move |_params| {
        let plans: Vec<Value> = planner
            .list()?
            .iter()
            .map(|plan| {
                json!({
                    "id": plan.id,
                    "name": plan.name,
                    "steps": plan.steps.len(),
                    "summary": plan.summary(),
                    "created_at": plan.created_at,
                })
            })
            .collect();
        Ok(json!({"plans": plans}))
    });

    let planner = Arc::clone(engine.planner());
    dispatcher.register_blocking(PLAN_GET, move |params| {
        let plan_id = require_str(&params, "plan_id")?;
        let plan = planner
            .get(plan_id)?
            .ok_or_else(|| anyhow!("plan not found: {plan_id}"))?;
        Ok(serde_json::to_value(plan)?)
    });

    let sync_engine = Arc::clone(&engine);
    dispatcher.register_blocking(PLAN_EXECUTE, move |params| {
        let request: ExecutionRequest =
            serde_json::from_value(params).context("invalid plan.execute params")?;
        let outcome = sync_engine.execute_request(&request)?;
        Ok(serde_json::to_value(outcome)?)
    });

    dispatcher.register_suspend(PLAN_EXECUTE_ASYNC, move |params| {
        let engine = Arc::clone(&engine);
        async move {
            let request: DeferredExecutionRequest =
                serde_json::from_value(params).context("invalid plan.execute_async params")?;
            let outcome = engine.execute_deferred(request).await?;
            Ok(serde_json::to_value(outcome)?)
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::Services;
    use serde_json::json;
    use sysop_core::AppConfig;
    use sysop_jsonrpc::DispatchRequest;
    use sysop_llm::BackendRegistry;
    use std::sync::Arc;
    use sysop_testkit::ScriptedBackend;

    fn services(dir: &std::path::Path, rt: &tokio::runtime::Runtime, reply: serde_json::Value) -> Services {
        let backends = BackendRegistry::new(Arc::new(ScriptedBackend::new("scripted", vec![reply])));
        Services::with_backends(dir, &AppConfig::default(), rt.handle().clone(), backends)
            .expect("services")
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime")
    }

    #[test]
    fn create_get_list_and_refuse_over_rpc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = runtime();
        let svc = services(
            dir.path(),
            &rt,
            json!({"plan": "Cleanup", "steps": ["rm -rf /tmp/sysop-rpc-test-nothing", "echo done"]}),
        );

        let created = svc
            .rpc
            .call(DispatchRequest::new("plan.create", json!({"text": "clean up"})))
            .into_result()
            .expect("created");
        let plan_id = created["id"].as_str().expect("id").to_string();
        assert_eq!(created["steps"][0]["needs_confirmation"], true);

        let fetched = svc
            .rpc
            .call(DispatchRequest::new("plan.get", json!({"plan_id": plan_id})))
            .into_result()
            .expect("fetched");
        assert_eq!(fetched["name"], "Cleanup");

        let listed = svc
            .rpc
            .call(DispatchRequest::new("plan.list", json!({})))
            .into_result()
            .expect("listed");
        assert_eq!(listed["plans"][0]["summary"], "Cleanup (2 steps, 1 need confirmation)");

        let refused = svc
            .rpc
            .call(DispatchRequest::new("plan.execute", json!({"plan_id": plan_id})))
            .into_result()
            .expect("refusal is a result");
        assert_eq!(refused["error"], "destructive_steps_found");
        assert_eq!(refused["missing_confirmation"], json!([0]));

        let preview = svc
            .rpc
            .call(DispatchRequest::new(
                "plan.execute",
                json!({"plan_id": plan_id, "steps": [1], "dry_run": true}),
            ))
            .into_result()
            .expect("preview");
        assert_eq!(preview["results"][0]["output"]["dry_run"], true);
    }

    #[test]
    fn errors_come_back_in_the_envelope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = runtime();
        let svc = services(dir.path(), &rt, json!({"steps": []}));

        let missing = svc
            .rpc
            .call(DispatchRequest::new("plan.get", json!({"plan_id": "nope"})));
        assert_eq!(missing.error.as_deref(), Some("plan not found: nope"));

        let empty = svc
            .rpc
            .call(DispatchRequest::new("plan.create", json!({"text": "vague"})));
        assert_eq!(empty.error.as_deref(), Some("backend returned a plan with no steps"));

        let empty_async = rt.block_on(svc.rpc.call_async(DispatchRequest::new(
            "plan.execute_async",
            json!({"prompt": "vague"}),
        )));
        assert_eq!(empty_async.error.as_deref(), Some("backend returned a plan with no steps"));
        assert!(empty_async.result.is_none());

        let nothing = rt.block_on(
            svc.rpc
                .call_async(DispatchRequest::new("plan.execute_async", json!({}))),
        );
        assert_eq!(nothing.error.as_deref(), Some("no_plan_provided"));
    }

    #[test]
    fn execute_async_creates_and_runs_read_only_plan() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("hello.txt"), "hi").expect("write");
        let rt = runtime();
        let svc = services(
            dir.path(),
            &rt,
            json!({"plan": "Peek", "steps": [{"command": "files.read", "args": {"path": "hello.txt"}}]}),
        );
        let reply = rt
            .block_on(svc.rpc.call_async(DispatchRequest::new(
                "plan.execute_async",
                json!({"prompt": "show hello"}),
            )))
            .into_result()
            .expect("executed");
        assert_eq!(reply["results"][0]["success"], true);
        assert_eq!(reply["results"][0]["output"]["content"], "hi");
    }
}
