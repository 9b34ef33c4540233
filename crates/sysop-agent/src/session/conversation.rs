use super::{ChatSession, SessionManager};
use crate::intent::{ExecutionIntent, detect_intent};
use crate::planner::PlanService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use sysop_core::{ConfirmationRequired, ExecutionOutcome, Plan};
use sysop_errors::execution_tip;
use tracing::{debug, info, warn};

const NO_PLAN: &str =
    "I don't have a recent plan to execute. Could you tell me what you'd like me to do?";
const NO_PLAN_FOR_STEPS: &str =
    "I don't have a recent plan to execute steps from. Could you create a new plan first?";
const NO_STEPS: &str =
    "I couldn't work out any steps for that. Could you describe what you'd like me to do in more detail?";

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationReply {
    pub session_id: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub intent: ExecutionIntent,
    #[serde(skip_serializing_if = "is_false")]
    pub needs_plan: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub execute_plan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "is_false")]
    pub dry_run: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub plan_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(skip_serializing_if = "is_false")]
    pub suggest_execution: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub error: bool,
}

impl ConversationReply {
    fn new(session_id: &str, intent: ExecutionIntent, response: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            response: response.into(),
            timestamp: Utc::now(),
            intent,
            needs_plan: false,
            execute_plan: false,
            plan_id: None,
            steps: None,
            dry_run: false,
            plan_created: false,
            plan: None,
            suggest_execution: false,
            error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionReply {
    pub session_id: String,
    pub response: String,
    pub execution_complete: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_summary: Option<ExecutionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_required: Option<ConfirmationRequired>,
}

/// Drives a session through its phases one user message at a time.
pub struct ConversationHandler {
    sessions: Arc<SessionManager>,
    planner: Arc<PlanService>,
    context_window: usize,
}

impl ConversationHandler {
    pub fn new(sessions: Arc<SessionManager>, planner: Arc<PlanService>, context_window: usize) -> Self {
        Self {
            sessions,
            planner,
            context_window,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Never fails: backend errors come back as an apologetic reply with
    /// `error` set.
    pub fn process_user_message(
        &self,
        text: &str,
        session_id: Option<&str>,
        backend: Option<&str>,
    ) -> ConversationReply {
        let shared = self.sessions.get_or_create(session_id);
        let (id, intent, mut context, backend) = {
            let mut session = shared.lock().expect("session lock");
            session.add_message("user", text, Value::Null);
            if let Some(name) = backend {
                session.preferred_backend = Some(name.to_string());
            }
            let intent = detect_intent(text, session.awaiting_confirmation);
            debug!(session = %session.id, phase = ?session.phase(), ?intent, "message classified");
            if intent.is_execution() {
                return request_execution(&mut session, intent);
            }
            (
                session.id.clone(),
                intent,
                session.plan_context(self.context_window),
                session.preferred_backend.clone(),
            )
        };

        let request = match &intent {
            ExecutionIntent::ModifyPlan { modification } => {
                context.modification = Some(modification.clone());
                modification.clone()
            }
            ExecutionIntent::CreatePlan { query } => query.clone(),
            _ => text.to_string(),
        };
        // The session is unlocked while the backend works.
        let created = self.planner.create(&request, &context, backend.as_deref());

        let mut session = shared.lock().expect("session lock");
        match created {
            Ok(plan) if !plan.steps.is_empty() => {
                session.set_last_plan(&plan);
                session.add_message(
                    "assistant",
                    &plan.response,
                    json!({
                        "plan_created": true,
                        "plan_id": plan.id,
                        "safety_concerns": !plan.safety_notes.is_empty(),
                        "step_count": plan.steps.len(),
                    }),
                );
                info!(session = %id, plan_id = %plan.id, proposed = plan.suggest_execution, "plan proposed");
                let mut reply = ConversationReply::new(&id, intent, plan.response.clone());
                reply.plan_created = true;
                reply.plan_id = Some(plan.id.clone());
                reply.suggest_execution = plan.suggest_execution;
                reply.plan = Some(plan);
                reply
            }
            Ok(_) => {
                session.add_message("assistant", NO_STEPS, json!({"plan_created": false}));
                ConversationReply::new(&id, intent, NO_STEPS)
            }
            Err(err) => {
                warn!(session = %id, error = %err, "planning failed");
                let response =
                    format!("I encountered an error: {err}. Could you try rephrasing your request?");
                session.add_message("assistant", &response, json!({"error": true}));
                let mut reply = ConversationReply::new(&id, intent, response);
                reply.error = true;
                reply
            }
        }
    }

    /// Folds an execution outcome, or the error that prevented one, back into
    /// the session, which always returns to idle.
    pub fn handle_plan_execution_result(
        &self,
        session_id: &str,
        outcome: Result<&ExecutionOutcome, &str>,
    ) -> ExecutionReply {
        let shared = self.sessions.get_or_create(Some(session_id));
        let mut session = shared.lock().expect("session lock");

        let reply = match outcome {
            Ok(outcome) => {
                if session.last_plan_id.is_some() {
                    session.record_execution(outcome);
                }
                describe_outcome(&session.id, outcome)
            }
            Err(message) => {
                if let Some(plan_id) = session.last_plan_id.clone() {
                    session.record_execution_error(&plan_id, message);
                }
                let mut response = format!("Execution failed: {message}");
                if let Some(tip) = execution_tip(message) {
                    response.push_str(&format!("\nTip: {tip}"));
                }
                ExecutionReply {
                    session_id: session.id.clone(),
                    response,
                    execution_complete: false,
                    success: false,
                    execution_summary: None,
                    confirmation_required: None,
                }
            }
        };

        session.add_message(
            "assistant",
            &reply.response,
            json!({"execution_result": true, "success": reply.success}),
        );
        session.clear_execution_state();
        reply
    }
}

fn request_execution(session: &mut ChatSession, intent: ExecutionIntent) -> ConversationReply {
    let (steps, dry_run) = match &intent {
        ExecutionIntent::ExecuteSteps { steps, dry_run } => (Some(steps.clone()), *dry_run),
        ExecutionIntent::ExecuteLastPlan { dry_run } => (None, *dry_run),
        _ => (None, false),
    };
    let (Some(plan_id), Some(summary)) = (session.last_plan_id.clone(), session.last_plan_summary.clone()) else {
        let response = if steps.is_some() { NO_PLAN_FOR_STEPS } else { NO_PLAN };
        session.add_message("assistant", response, json!({"needs_plan": true}));
        let mut reply = ConversationReply::new(&session.id, intent, response);
        reply.needs_plan = true;
        return reply;
    };

    let action = if dry_run { "do a dry run of" } else { "execute" };
    let response = match &steps {
        Some(steps) => {
            let listed: Vec<String> = steps.iter().map(usize::to_string).collect();
            format!("I'll {action} steps {} from the plan: {summary}", listed.join(", "))
        }
        None => format!("I'll {action} the plan: {summary}"),
    };
    session.set_execution_intent(intent.clone());
    session.add_message("assistant", &response, json!({"execute_plan": true, "plan_id": plan_id}));

    let mut reply = ConversationReply::new(&session.id, intent, response);
    reply.execute_plan = true;
    reply.plan_id = Some(plan_id);
    reply.steps = steps;
    reply.dry_run = dry_run;
    reply
}

fn describe_outcome(session_id: &str, outcome: &ExecutionOutcome) -> ExecutionReply {
    let result = match outcome {
        ExecutionOutcome::Completed(result) => result,
        ExecutionOutcome::ConfirmationRequired(refusal) => {
            let missing: Vec<String> = refusal.missing_confirmation.iter().map(usize::to_string).collect();
            return ExecutionReply {
                session_id: session_id.to_string(),
                response: format!(
                    "Nothing was run: step(s) {} need your confirmation first.",
                    missing.join(", ")
                ),
                execution_complete: false,
                success: false,
                execution_summary: None,
                confirmation_required: Some(refusal.clone()),
            };
        }
    };

    let total = result.results.len();
    let completed = result.completed_count();
    let previewed = total > 0 && result.results.iter().all(|r| r.output["dry_run"] == true);
    let mut response = if previewed {
        format!("Dry run complete: {total} steps previewed, nothing was executed.")
    } else if completed == total {
        format!("Plan executed successfully! ({completed}/{total} steps completed)")
    } else {
        format!("Plan finished with errors ({completed}/{total} steps completed)")
    };

    let mut tips: Vec<String> = Vec::new();
    for failure in result.failures() {
        let message = failure.error_message().unwrap_or_else(|| "unknown error".to_string());
        response.push_str(&format!("\nStep {} failed: {message}", failure.index));
        if let Some(tip) = execution_tip(&message)
            && !tips.contains(&tip)
        {
            tips.push(tip);
        }
    }
    for tip in tips {
        response.push_str(&format!("\nTip: {tip}"));
    }

    ExecutionReply {
        session_id: session_id.to_string(),
        response,
        execution_complete: true,
        success: completed == total,
        execution_summary: Some(ExecutionSummary {
            total_steps: total,
            successful_steps: completed,
            plan_id: result.plan_id.clone(),
        }),
        confirmation_required: None,
    }
}
