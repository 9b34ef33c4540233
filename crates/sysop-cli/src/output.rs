use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use sysop_core::{AppConfig, ExecutionOutcome, Plan};

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(llm) = value.get_mut("llm").and_then(|entry| entry.as_object_mut())
        && llm.get("api_key").is_some_and(|key| !key.is_null())
    {
        llm.insert("api_key".to_string(), json!("***REDACTED***"));
    }
    Ok(value)
}

pub(crate) fn render_plan(plan: &Plan) -> String {
    let mut out = format!("{}\n  id: {}\n", plan.summary(), plan.id);
    for step in &plan.steps {
        let marker = if step.needs_confirmation { " [confirm]" } else { "" };
        out.push_str(&format!("  [{}] {}{marker}\n", step.id, step.description));
    }
    if !plan.estimated_duration.is_empty() {
        out.push_str(&format!("  estimated: {}\n", plan.estimated_duration));
    }
    for note in &plan.safety_notes {
        out.push_str(&format!("  ! {note}\n"));
    }
    if !plan.prerequisites.is_empty() {
        out.push_str(&format!("  requires: {}\n", plan.prerequisites.join(", ")));
    }
    for hint in &plan.rollback_suggestions {
        out.push_str(&format!("  rollback: {hint}\n"));
    }
    out
}

pub(crate) fn render_outcome(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::ConfirmationRequired(refusal) => {
            let missing: Vec<String> = refusal
                .missing_confirmation
                .iter()
                .map(usize::to_string)
                .collect();
            format!(
                "Refused: destructive steps {} need confirmation (re-run with --confirm {})\n",
                missing.join(", "),
                missing.join(",")
            )
        }
        ExecutionOutcome::Completed(result) => {
            let mut out = String::new();
            for step in &result.results {
                let status = if step.success { "ok" } else { "FAILED" };
                out.push_str(&format!("[{}] {} {status}\n", step.index, step.command));
                if let Some(err) = step.error_message() {
                    out.push_str(&format!("    {err}\n"));
                } else if let Some(stdout) = step.output.get("stdout").and_then(|v| v.as_str())
                    && !stdout.trim().is_empty()
                {
                    for line in stdout.lines() {
                        out.push_str(&format!("    {line}\n"));
                    }
                }
            }
            out.push_str(&format!(
                "{}/{} steps completed\n",
                result.completed_count(),
                result.results.len()
            ));
            out
        }
    }
}
