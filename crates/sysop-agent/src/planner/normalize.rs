use super::analysis;
use chrono::Utc;
use serde_json::{Map, Value, json};
use sysop_core::{Plan, PlanContext, RawStep, Step, TERMINAL_RUN, new_plan_id};
use sysop_policy::{DESTRUCTIVE_COMMANDS, is_destructive_call, mentions_destructive_words};
use tracing::debug;

const COMMAND_KEYS: &[&str] = &["command", "method", "tool"];
const ARGS_KEYS: &[&str] = &["args", "params"];

/// Turns untrusted backend output into a well-formed [`Plan`]. Every input
/// element yields exactly one step; shapes it cannot read become a harmless
/// `echo` so the step count still matches what the backend sent.
#[derive(Debug, Clone, Default)]
pub struct PlanNormalizer;

impl PlanNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, raw: &Value, request: &str, context: Option<&PlanContext>) -> Plan {
        let steps: Vec<Step> = RawStep::list_from(raw)
            .into_iter()
            .enumerate()
            .map(|(i, step)| normalize_step(i, step))
            .collect();

        let name = non_empty_str(raw, "plan")
            .or_else(|| non_empty_str(raw, "description"))
            .map(str::to_string)
            .unwrap_or_else(|| analysis::generate_plan_name(request));

        let awaiting = context.is_some_and(|c| c.awaiting_confirmation);
        let suggest_execution = raw
            .get("suggest_execution")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| analysis::should_suggest_execution(&steps, awaiting));

        let response = non_empty_str(raw, "response")
            .map(str::to_string)
            .unwrap_or_else(|| analysis::default_response(&name));

        let mut safety_notes = string_list(raw.get("safety_notes"));
        if safety_notes.is_empty() {
            safety_notes = analysis::safety_concerns(&steps);
        }

        debug!(name = %name, steps = steps.len(), "normalized plan");
        Plan {
            id: new_plan_id(),
            estimated_duration: analysis::estimate_duration(&steps),
            prerequisites: analysis::prerequisites(&steps),
            rollback_suggestions: analysis::rollback_suggestions(&steps),
            name,
            steps,
            request: request.to_string(),
            created_at: Utc::now(),
            suggest_execution,
            response,
            safety_notes,
        }
    }
}

fn non_empty_str<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn normalize_step(id: usize, raw: RawStep) -> Step {
    match raw {
        RawStep::Command(cmd) => {
            let args = object(json!({"command": cmd}));
            Step {
                id,
                command: TERMINAL_RUN.to_string(),
                needs_confirmation: is_destructive_call(TERMINAL_RUN, &args),
                description: format!("Run: {}", truncate(&cmd, 50)),
                args,
            }
        }
        RawStep::Record(record) => normalize_record(id, &record),
        RawStep::Unrecognized(value) => {
            let repr = value.to_string();
            Step {
                id,
                command: TERMINAL_RUN.to_string(),
                args: object(json!({
                    "command": format!("echo {}", shell_quote(&format!("Unknown step: {repr}")))
                })),
                needs_confirmation: false,
                description: format!("Echo unknown step: {}...", repr.chars().take(30).collect::<String>()),
            }
        }
    }
}

fn normalize_record(id: usize, record: &Map<String, Value>) -> Step {
    let command = COMMAND_KEYS
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .unwrap_or(TERMINAL_RUN)
        .to_string();

    let raw_args = ARGS_KEYS
        .iter()
        .find_map(|key| record.get(*key).filter(|v| !is_empty_value(v)));
    let args = match raw_args {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) if command == TERMINAL_RUN => object(json!({"command": s})),
        Some(other) => object(json!({"value": other})),
    };

    let detected = is_destructive_call(&command, &args)
        || (command != TERMINAL_RUN
            && !DESTRUCTIVE_COMMANDS.contains(&command.as_str())
            && mentions_destructive_words(&args));
    // An explicit `false` cannot downgrade a detected destructive call.
    let needs_confirmation = match record.get("needs_confirmation").and_then(Value::as_bool) {
        Some(explicit) => explicit || is_destructive_call(&command, &args),
        None => detected,
    };

    let description = record
        .get("description")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| describe(&command, &args));

    Step {
        id,
        command,
        args,
        needs_confirmation,
        description,
    }
}

fn describe(command: &str, args: &Map<String, Value>) -> String {
    let arg = |key: &str, default: &str| match args.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => default.to_string(),
    };
    match command {
        TERMINAL_RUN => format!("Execute: {}", arg("command", "unknown command")),
        "files.read" => format!("Read file: {}", arg("path", "unknown path")),
        "files.write" => format!("Write to: {}", arg("path", "unknown path")),
        "files.list" => format!("List directory: {}", arg("path", "current directory")),
        "files.delete" => format!("Delete: {}", arg("path", "unknown path")),
        "service.start" => format!("Start service: {}", arg("name", "unknown service")),
        "service.stop" => format!("Stop service: {}", arg("name", "unknown service")),
        "package.install" => format!("Install package: {}", arg("name", "unknown package")),
        other => format!("Execute {other} with {} parameters", args.len()),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn normalize(raw: Value) -> Plan {
        PlanNormalizer::new().normalize(&raw, "check the disk", None)
    }

    #[test]
    fn string_steps_become_terminal_runs() {
        let plan = normalize(json!({"plan": "Disk", "steps": ["df -h", "rm -rf /tmp/x"]}));
        assert_eq!(plan.name, "Disk");
        assert_eq!(plan.steps[0].command, TERMINAL_RUN);
        assert_eq!(plan.steps[0].arg_str("command"), Some("df -h"));
        assert_eq!(plan.steps[0].description, "Run: df -h");
        assert!(!plan.steps[0].needs_confirmation);
        assert!(plan.steps[1].needs_confirmation);
    }

    #[test]
    fn long_string_descriptions_are_truncated() {
        let cmd = "x".repeat(60);
        let plan = normalize(json!({"steps": [cmd]}));
        assert_eq!(plan.steps[0].description, format!("Run: {}...", "x".repeat(50)));
    }

    #[test]
    fn record_keys_fall_back_in_order() {
        let plan = normalize(json!({"commands": [
            {"method": "files.read", "params": {"path": "/etc/hosts"}},
            {"tool": "service.restart", "args": {"name": "nginx"}},
            {"command": 7, "method": "files.list", "args": {"path": "/var"}},
            {"args": "uptime"},
        ]}));
        assert_eq!(plan.steps[0].command, "files.read");
        assert_eq!(plan.steps[0].description, "Read file: /etc/hosts");
        assert_eq!(plan.steps[1].description, "Execute service.restart with 1 parameters");
        assert_eq!(plan.steps[2].command, "files.list");
        assert_eq!(plan.steps[3].command, TERMINAL_RUN);
        assert_eq!(plan.steps[3].arg_str("command"), Some("uptime"));
    }

    #[test]
    fn explicit_false_cannot_hide_destructive_call() {
        let plan = normalize(json!({"steps": [
            {"command": "files.delete", "args": {"path": "/tmp/a"}, "needs_confirmation": false},
            {"command": "files.read", "args": {"path": "/tmp/a"}, "needs_confirmation": true},
            {"command": "db.exec", "args": {"sql": "DROP TABLE users"}},
            {"command": TERMINAL_RUN, "args": {"command": "echo remove"}},
        ]}));
        assert!(plan.steps[0].needs_confirmation);
        assert!(plan.steps[1].needs_confirmation);
        assert!(plan.steps[2].needs_confirmation);
        assert!(!plan.steps[3].needs_confirmation);
    }

    #[test]
    fn unrecognized_values_become_quoted_echo() {
        let plan = normalize(json!({"steps": [42, null, "it's"]}));
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].arg_str("command"), Some("echo 'Unknown step: 42'"));
        assert_eq!(plan.steps[0].description, "Echo unknown step: 42...");
        assert!(!plan.steps[1].needs_confirmation);
    }

    #[test]
    fn name_and_defaults_are_derived() {
        let plan = normalize(json!({"steps": [{"command": "files.list", "args": {"path": "."}}]}));
        assert_eq!(plan.name, "System Check");
        assert!(plan.suggest_execution);
        assert_eq!(
            plan.response,
            "I've created a plan to system check. Would you like me to execute it?"
        );
        assert_eq!(plan.request, "check the disk");

        let described = normalize(json!({"description": "Tidy Logs", "steps": [], "suggest_execution": true}));
        assert_eq!(described.name, "Tidy Logs");
        assert!(described.suggest_execution);
    }

    #[test]
    fn awaiting_context_suppresses_suggestion() {
        let ctx = PlanContext {
            awaiting_confirmation: true,
            ..PlanContext::default()
        };
        let raw = json!({"steps": [{"command": "files.list", "args": {"path": "."}}]});
        let plan = PlanNormalizer::new().normalize(&raw, "list", Some(&ctx));
        assert!(!plan.suggest_execution);
    }

    #[test]
    fn backend_safety_notes_win_over_generated() {
        let plan = normalize(json!({"steps": ["sudo rm -rf /opt/x"], "safety_notes": ["careful"]}));
        assert_eq!(plan.safety_notes, vec!["careful".to_string()]);
        let generated = normalize(json!({"steps": ["sudo rm -rf /opt/x"], "safety_notes": []}));
        assert_eq!(generated.safety_notes.len(), 2);
    }

    fn raw_step() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z ]{0,20}".prop_map(Value::from),
            ("[a-z.]{1,12}", "[a-z/]{0,10}")
                .prop_map(|(cmd, path)| json!({"command": cmd, "args": {"path": path}})),
            any::<i64>().prop_map(Value::from),
            Just(Value::Null),
            Just(json!([1, 2])),
            Just(json!({})),
        ]
    }

    proptest! {
        #[test]
        fn one_step_per_element_in_order(items in prop::collection::vec(raw_step(), 0..12)) {
            let plan = normalize(json!({"steps": items.clone()}));
            prop_assert_eq!(plan.steps.len(), items.len());
            for (i, step) in plan.steps.iter().enumerate() {
                prop_assert_eq!(step.id, i);
                prop_assert!(!step.command.is_empty());
            }
        }
    }
}
