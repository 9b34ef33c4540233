use serde_json::{Map, Value};
use std::collections::BTreeSet;
use sysop_core::{ConfirmationRequired, Plan, Step, TERMINAL_RUN};
use tracing::info;

/// Token prefixes that make a shell command destructive. Matching is by
/// prefix, so `rmdir` and `ddrescue` are flagged as well.
pub const DESTRUCTIVE_KEYWORDS: &[&str] = &["rm", "dd", ":(){", "shutdown", "reboot"];

/// Commands that always need confirmation, whatever their arguments.
pub const DESTRUCTIVE_COMMANDS: &[&str] = &[
    "files.delete",
    "files.write",
    "system.shutdown",
    "system.reboot",
    "service.stop",
    "package.remove",
];

const DESTRUCTIVE_ARG_WORDS: &[&str] = &[
    "rm ", "delete", "remove", "drop", "truncate", "format", "wipe",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("plan {} has unconfirmed destructive steps {:?}", .0.plan_id, .0.missing_confirmation)]
    ConfirmationRequired(ConfirmationRequired),
}

/// Returns true when shell text would delete data or stop the machine.
pub fn is_destructive_command(cmd: &str) -> bool {
    let tokens = shell_words::split(cmd)
        .unwrap_or_else(|_| cmd.split_whitespace().map(str::to_string).collect());
    if tokens
        .iter()
        .any(|token| DESTRUCTIVE_KEYWORDS.iter().any(|k| token.starts_with(k)))
    {
        return true;
    }
    cmd.contains("-rf") && cmd.contains('/')
}

/// Destructive predicate over a command name and its arguments.
pub fn is_destructive_call(command: &str, args: &Map<String, Value>) -> bool {
    if command == TERMINAL_RUN {
        return args
            .get("command")
            .and_then(|v| v.as_str())
            .is_some_and(is_destructive_command);
    }
    DESTRUCTIVE_COMMANDS.contains(&command)
}

/// Looser heuristic for commands outside the fixed set: scans the serialized
/// arguments for words that usually mean data loss.
pub fn mentions_destructive_words(args: &Map<String, Value>) -> bool {
    let text = Value::Object(args.clone()).to_string().to_lowercase();
    DESTRUCTIVE_ARG_WORDS.iter().any(|w| text.contains(w))
}

#[derive(Debug, Clone, Default)]
pub struct SafetyGate;

impl SafetyGate {
    pub fn new() -> Self {
        Self
    }

    /// A stored `needs_confirmation = false` never hides a destructive command.
    pub fn step_is_destructive(&self, step: &Step) -> bool {
        step.needs_confirmation || is_destructive_call(&step.command, &step.args)
    }

    pub fn destructive_indices(&self, plan: &Plan, indices: &[usize]) -> BTreeSet<usize> {
        indices
            .iter()
            .copied()
            .filter(|i| plan.step(*i).is_some_and(|s| self.step_is_destructive(s)))
            .collect()
    }

    /// Fails when any requested destructive step is missing from `confirmed`.
    /// Indices outside the plan are left for the executor to report.
    pub fn check(
        &self,
        plan: &Plan,
        indices: &[usize],
        confirmed: &BTreeSet<usize>,
    ) -> Result<(), PolicyError> {
        let destructive = self.destructive_indices(plan, indices);
        let missing: Vec<usize> = destructive
            .iter()
            .copied()
            .filter(|i| !confirmed.contains(i))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        info!(plan_id = %plan.id, ?missing, "execution blocked pending confirmation");
        Err(PolicyError::ConfirmationRequired(ConfirmationRequired {
            plan_id: plan.id.clone(),
            destructive_steps: destructive.into_iter().collect(),
            missing_confirmation: missing,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn step(id: usize, command: &str, args: Value, needs_confirmation: bool) -> Step {
        Step {
            id,
            command: command.to_string(),
            args: args.as_object().cloned().unwrap_or_default(),
            needs_confirmation,
            description: String::new(),
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            id: "plan-1".to_string(),
            name: "Test".to_string(),
            steps,
            request: String::new(),
            created_at: chrono::Utc::now(),
            suggest_execution: false,
            response: String::new(),
            safety_notes: Vec::new(),
            estimated_duration: String::new(),
            prerequisites: Vec::new(),
            rollback_suggestions: Vec::new(),
        }
    }

    #[test]
    fn flags_keyword_prefixes_and_recursive_root_paths() {
        assert!(is_destructive_command("rm -rf /tmp/x"));
        assert!(is_destructive_command("sudo shutdown -h now"));
        assert!(is_destructive_command("dd if=/dev/zero of=/dev/sda"));
        assert!(is_destructive_command(":(){ :|:& };:"));
        assert!(is_destructive_command("chown -rf user /srv"));
        assert!(!is_destructive_command("ls -la /var/log"));
        assert!(!is_destructive_command("echo hello"));
        assert!(!is_destructive_command("  "));
    }

    #[test]
    fn prefix_match_also_flags_longer_tokens() {
        assert!(is_destructive_command("rmdir build"));
        assert!(is_destructive_command("reboot-notifier --status"));
    }

    #[test]
    fn unbalanced_quotes_fall_back_to_whitespace_split() {
        assert!(is_destructive_command("rm 'unterminated"));
        assert!(!is_destructive_command("echo 'unterminated"));
    }

    #[test]
    fn fixed_commands_are_destructive_regardless_of_args() {
        assert!(is_destructive_call("files.delete", &Map::new()));
        assert!(is_destructive_call("service.stop", &Map::new()));
        assert!(!is_destructive_call("files.read", &Map::new()));
        assert!(!is_destructive_call(TERMINAL_RUN, &Map::new()));
    }

    #[test]
    fn argument_scan_catches_destructive_words() {
        let args = json!({"query": "DROP TABLE users"});
        assert!(mentions_destructive_words(args.as_object().unwrap()));
        let safe = json!({"path": "/etc/hosts"});
        assert!(!mentions_destructive_words(safe.as_object().unwrap()));
    }

    #[test]
    fn gate_refuses_unconfirmed_destructive_step() {
        let gate = SafetyGate::new();
        let plan = plan(vec![step(0, TERMINAL_RUN, json!({"command": "rm -rf /tmp/x"}), true)]);
        let err = gate
            .check(&plan, &[0], &BTreeSet::new())
            .expect_err("must refuse");
        let PolicyError::ConfirmationRequired(required) = err;
        assert_eq!(required.destructive_steps, vec![0]);
        assert_eq!(required.missing_confirmation, vec![0]);

        assert!(gate.check(&plan, &[0], &BTreeSet::from([0])).is_ok());
    }

    #[test]
    fn stored_false_flag_does_not_hide_destructive_command() {
        let gate = SafetyGate::new();
        let plan = plan(vec![
            step(0, "files.list", json!({"path": "."}), false),
            step(1, TERMINAL_RUN, json!({"command": "reboot"}), false),
        ]);
        let err = gate.check(&plan, &[0, 1], &BTreeSet::new()).expect_err("refuse");
        let PolicyError::ConfirmationRequired(required) = err;
        assert_eq!(required.destructive_steps, vec![1]);
    }

    #[test]
    fn gate_only_considers_requested_indices() {
        let gate = SafetyGate::new();
        let plan = plan(vec![
            step(0, "files.list", json!({}), false),
            step(1, "files.delete", json!({"path": "/tmp/a"}), true),
            step(2, "files.delete", json!({"path": "/tmp/b"}), true),
        ]);
        assert!(gate.check(&plan, &[0], &BTreeSet::new()).is_ok());
        assert!(gate.check(&plan, &[0, 7], &BTreeSet::new()).is_ok());

        let err = gate
            .check(&plan, &[2, 1], &BTreeSet::from([1]))
            .expect_err("step 2 unconfirmed");
        let PolicyError::ConfirmationRequired(required) = err;
        assert_eq!(required.destructive_steps, vec![1, 2]);
        assert_eq!(required.missing_confirmation, vec![2]);
    }

    proptest! {
        #[test]
        fn confirming_every_destructive_index_always_passes(
            flags in prop::collection::vec(any::<bool>(), 0..12)
        ) {
            let gate = SafetyGate::new();
            let steps = flags
                .iter()
                .enumerate()
                .map(|(i, f)| step(i, "files.read", json!({}), *f))
                .collect();
            let plan = plan(steps);
            let indices = plan.all_indices();
            let destructive = gate.destructive_indices(&plan, &indices);
            prop_assert!(gate.check(&plan, &indices, &destructive).is_ok());
            if !destructive.is_empty() {
                prop_assert!(gate.check(&plan, &indices, &BTreeSet::new()).is_err());
            }
        }
    }
}
