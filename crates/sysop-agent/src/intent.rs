use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Largest step range a single message may select.
const MAX_RANGE_STEPS: usize = 256;

static CONFIRM: LazyLock<Regex> = LazyLock::new(|| {
    phrase_regex(&[
        "yes",
        "y",
        "do it",
        "run it",
        "execute",
        "go ahead",
        "proceed",
        "make it happen",
        "let's go",
        "run the plan",
        "execute it",
        "go for it",
        "start",
        "begin",
        "launch",
    ])
});

static DRY_RUN: LazyLock<Regex> = LazyLock::new(|| {
    phrase_regex(&[
        "dry run",
        "test run",
        "show me first",
        "what will happen",
        "preview",
        "simulate",
        "test it",
    ])
});

static MODIFY: LazyLock<Regex> = LazyLock::new(|| {
    phrase_regex(&["change", "modify", "update", "edit", "different", "instead"])
});

static SINGLE_STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:run|execute|do)\s+step\s+(\d+)\b").expect("single step pattern")
});

static STEP_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:run|execute|do)\s+steps?\s+(\d+)(?:\s*(?:-|to)\s*(\d+))?")
        .expect("step range pattern")
});

fn phrase_regex(phrases: &[&str]) -> Regex {
    let alternatives: Vec<String> = phrases.iter().map(|p| regex::escape(p)).collect();
    Regex::new(&format!(r"\b(?:{})\b", alternatives.join("|"))).expect("phrase pattern")
}

/// What a chat message asks the assistant to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExecutionIntent {
    ExecuteLastPlan { dry_run: bool },
    ExecuteSteps { steps: Vec<usize>, dry_run: bool },
    ModifyPlan { modification: String },
    CreatePlan { query: String },
}

impl ExecutionIntent {
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            ExecutionIntent::ExecuteLastPlan { .. } | ExecutionIntent::ExecuteSteps { .. }
        )
    }
}

/// Classifies `text`. Confirmation and modification phrases only count while
/// a proposed plan is awaiting a decision, and a confirmation then wins over
/// any step selector in the same message.
pub fn detect_intent(text: &str, awaiting_confirmation: bool) -> ExecutionIntent {
    let lower = text.trim().to_lowercase();

    if awaiting_confirmation && CONFIRM.is_match(&lower) {
        return ExecutionIntent::ExecuteLastPlan { dry_run: false };
    }
    if let Some(steps) = selected_steps(&lower) {
        return ExecutionIntent::ExecuteSteps {
            steps,
            dry_run: DRY_RUN.is_match(&lower),
        };
    }
    if DRY_RUN.is_match(&lower) {
        return ExecutionIntent::ExecuteLastPlan { dry_run: true };
    }
    if awaiting_confirmation && MODIFY.is_match(&lower) {
        return ExecutionIntent::ModifyPlan {
            modification: text.trim().to_string(),
        };
    }
    ExecutionIntent::CreatePlan {
        query: text.trim().to_string(),
    }
}

fn selected_steps(lower: &str) -> Option<Vec<usize>> {
    if let Some(caps) = SINGLE_STEP.captures(lower) {
        return caps[1].parse().ok().map(|n| vec![n]);
    }
    let caps = STEP_RANGE.captures(lower)?;
    let start: usize = caps[1].parse().ok()?;
    let end: usize = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => start,
    };
    let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
    Some((lo..=hi).take(MAX_RANGE_STEPS).collect())
}
