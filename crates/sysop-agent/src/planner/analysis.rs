use sysop_core::{READ_ONLY_COMMANDS, Step, TERMINAL_RUN};

/// Verb to plan title, first match wins.
const NAME_KEYWORDS: &[(&str, &str)] = &[
    ("install", "Install Package"),
    ("update", "Update System"),
    ("upgrade", "Upgrade Package"),
    ("remove", "Remove Package"),
    ("delete", "Delete Files"),
    ("create", "Create Files"),
    ("backup", "Backup Data"),
    ("restore", "Restore Data"),
    ("configure", "Configure System"),
    ("setup", "Setup Service"),
    ("start", "Start Service"),
    ("stop", "Stop Service"),
    ("restart", "Restart Service"),
    ("check", "System Check"),
    ("monitor", "Monitor System"),
    ("fix", "Fix Issue"),
    ("troubleshoot", "Troubleshoot Problem"),
];

const SYSTEM_LEVEL_WORDS: &[&str] = &["sudo", "rm -rf", "format", "fdisk"];
const NETWORK_WORDS: &[&str] = &["wget", "curl", "ssh", "scp", "rsync"];
const MAX_AUTO_SUGGEST_STEPS: usize = 3;

/// Title for a request the backend left unnamed.
pub fn generate_plan_name(request: &str) -> String {
    let lower = request.to_lowercase();
    if let Some((_, title)) = NAME_KEYWORDS.iter().find(|(kw, _)| lower.contains(kw)) {
        return (*title).to_string();
    }
    let words: Vec<String> = request.split_whitespace().take(3).map(title_case).collect();
    format!("Execute: {}", words.join(" "))
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Read-only plans of a few steps may be offered for immediate execution.
pub fn should_suggest_execution(steps: &[Step], awaiting_confirmation: bool) -> bool {
    if steps.is_empty() || awaiting_confirmation || steps.len() > MAX_AUTO_SUGGEST_STEPS {
        return false;
    }
    steps
        .iter()
        .all(|s| !s.needs_confirmation && READ_ONLY_COMMANDS.contains(&s.command.as_str()))
}

fn shell_text(step: &Step) -> Option<String> {
    if step.command != TERMINAL_RUN {
        return None;
    }
    step.arg_str("command").map(str::to_lowercase)
}

pub fn safety_concerns(steps: &[Step]) -> Vec<String> {
    let mut notes = Vec::new();
    let destructive = steps.iter().filter(|s| s.needs_confirmation).count();
    if destructive > 0 {
        notes.push(format!(
            "This plan contains {destructive} potentially destructive operations that require confirmation."
        ));
    }
    let shell: Vec<String> = steps.iter().filter_map(shell_text).collect();
    if shell
        .iter()
        .any(|cmd| SYSTEM_LEVEL_WORDS.iter().any(|w| cmd.contains(w)))
    {
        notes.push(
            "This plan includes system-level operations that could affect system stability."
                .to_string(),
        );
    }
    if shell
        .iter()
        .any(|cmd| NETWORK_WORDS.iter().any(|w| cmd.contains(w)))
    {
        notes.push("This plan includes network operations that may transfer data.".to_string());
    }
    notes
}

fn step_seconds(step: &Step) -> u64 {
    if let Some(cmd) = shell_text(step) {
        let has = |words: &[&str]| words.iter().any(|w| cmd.contains(w));
        return if has(&["install", "update", "upgrade"]) {
            60
        } else if has(&["download", "wget", "curl"]) {
            30
        } else if has(&["compile", "build", "make"]) {
            120
        } else {
            5
        };
    }
    if step.command.contains("service") { 10 } else { 3 }
}

pub fn estimate_duration(steps: &[Step]) -> String {
    if steps.is_empty() {
        return "< 1 minute".to_string();
    }
    let total: u64 = steps.iter().map(step_seconds).sum();
    match total {
        t if t < 60 => format!("~{t} seconds"),
        t if t < 300 => format!("~{} minutes", t / 60),
        t => format!("~{} minutes (long-running)", t / 60),
    }
}

pub fn prerequisites(steps: &[Step]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut add = |item: &str| {
        if !out.iter().any(|existing| existing == item) {
            out.push(item.to_string());
        }
    };
    for cmd in steps.iter().filter_map(shell_text) {
        if cmd.contains("sudo") {
            add("sudo access");
        }
        if ["apt", "yum", "dnf", "pacman"].iter().any(|pm| cmd.contains(pm)) {
            add("package manager access");
        }
        if ["wget", "curl", "git clone"].iter().any(|w| cmd.contains(w)) {
            add("internet connection");
        }
        if cmd.contains("systemctl") {
            add("systemd");
        }
    }
    out
}

pub fn rollback_suggestions(steps: &[Step]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cmd in steps
        .iter()
        .filter(|s| s.needs_confirmation)
        .filter_map(shell_text)
    {
        let suggestion = if cmd.contains("rm ") {
            "Create backups before deleting files"
        } else if cmd.contains("install") {
            "Note installed packages for potential removal"
        } else if cmd.contains("stop") || cmd.contains("disable") {
            "Remember current service states for restoration"
        } else if cmd.contains("modify") || cmd.contains("edit") {
            "Backup configuration files before modification"
        } else {
            continue;
        };
        if !out.iter().any(|s| s == suggestion) {
            out.push(suggestion.to_string());
        }
    }
    out
}

pub fn default_response(plan_name: &str) -> String {
    format!(
        "I've created a plan to {}. Would you like me to execute it?",
        plan_name.to_lowercase()
    )
}
