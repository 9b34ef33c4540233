use sysop_core::PlanContext;

const BASE_INSTRUCTIONS: &str = "You are a system administration assistant. \
Turn the user's request into a short plan of concrete steps.\n\
Reply with a single JSON object and nothing else.\n\
Ask for confirmation before anything that deletes data, stops services or restarts the machine.";

const REPLY_SHAPE: &str = r#"{
  "plan": "Short descriptive name (2-5 words)",
  "steps": [
    {"command": "terminal.run", "args": {"command": "shell command"}},
    {"command": "files.list", "args": {"path": "/path/to/dir"}},
    {"command": "files.read", "args": {"path": "/path/to/file"}},
    {"command": "files.write", "args": {"path": "/path/to/file", "content": "text"}}
  ],
  "suggest_execution": true,
  "response": "One or two sentences for the user ending with a question about running it.",
  "safety_notes": ["warnings about destructive operations, if any"]
}"#;

/// Renders conversation context as a few plain lines.
pub fn context_summary(ctx: &PlanContext) -> String {
    let mut lines = Vec::new();
    if let Some(summary) = &ctx.last_plan_summary {
        lines.push(format!("Last plan: {summary}"));
    }
    if ctx.awaiting_confirmation {
        lines.push("The last plan is waiting for the user's confirmation.".to_string());
    }
    for msg in &ctx.recent_messages {
        let content: String = msg.content.chars().take(200).collect();
        lines.push(format!("{}: {content}", msg.role));
    }
    if lines.is_empty() {
        "No previous conversation.".to_string()
    } else {
        lines.join("\n")
    }
}

pub fn build_planning_prompt(request: &str, ctx: &PlanContext) -> String {
    let task = match &ctx.modification {
        Some(change) => format!(
            "The user wants to change the last plan ({}).\nRequested change: \"{change}\"\nReturn the complete modified plan.",
            ctx.last_plan_summary.as_deref().unwrap_or("unknown")
        ),
        None => format!("User request: \"{request}\""),
    };
    format!(
        "{BASE_INSTRUCTIONS}\n\n{task}\n\nContext:\n{}\n\nReply format:\n{REPLY_SHAPE}\n\n\
         Available commands: terminal.run, files.list, files.read, files.write, files.delete.",
        context_summary(ctx)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysop_core::ContextMessage;

    #[test]
    fn modification_prompt_names_last_plan_and_change() {
        let ctx = PlanContext {
            last_plan_summary: Some("Backup Data (2 steps)".to_string()),
            modification: Some("use /mnt/backup instead".to_string()),
            ..PlanContext::default()
        };
        let prompt = build_planning_prompt("use /mnt/backup instead", &ctx);
        assert!(prompt.contains("Backup Data (2 steps)"));
        assert!(prompt.contains("Requested change: \"use /mnt/backup instead\""));
    }

    #[test]
    fn context_summary_lists_recent_messages() {
        let ctx = PlanContext {
            recent_messages: vec![ContextMessage {
                role: "user".to_string(),
                content: "check disk".to_string(),
            }],
            awaiting_confirmation: true,
            ..PlanContext::default()
        };
        let summary = context_summary(&ctx);
        assert!(summary.contains("user: check disk"));
        assert!(summary.contains("waiting for the user's confirmation"));
        assert_eq!(context_summary(&PlanContext::default()), "No previous conversation.");
    }
}
