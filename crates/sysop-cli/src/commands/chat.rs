use anyhow::Result;
use std::io::{self, BufRead, Write};
use sysop_agent::session::ConversationReply;
use sysop_core::{ExecutionOutcome, StepSelection};
use tracing::debug;

use crate::context::AppContext;
use crate::output::{print_json, render_outcome, render_plan};

const EXIT_WORDS: &[&str] = &["exit", "quit", ":q"];

pub(crate) fn run_chat(ctx: &AppContext, backend: Option<&str>, json_mode: bool) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let session = ctx.services.conversation.sessions().default_session();
    let session_id = session.lock().expect("session lock").id.clone();
    if !json_mode {
        println!("sysop chat (session {session_id}). Type 'exit' to leave.");
    }

    loop {
        if !json_mode {
            print!("> ");
            io::stdout().flush()?;
        }
        let Some(line) = lines.next() else { break };
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if EXIT_WORDS.contains(&text.to_lowercase().as_str()) {
            break;
        }

        let reply = ctx
            .services
            .conversation
            .process_user_message(text, Some(&session_id), backend);
        if json_mode {
            print_json(&reply)?;
        } else {
            println!("{}", reply.response);
            if let Some(plan) = &reply.plan {
                print!("{}", render_plan(plan));
            }
        }
        if reply.execute_plan {
            execute_reply(ctx, &session_id, &reply, &mut lines, json_mode)?;
        }
    }

    ctx.services.save_sessions()
}

fn execute_reply<I>(
    ctx: &AppContext,
    session_id: &str,
    reply: &ConversationReply,
    lines: &mut I,
    json_mode: bool,
) -> Result<()>
where
    I: Iterator<Item = io::Result<String>>,
{
    let conversation = &ctx.services.conversation;
    let plan = match reply.plan_id.as_deref() {
        Some(id) => ctx.services.planner.get(id)?,
        None => None,
    };
    let Some(plan) = plan else {
        let result = conversation.handle_plan_execution_result(session_id, Err("the plan is no longer stored"));
        return emit(&result.response, &result, json_mode);
    };

    let mut selection = StepSelection {
        steps: reply.steps.clone(),
        confirm_steps: None,
        dry_run: reply.dry_run,
    };
    let mut outcome = ctx.services.engine.execute(&plan, &selection);

    // One clarifying round trip for destructive steps.
    if let ExecutionOutcome::ConfirmationRequired(refusal) = &outcome {
        let listed: Vec<String> = refusal
            .destructive_steps
            .iter()
            .map(|i| match plan.step(*i) {
                Some(step) => format!("  [{i}] {}", step.description),
                None => format!("  [{i}]"),
            })
            .collect();
        if !json_mode {
            println!("These steps can change or delete data:\n{}", listed.join("\n"));
            print!("Run them? [y/N] ");
            io::stdout().flush()?;
        }
        let answer = match lines.next() {
            Some(line) => line?,
            None => String::new(),
        };
        if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            selection.confirm_steps = Some(refusal.destructive_steps.iter().copied().collect());
            outcome = ctx.services.engine.execute(&plan, &selection);
        } else {
            debug!(plan_id = %plan.id, "destructive steps declined");
        }
    }

    if !json_mode {
        print!("{}", render_outcome(&outcome));
    }
    let result = conversation.handle_plan_execution_result(session_id, Ok(&outcome));
    emit(&result.response, &result, json_mode)
}

fn emit<T: serde::Serialize>(text: &str, value: &T, json_mode: bool) -> Result<()> {
    if json_mode {
        print_json(value)
    } else {
        println!("{text}");
        Ok(())
    }
}
