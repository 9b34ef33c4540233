use anyhow::Result;
use serde_json::json;
use sysop_core::{ExecutionRequest, PlanContext, StepSelection};
use sysop_errors::errors;

use crate::context::AppContext;
use crate::output::{print_json, render_outcome, render_plan};
use crate::{PlanCmd, PlanRunArgs};

pub(crate) fn run_plan(ctx: &AppContext, cmd: PlanCmd, json_mode: bool) -> Result<()> {
    match cmd {
        PlanCmd::Create { text, backend } => create(ctx, &text.join(" "), backend.as_deref(), json_mode),
        PlanCmd::List => list(ctx, json_mode),
        PlanCmd::Show { plan_id } => show(ctx, &plan_id, json_mode),
        PlanCmd::Run(args) => run(ctx, args, json_mode),
    }
}

fn create(ctx: &AppContext, text: &str, backend: Option<&str>, json_mode: bool) -> Result<()> {
    let planner = &ctx.services.planner;
    if let Some(name) = backend
        && planner.backends().get(Some(name)).is_err()
    {
        return Err(errors::unknown_backend(name, &planner.backends().names()).into_error());
    }
    let plan = planner.create(text, &PlanContext::default(), backend)?;
    if json_mode {
        return print_json(&plan);
    }
    if plan.steps.is_empty() {
        println!("The planner returned no steps; nothing was saved.");
        return Ok(());
    }
    println!("{}", plan.response);
    print!("{}", render_plan(&plan));
    Ok(())
}

fn list(ctx: &AppContext, json_mode: bool) -> Result<()> {
    let plans = ctx.services.planner.list()?;
    if json_mode {
        let rows: Vec<_> = plans
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "name": p.name,
                    "steps": p.steps.len(),
                    "summary": p.summary(),
                    "created_at": p.created_at,
                })
            })
            .collect();
        return print_json(&rows);
    }
    if plans.is_empty() {
        println!("No stored plans.");
    }
    for plan in plans {
        println!("{}  {}  {}", plan.id, plan.created_at.format("%Y-%m-%d %H:%M"), plan.summary());
    }
    Ok(())
}

fn show(ctx: &AppContext, plan_id: &str, json_mode: bool) -> Result<()> {
    let Some(plan) = ctx.services.planner.get(plan_id)? else {
        return Err(errors::plan_not_found(plan_id).into_error());
    };
    if json_mode {
        return print_json(&plan);
    }
    print!("{}", render_plan(&plan));
    Ok(())
}

fn run(ctx: &AppContext, args: PlanRunArgs, json_mode: bool) -> Result<()> {
    if ctx.services.planner.get(&args.plan_id)?.is_none() {
        return Err(errors::plan_not_found(&args.plan_id).into_error());
    }
    let request = ExecutionRequest {
        plan_id: args.plan_id,
        selection: StepSelection {
            steps: (!args.steps.is_empty()).then_some(args.steps),
            confirm_steps: (!args.confirm.is_empty()).then(|| args.confirm.into_iter().collect()),
            dry_run: args.dry_run,
        },
    };
    let outcome = ctx.services.engine.execute_request(&request)?;
    if json_mode {
        return print_json(&outcome);
    }
    print!("{}", render_outcome(&outcome));
    Ok(())
}
