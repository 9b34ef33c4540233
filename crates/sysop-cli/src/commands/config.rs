use anyhow::Result;

use crate::context::AppContext;
use crate::output::{print_json, redact_config_for_display};

pub(crate) fn run_config_show(ctx: &AppContext, json_mode: bool) -> Result<()> {
    let value = redact_config_for_display(&ctx.cfg)?;
    if json_mode {
        return print_json(&value);
    }
    println!("workspace: {}", ctx.workspace.display());
    println!("plans: {}", ctx.cfg.plans_dir(&ctx.workspace).display());
    println!(
        "planning backend: {} (available: {})",
        ctx.services.planner.backends().default_name(),
        ctx.services.planner.backends().names().join(", ")
    );
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
