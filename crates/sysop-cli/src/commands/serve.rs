use anyhow::Result;
use tracing::info;

use crate::context::AppContext;

/// Newline-delimited JSON dispatch over stdin/stdout until `shutdown` or EOF.
pub(crate) fn run_serve(ctx: &AppContext, json_mode: bool) -> Result<()> {
    if json_mode {
        println!(
            "{}",
            serde_json::json!({"status": "starting", "transport": "stdio"})
        );
    } else {
        eprintln!("sysop: serving dispatch requests on stdio...");
    }
    info!(methods = ctx.services.rpc.methods().len(), "stdio server starting");
    let served = sysop_jsonrpc::run_stdio_server(&ctx.services.rpc);
    ctx.services.save_sessions()?;
    served
}
