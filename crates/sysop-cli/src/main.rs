use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use sysop_core::AppConfig;
use sysop_errors::ErrorHandler;

mod commands;
mod context;
mod output;

use commands::chat::run_chat;
use commands::config::run_config_show;
use commands::plan::run_plan;
use commands::serve::run_serve;
use context::AppContext;
use output::print_json;

#[derive(Parser)]
#[command(name = "sysop")]
#[command(about = "Plan and run system administration tasks with a confirmation gate", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Workspace root holding `.sysop/` (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, inspect and run stored plans.
    Plan {
        #[command(subcommand)]
        command: PlanCmd,
    },
    /// Conversational planning on stdin.
    Chat(ChatArgs),
    /// Serve dispatch requests as JSON lines on stdio.
    Serve,
    /// Inspect the merged configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Subcommand)]
pub(crate) enum PlanCmd {
    /// Ask the planning backend for a plan and store it.
    Create {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        backend: Option<String>,
    },
    List,
    Show {
        plan_id: String,
    },
    /// Execute a stored plan. Destructive steps must be listed in `--confirm`.
    Run(PlanRunArgs),
}

#[derive(Args)]
pub(crate) struct PlanRunArgs {
    pub plan_id: String,
    /// Step indices to run, 0-based (default: all).
    #[arg(long, value_delimiter = ',')]
    pub steps: Vec<usize>,
    /// Destructive step indices the operator approves.
    #[arg(long, value_delimiter = ',')]
    pub confirm: Vec<usize>,
    /// Preview without dispatching anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Default)]
struct ChatArgs {
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (json_mode, verbose) = (cli.json, cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                let _ = print_json(&json!({"error": format!("{err:#}")}));
            } else {
                eprintln!("{}", ErrorHandler::new().verbose(verbose).handle(&err));
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let cfg = AppConfig::load(&workspace)?;
    sysop_observe::init_tracing(&cfg.logging.level, cli.verbose);
    let ctx = AppContext::new(&workspace, cfg)?;

    match cli.command.unwrap_or(Commands::Chat(ChatArgs::default())) {
        Commands::Plan { command } => run_plan(&ctx, command, cli.json),
        Commands::Chat(args) => run_chat(&ctx, args.backend.as_deref(), cli.json),
        Commands::Serve => run_serve(&ctx, cli.json),
        Commands::Config {
            command: ConfigCmd::Show,
        } => run_config_show(&ctx, cli.json),
    }
}
