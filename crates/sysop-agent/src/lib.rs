pub mod executor;
pub mod intent;
pub mod planner;
pub mod rpc;
pub mod session;

pub use executor::{ExecutionEngine, ExecutionError};
pub use intent::{ExecutionIntent, detect_intent};
pub use planner::{PlanNormalizer, PlanService, PlanningError};
pub use session::{ChatSession, ConversationHandler, SessionManager, SessionPhase};

use anyhow::Result;
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysop_core::AppConfig;
use sysop_jsonrpc::Dispatcher;
use sysop_llm::BackendRegistry;
use sysop_observe::Observer;
use sysop_store::PlanStore;
use sysop_tools::{CommandHost, register_command_handlers};
use tokio::runtime::Handle;
use tracing::debug;

/// Everything a front end needs, wired once per process.
///
/// `commands` only knows step commands and is what plans execute against;
/// `rpc` adds the `plan.*` methods for the stdio server.
pub struct Services {
    pub commands: Arc<Dispatcher>,
    pub rpc: Arc<Dispatcher>,
    pub planner: Arc<PlanService>,
    pub engine: Arc<ExecutionEngine>,
    pub conversation: Arc<ConversationHandler>,
    pub observer: Arc<Observer>,
    sessions_path: Option<PathBuf>,
}

impl Services {
    pub fn build(workspace: &Path, cfg: &AppConfig, runtime: Handle) -> Result<Self> {
        let backends = BackendRegistry::from_config(&cfg.llm)?;
        Self::with_backends(workspace, cfg, runtime, backends)
    }

    pub fn with_backends(
        workspace: &Path,
        cfg: &AppConfig,
        runtime: Handle,
        backends: BackendRegistry,
    ) -> Result<Self> {
        let observer = Arc::new(Observer::new(workspace, &cfg.logging)?);
        let store = PlanStore::open(&cfg.plans_dir(workspace))?;
        let planner = Arc::new(PlanService::new(backends, store, Arc::clone(&observer)));

        let host = Arc::new(CommandHost::new(workspace, cfg.tools.clone()));
        let commands = Arc::new(Dispatcher::new(runtime.clone()));
        register_command_handlers(&commands, Arc::clone(&host));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&commands),
            Arc::clone(&planner),
            Arc::clone(&observer),
        ));

        let rpc = Arc::new(Dispatcher::new(runtime));
        register_command_handlers(&rpc, host);
        rpc::register_plan_methods(&rpc, Arc::clone(&engine));

        let sessions_path = cfg
            .sessions
            .persist
            .then(|| AppConfig::sessions_path(workspace));
        let sessions = match &sessions_path {
            Some(path) => SessionManager::load_from(path),
            None => SessionManager::new(),
        };
        let hours = i64::try_from(cfg.sessions.idle_timeout_hours).unwrap_or(i64::MAX);
        let idle = Duration::try_hours(hours).unwrap_or(Duration::MAX);
        sessions.evict_idle(Utc::now(), idle);
        let conversation = Arc::new(ConversationHandler::new(
            Arc::new(sessions),
            Arc::clone(&planner),
            cfg.sessions.context_window,
        ));
        debug!(workspace = %workspace.display(), "services ready");

        Ok(Self {
            commands,
            rpc,
            planner,
            engine,
            conversation,
            observer,
            sessions_path,
        })
    }

    /// Writes the session snapshot when persistence is enabled.
    pub fn save_sessions(&self) -> Result<()> {
        match &self.sessions_path {
            Some(path) => self.conversation.sessions().save_to(path),
            None => Ok(()),
        }
    }
}
