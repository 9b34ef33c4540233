use anyhow::Result;
use std::path::{Path, PathBuf};
use sysop_agent::Services;
use sysop_core::AppConfig;
use tokio::runtime::Runtime;

/// Per-invocation state: configuration, the shared runtime and the wired
/// services.
pub(crate) struct AppContext {
    pub workspace: PathBuf,
    pub cfg: AppConfig,
    pub services: Services,
    // Dropped last; dispatchers hold handles into it.
    _runtime: Runtime,
}

impl AppContext {
    pub fn new(workspace: &Path, cfg: AppConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sysop-worker")
            .build()?;
        let services = Services::build(workspace, &cfg, runtime.handle().clone())?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            cfg,
            services,
            _runtime: runtime,
        })
    }
}
