use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysop_core::{ConfirmationRequired, ExecutionResult, LoggingConfig, Plan, runtime_dir};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Installs the stderr `fmt` subscriber. `RUST_LOG` wins over `level`;
/// `verbose` forces debug. Safe to call more than once.
pub fn init_tracing(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    PlanCreated {
        plan_id: String,
        name: String,
        steps: usize,
        needs_confirmation: usize,
    },
    ConfirmationRequired {
        plan_id: String,
        destructive_steps: Vec<usize>,
        missing_confirmation: Vec<usize>,
    },
    ExecutionCompleted {
        plan_id: String,
        completed: usize,
        total: usize,
        dry_run: bool,
        failed_steps: Vec<usize>,
    },
}

/// Append-only JSON-lines audit trail under `.sysop/observe.log`.
pub struct Observer {
    log_path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl Observer {
    pub fn new(workspace: &Path, cfg: &LoggingConfig) -> Result<Self> {
        if !cfg.audit_log {
            return Ok(Self::disabled());
        }
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: Some(dir.join("observe.log")),
            lock: Mutex::new(()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            log_path: None,
            lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn plan_created(&self, plan: &Plan) {
        self.record(&AuditEvent::PlanCreated {
            plan_id: plan.id.clone(),
            name: plan.name.clone(),
            steps: plan.steps.len(),
            needs_confirmation: plan.confirmation_count(),
        });
    }

    pub fn confirmation_required(&self, refusal: &ConfirmationRequired) {
        self.record(&AuditEvent::ConfirmationRequired {
            plan_id: refusal.plan_id.clone(),
            destructive_steps: refusal.destructive_steps.clone(),
            missing_confirmation: refusal.missing_confirmation.clone(),
        });
    }

    pub fn execution_completed(&self, result: &ExecutionResult, dry_run: bool) {
        self.record(&AuditEvent::ExecutionCompleted {
            plan_id: result.plan_id.clone(),
            completed: result.completed_count(),
            total: result.results.len(),
            dry_run,
            failed_steps: result.failures().map(|r| r.index).collect(),
        });
    }

    /// Audit failures are logged and swallowed.
    pub fn record(&self, event: &AuditEvent) {
        if let Err(err) = self.append(event) {
            warn!(error = %err, "failed to write audit log");
        }
    }

    fn append(&self, event: &AuditEvent) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut line = json!({"at": Utc::now().to_rfc3339()});
        if let (Some(obj), serde_json::Value::Object(fields)) =
            (line.as_object_mut(), serde_json::to_value(event)?)
        {
            obj.extend(fields);
        }
        let _guard = self.lock.lock().expect("audit log lock");
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
