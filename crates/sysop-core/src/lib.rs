use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub const TERMINAL_RUN: &str = "terminal.run";
pub const FILES_LIST: &str = "files.list";
pub const FILES_READ: &str = "files.read";
pub const FILES_WRITE: &str = "files.write";
pub const FILES_DELETE: &str = "files.delete";

/// Commands that only observe the system. Plans made exclusively of these
/// may be offered for immediate execution.
pub const READ_ONLY_COMMANDS: &[&str] = &[FILES_LIST, FILES_READ, "system.info", "service.status"];

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".sysop")
}

pub fn new_plan_id() -> String {
    Uuid::now_v7().to_string()
}

/// One executable unit of a plan. `id` is the step's position in the plan
/// and is what callers refer to in `steps` and `confirm_steps`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: usize,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub needs_confirmation: bool,
    #[serde(default)]
    pub description: String,
}

impl Step {
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub request: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub suggest_execution: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub safety_notes: Vec<String>,
    #[serde(default)]
    pub estimated_duration: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub rollback_suggestions: Vec<String>,
}

impl Plan {
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.steps.len()).collect()
    }

    pub fn confirmation_count(&self) -> usize {
        self.steps.iter().filter(|s| s.needs_confirmation).count()
    }

    /// Short human label, e.g. `Backup Data (3 steps, 1 need confirmation)`.
    pub fn summary(&self) -> String {
        let mut out = format!("{} ({} steps", self.name, self.steps.len());
        let confirm = self.confirmation_count();
        if confirm > 0 {
            out.push_str(&format!(", {confirm} need confirmation"));
        }
        out.push(')');
        out
    }
}

/// A step exactly as the planning backend delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStep {
    Command(String),
    Record(Map<String, Value>),
    Unrecognized(Value),
}

impl From<Value> for RawStep {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => RawStep::Command(s),
            Value::Object(map) => RawStep::Record(map),
            other => RawStep::Unrecognized(other),
        }
    }
}

impl RawStep {
    /// Reads the step list from `steps`, falling back to `commands`. A
    /// scalar where a list was expected counts as a single step.
    pub fn list_from(raw: &Value) -> Vec<RawStep> {
        let source = ["steps", "commands"]
            .iter()
            .find_map(|key| raw.get(*key).filter(|v| !v.is_null()));
        match source {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().cloned().map(RawStep::from).collect(),
            Some(other) => vec![RawStep::from(other.clone())],
        }
    }
}

/// Which steps of a plan to run and which destructive ones the caller has
/// explicitly confirmed. Indices are plan step ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepSelection {
    #[serde(default)]
    pub steps: Option<Vec<usize>>,
    #[serde(default)]
    pub confirm_steps: Option<BTreeSet<usize>>,
    #[serde(default)]
    pub dry_run: bool,
}

impl StepSelection {
    pub fn indices(&self, plan: &Plan) -> Vec<usize> {
        self.steps.clone().unwrap_or_else(|| plan.all_indices())
    }

    pub fn confirmed(&self) -> BTreeSet<usize> {
        self.confirm_steps.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub plan_id: String,
    #[serde(flatten)]
    pub selection: StepSelection,
}

/// Execution request that may name a prompt instead of a stored plan; the
/// plan is then created on the fly before the gate runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeferredExecutionRequest {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(flatten)]
    pub selection: StepSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub index: usize,
    pub command: String,
    pub success: bool,
    pub output: Value,
}

impl StepOutcome {
    pub fn error_message(&self) -> Option<String> {
        match self.output.get("error") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !self.success => Some(other.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub results: Vec<StepOutcome>,
}

impl ExecutionResult {
    pub fn completed_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Refusal returned when destructive steps were requested without being
/// confirmed. Serialized with `"error": "destructive_steps_found"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error", rename = "destructive_steps_found")]
pub struct ConfirmationRequired {
    pub plan_id: String,
    pub destructive_steps: Vec<usize>,
    pub missing_confirmation: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    ConfirmationRequired(ConfirmationRequired),
}

impl ExecutionOutcome {
    pub fn plan_id(&self) -> &str {
        match self {
            ExecutionOutcome::Completed(r) => &r.plan_id,
            ExecutionOutcome::ConfirmationRequired(c) => &c.plan_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// Conversation context handed to a planning backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanContext {
    #[serde(default)]
    pub recent_messages: Vec<ContextMessage>,
    #[serde(default)]
    pub last_plan_summary: Option<String>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    #[serde(default)]
    pub modification: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub sessions: SessionsConfig,
    pub logging: LoggingConfig,
    /// Directory for stored plans, relative to the workspace unless absolute.
    pub plans_directory: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            tools: ToolsConfig::default(),
            sessions: SessionsConfig::default(),
            logging: LoggingConfig::default(),
            plans_directory: default_plans_directory(),
        }
    }
}

fn default_plans_directory() -> String {
    ".sysop/plans".to_string()
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".sysop/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn sessions_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("sessions.json")
    }

    pub fn plans_dir(&self, workspace: &Path) -> PathBuf {
        let dir = Path::new(&self.plans_directory);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            workspace.join(dir)
        }
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        Self::load_layers(&Self::legacy_toml_path(workspace), &paths)
    }

    fn load_layers(legacy: &Path, json_layers: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: toml::Value = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        for path in json_layers {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Registered backend name: "http" or "offline".
    pub backend: String,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "http".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: "SYSOP_API_KEY".to_string(),
            temperature: 0.2,
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub command_timeout_seconds: u64,
    pub read_max_bytes: u64,
    pub list_limit: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 120,
            read_max_bytes: 1_000_000,
            list_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub idle_timeout_hours: u64,
    /// Number of recent messages handed to the planning backend.
    pub context_window: usize,
    pub persist: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_hours: 24,
            context_window: 6,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub audit_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit_log: true,
        }
    }
}
