mod conversation;

pub use conversation::{ConversationHandler, ConversationReply, ExecutionReply, ExecutionSummary};

use crate::intent::ExecutionIntent;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use sysop_core::{ContextMessage, ExecutionOutcome, Plan, PlanContext};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_MESSAGES: usize = 50;
pub const MAX_PLAN_HISTORY: usize = 20;
pub const MAX_EXECUTION_HISTORY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanRecord {
    pub id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub suggest_execution: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub plan_id: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    PlanProposed,
    ExecutionPending,
}

/// One conversation. The phase is derived from the fields rather than
/// stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub last_plan_id: Option<String>,
    #[serde(default)]
    pub last_plan_summary: Option<String>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    #[serde(default)]
    pub pending_execution_intent: Option<ExecutionIntent>,
    #[serde(default)]
    pub plan_history: Vec<PlanRecord>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub preferred_backend: Option<String>,
}

fn keep_last<T>(items: &mut Vec<T>, max: usize) {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

impl ChatSession {
    pub fn new(id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            created_at: now,
            last_activity: now,
            messages: Vec::new(),
            last_plan_id: None,
            last_plan_summary: None,
            awaiting_confirmation: false,
            pending_execution_intent: None,
            plan_history: Vec::new(),
            execution_history: Vec::new(),
            preferred_backend: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.pending_execution_intent.is_some() {
            SessionPhase::ExecutionPending
        } else if self.awaiting_confirmation {
            SessionPhase::PlanProposed
        } else {
            SessionPhase::Idle
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn add_message(&mut self, role: &str, content: &str, metadata: Value) {
        self.messages.push(SessionMessage {
            id: Uuid::now_v7().to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata,
        });
        keep_last(&mut self.messages, MAX_MESSAGES);
        self.touch();
    }

    /// Records a new plan; it is proposed for execution only when the plan
    /// suggests it. Any intent pending on an older plan is dropped.
    pub fn set_last_plan(&mut self, plan: &Plan) {
        let summary = plan.summary();
        self.last_plan_id = Some(plan.id.clone());
        self.last_plan_summary = Some(summary.clone());
        self.awaiting_confirmation = plan.suggest_execution;
        self.pending_execution_intent = None;
        self.plan_history.push(PlanRecord {
            id: plan.id.clone(),
            summary,
            created_at: Utc::now(),
            suggest_execution: plan.suggest_execution,
        });
        keep_last(&mut self.plan_history, MAX_PLAN_HISTORY);
        self.touch();
        debug!(session = %self.id, phase = ?self.phase(), "plan recorded");
    }

    pub fn set_execution_intent(&mut self, intent: ExecutionIntent) {
        self.pending_execution_intent = Some(intent);
        self.touch();
    }

    pub fn clear_execution_state(&mut self) {
        self.awaiting_confirmation = false;
        self.pending_execution_intent = None;
        self.touch();
    }

    pub fn record_execution(&mut self, outcome: &ExecutionOutcome) {
        let success = match outcome {
            ExecutionOutcome::Completed(result) => result.failures().next().is_none(),
            ExecutionOutcome::ConfirmationRequired(_) => false,
        };
        self.execution_history.push(ExecutionRecord {
            plan_id: outcome.plan_id().to_string(),
            executed_at: Utc::now(),
            success,
            result: serde_json::to_value(outcome).unwrap_or(Value::Null),
        });
        keep_last(&mut self.execution_history, MAX_EXECUTION_HISTORY);
        self.touch();
    }

    /// Records a run that never produced an outcome.
    pub fn record_execution_error(&mut self, plan_id: &str, message: &str) {
        self.execution_history.push(ExecutionRecord {
            plan_id: plan_id.to_string(),
            executed_at: Utc::now(),
            success: false,
            result: serde_json::json!({"error": message}),
        });
        keep_last(&mut self.execution_history, MAX_EXECUTION_HISTORY);
        self.touch();
    }

    pub fn recent_messages(&self, count: usize) -> &[SessionMessage] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    /// Context handed to the planning backend.
    pub fn plan_context(&self, window: usize) -> PlanContext {
        PlanContext {
            recent_messages: self
                .recent_messages(window)
                .iter()
                .map(|m| ContextMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            last_plan_summary: self.last_plan_summary.clone(),
            awaiting_confirmation: self.awaiting_confirmation,
            modification: None,
        }
    }
}

pub type SharedSession = Arc<Mutex<ChatSession>>;

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, SharedSession>,
    default_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    sessions: HashMap<String, ChatSession>,
    #[serde(default)]
    default_session_id: Option<String>,
}

/// Owns every session by id. The first session created becomes the default.
#[derive(Default)]
pub struct SessionManager {
    table: Mutex<SessionTable>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: Option<&str>) -> SharedSession {
        let mut table = self.table.lock().expect("session table lock");
        if let Some(existing) = id.and_then(|id| table.sessions.get(id)) {
            return Arc::clone(existing);
        }
        let session = ChatSession::new(id.map(str::to_string));
        let session_id = session.id.clone();
        let shared = Arc::new(Mutex::new(session));
        table.sessions.insert(session_id.clone(), Arc::clone(&shared));
        if table.default_id.is_none() {
            table.default_id = Some(session_id.clone());
        }
        info!(session = %session_id, "session created");
        shared
    }

    pub fn default_session(&self) -> SharedSession {
        let default_id = self
            .table
            .lock()
            .expect("session table lock")
            .default_id
            .clone();
        self.get_or_create(default_id.as_deref())
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.table
            .lock()
            .expect("session table lock")
            .sessions
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("session table lock").sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops sessions idle for longer than `max_idle` and returns their ids.
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> Vec<String> {
        let mut table = self.table.lock().expect("session table lock");
        let stale: Vec<String> = table
            .sessions
            .iter()
            .filter(|(_, s)| now - s.lock().expect("session lock").last_activity > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            table.sessions.remove(id);
            if table.default_id.as_deref() == Some(id.as_str()) {
                table.default_id = None;
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "evicted idle sessions");
        }
        stale
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let table = self.table.lock().expect("session table lock");
            SessionSnapshot {
                sessions: table
                    .sessions
                    .iter()
                    .map(|(id, s)| (id.clone(), s.lock().expect("session lock").clone()))
                    .collect(),
                default_session_id: table.default_id.clone(),
            }
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }

    /// A missing or unreadable snapshot yields an empty manager.
    pub fn load_from(path: &Path) -> Self {
        let snapshot = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<SessionSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring corrupt session file");
                    return Self::new();
                }
            },
            Err(_) => return Self::new(),
        };
        let sessions = snapshot
            .sessions
            .into_iter()
            .map(|(id, s)| (id, Arc::new(Mutex::new(s))))
            .collect::<HashMap<_, _>>();
        let default_id = snapshot
            .default_session_id
            .filter(|id| sessions.contains_key(id));
        Self {
            table: Mutex::new(SessionTable {
                sessions,
                default_id,
            }),
        }
    }
}
