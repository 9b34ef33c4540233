mod http;
pub mod prompt;

use anyhow::{Result, anyhow};
pub use http::HttpPlanBackend;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use sysop_core::{LlmConfig, PlanContext};
use tracing::{info, warn};

/// A text-generation collaborator that turns a request into raw plan data.
/// The returned mapping is untrusted and goes through the normalizer.
pub trait PlanBackend: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, prompt: &str, context: &PlanContext) -> Result<Value>;
}

/// Pulls the JSON object out of a model reply, accepting a ```json fence or
/// the outermost braces.
pub fn extract_json_snippet(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    if let Some(start) = text.find('{')
        && let Some(end) = text.rfind('}')
        && end > start
    {
        return Some(text[start..=end].trim());
    }
    None
}

pub fn parse_plan_reply(text: &str) -> Result<Value> {
    let snippet = extract_json_snippet(text)
        .ok_or_else(|| anyhow!("planning backend reply contained no JSON object"))?;
    let value: Value = serde_json::from_str(snippet)
        .map_err(|e| anyhow!("planning backend reply was not valid JSON: {e}"))?;
    if !value.is_object() {
        return Err(anyhow!("planning backend reply was not a JSON object"));
    }
    Ok(value)
}

/// Deterministic backend used when no API key is configured.
#[derive(Debug, Default, Clone)]
pub struct OfflineBackend;

impl PlanBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    fn generate(&self, prompt: &str, _context: &PlanContext) -> Result<Value> {
        let lower = prompt.to_lowercase();
        let steps = if lower.contains("install") {
            let package = prompt.split_whitespace().last().unwrap_or("package");
            json!([
                {"command": "terminal.run", "args": {"command": "sudo apt update"}},
                {"command": "terminal.run", "args": {"command": format!("sudo apt install -y {package}")}},
            ])
        } else if lower.contains("list") || lower.contains("find") {
            json!([{"command": "files.list", "args": {"path": "."}}])
        } else {
            let quoted = shell_single_quote(&format!("Executing: {prompt}"));
            json!([{"command": "terminal.run", "args": {"command": format!("echo {quoted}")}}])
        };
        let short: String = prompt.chars().take(20).collect();
        Ok(json!({
            "plan": format!("Offline plan for: {short}"),
            "steps": steps,
            "safety_notes": ["Generated offline; no planning service is configured."],
        }))
    }
}

fn shell_single_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Named planning backends with a default.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn PlanBackend>>,
    default: String,
}

impl BackendRegistry {
    pub fn new(default: Arc<dyn PlanBackend>) -> Self {
        let name = default.name().to_string();
        let mut backends = BTreeMap::new();
        backends.insert(name.clone(), default);
        Self {
            backends,
            default: name,
        }
    }

    /// Offline is always available; `http` is added when an API key resolves.
    /// Falls back to offline when the configured backend is unavailable.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let mut registry = Self::new(Arc::new(OfflineBackend));
        if let Some(key) = cfg.resolved_api_key() {
            registry.register(Arc::new(HttpPlanBackend::new(cfg.clone(), key)?));
        }
        if registry.backends.contains_key(&cfg.backend) {
            registry.default = cfg.backend.clone();
        } else {
            warn!(backend = %cfg.backend, "planning backend unavailable, using offline");
        }
        info!(default = %registry.default, "planning backends ready");
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn PlanBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("unknown planning backend '{name}'"));
        }
        self.default = name.to_string();
        Ok(())
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn PlanBackend>> {
        let name = name.unwrap_or(&self.default);
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown planning backend '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_or_bare_json() {
        assert_eq!(
            extract_json_snippet("sure\n```json\n{\"plan\":\"x\"}\n```\nbye"),
            Some("{\"plan\":\"x\"}")
        );
        assert_eq!(
            extract_json_snippet("here: {\"a\": {\"b\": 1}} done"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(extract_json_snippet("no json here"), None);
    }

    #[test]
    fn parse_plan_reply_rejects_non_objects() {
        assert!(parse_plan_reply("{\"plan\": \"ok\", \"steps\": []}").is_ok());
        assert!(parse_plan_reply("I cannot help with that").is_err());
        assert!(parse_plan_reply("{broken}").is_err());
    }

    #[test]
    fn offline_backend_shapes_plan_from_keywords() {
        let ctx = PlanContext::default();
        let install = OfflineBackend.generate("please install nginx", &ctx).expect("plan");
        assert_eq!(install["steps"][1]["args"]["command"], "sudo apt install -y nginx");

        let list = OfflineBackend.generate("list my files", &ctx).expect("plan");
        assert_eq!(list["steps"][0]["command"], "files.list");

        let other = OfflineBackend.generate("say it's fine", &ctx).expect("plan");
        assert_eq!(
            other["steps"][0]["args"]["command"],
            r"echo 'Executing: say it'\''s fine'"
        );
    }

    #[test]
    fn registry_falls_back_to_offline_without_key() {
        let cfg = LlmConfig {
            api_key: None,
            api_key_env: "SYSOP_TEST_DEFINITELY_UNSET".to_string(),
            ..LlmConfig::default()
        };
        let registry = BackendRegistry::from_config(&cfg).expect("registry");
        assert_eq!(registry.default_name(), "offline");
        assert_eq!(registry.get(None).expect("default").name(), "offline");
        assert!(registry.get(Some("gemini")).is_err());
    }

    #[test]
    fn registry_uses_http_when_key_present() {
        let cfg = LlmConfig {
            api_key: Some("k".to_string()),
            ..LlmConfig::default()
        };
        let registry = BackendRegistry::from_config(&cfg).expect("registry");
        assert_eq!(registry.default_name(), "http");
        assert_eq!(registry.names(), vec!["http".to_string(), "offline".to_string()]);
    }
}
