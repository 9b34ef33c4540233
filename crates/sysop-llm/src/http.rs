use crate::prompt::build_planning_prompt;
use crate::{PlanBackend, parse_plan_reply};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;
use sysop_core::{LlmConfig, PlanContext};
use tracing::{debug, warn};

/// Base delay for transport error retries.
const NETWORK_RETRY_BASE_MS: u64 = 1000;

/// Planning backend speaking the OpenAI-compatible chat-completions protocol.
#[derive(Debug, Clone)]
pub struct HttpPlanBackend {
    cfg: LlmConfig,
    api_key: String,
    client: Client,
}

impl HttpPlanBackend {
    pub fn new(cfg: LlmConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            cfg,
            api_key,
            client,
        })
    }

    fn payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "messages": [{"role": "user", "content": prompt}],
        })
    }

    fn complete(&self, prompt: &str) -> Result<String> {
        let payload = self.payload(prompt);
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return reply_text(&body);
                    }
                    last_err = Some(anyhow!(
                        "planning backend returned {status}: {}",
                        body.chars().take(300).collect::<String>()
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        warn!(%status, attempt, "planning request failed, retrying");
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("network error contacting planning backend: {e}"));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        warn!(error = %e, attempt, "planning request failed, retrying");
                        thread::sleep(retry_delay(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("planning request failed without detailed error")))
    }
}

impl PlanBackend for HttpPlanBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn generate(&self, prompt: &str, context: &PlanContext) -> Result<Value> {
        let text = self.complete(&build_planning_prompt(prompt, context))?;
        debug!(chars = text.len(), "planning backend replied");
        parse_plan_reply(&text)
    }
}

fn reply_text(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)?;
    value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("planning backend reply has no message content"))
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let retry_at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(retry_at.signed_duration_since(Utc::now()).num_seconds().max(0) as u64)
}

fn retry_delay(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}
