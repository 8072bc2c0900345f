//! Single-endpoint AI client: protocol detection, chat requests, decision
//! parsing, token accounting.

use crate::config::{AppConfig, EndpointSpec};
use crate::error::{Result, ShoeboxError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use shoebox_catalog::FolderAction;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, warn};

/// Wire protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `/v1/chat/completions`
    OpenAi,
    /// `/api/chat`
    Ollama,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

/// Folder-action query for the AI stage.
#[derive(Debug, Clone)]
pub struct FolderActionRequest {
    /// The folder sample payload (name, children, totals)
    pub payload: Value,
    pub hint: Option<FolderAction>,
    pub rule_category: Option<String>,
}

/// File-category query for the AI stage.
#[derive(Debug, Clone)]
pub struct FileClassifyRequest {
    pub name: String,
    pub rel_path: String,
    pub mime: String,
    pub sample: String,
    pub rule_hint: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Parsed folder decision, fixed schema.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderDecisionWire {
    pub decision: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FolderDecision {
    /// keep or disaggregate only
    pub action: FolderAction,
    pub category: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FileDecision {
    pub category: Option<String>,
    pub confidence: Option<f64>,
}

/// Input/output token counts accumulated per endpoint.
#[derive(Debug, Default)]
pub struct TokenTotals {
    pub input: AtomicU64,
    pub output: AtomicU64,
}

const FOLDER_SYSTEM_PROMPT: &str = "You decide whether a folder should be preserved as one unit \
or broken apart so its files can be filed individually. Reply with strict JSON only: \
{\"decision\": \"keep\" or \"disaggregate\", \"category\": optional category path, \
\"confidence\": optional number between 0 and 1}. \
Keep folders that form a coherent unit (a project, an album, an installed application). \
Disaggregate dumping grounds (downloads, desktop piles, mixed backups).";

const FILE_SYSTEM_PROMPT: &str = "You file a single file into a canonical category tree. \
Reply with strict JSON only: {\"category\": \"<one of the known category paths>\", \
\"confidence\": optional number between 0 and 1}.";

/// One AI endpoint with its own worker cap and token counters.
pub struct AiEndpoint {
    pub spec: EndpointSpec,
    http: Client,
    protocol: OnceCell<Protocol>,
    pub semaphore: Semaphore,
    tokens: TokenTotals,
    timeout: Duration,
    retries: u32,
    backoff: f64,
    throttle: Duration,
    last_request: Mutex<Option<std::time::Instant>>,
}

impl AiEndpoint {
    pub fn new(spec: EndpointSpec, config: &AppConfig) -> Self {
        let workers = spec.workers.max(1);
        Self {
            spec,
            http: Client::new(),
            protocol: OnceCell::new(),
            semaphore: Semaphore::new(workers),
            tokens: TokenTotals::default(),
            timeout: Duration::from_secs(config.ollama_timeout_secs.max(1)),
            retries: config.ollama_retries,
            backoff: config.ollama_backoff.max(1.0),
            throttle: Duration::from_secs_f64(config.ollama_throttle_secs.max(0.0)),
            last_request: Mutex::new(None),
        }
    }

    pub fn token_totals(&self) -> (u64, u64) {
        (
            self.tokens.input.load(Ordering::Relaxed),
            self.tokens.output.load(Ordering::Relaxed),
        )
    }

    /// Detect the wire protocol, probing once and caching for the process
    /// lifetime.
    pub async fn protocol(&self) -> Result<Protocol> {
        self.protocol
            .get_or_try_init(|| self.detect())
            .await
            .copied()
    }

    async fn detect(&self) -> Result<Protocol> {
        let url = &self.spec.url;
        let probe_timeout = Duration::from_secs(5);

        if let Ok(resp) = self
            .http
            .get(format!("{url}/v1/models"))
            .timeout(probe_timeout)
            .send()
            .await
        {
            if resp.status().is_success() {
                if let Ok(body) = resp.json::<Value>().await {
                    // LM Studio answers 200 with an error field for
                    // unsupported endpoints.
                    if body.get("error").is_none()
                        && (body.get("data").is_some() || body.get("object").is_some())
                    {
                        debug!(url, "detected OpenAI-compatible endpoint");
                        return Ok(Protocol::OpenAi);
                    }
                }
            }
        }

        if let Ok(resp) = self
            .http
            .get(format!("{url}/api/tags"))
            .timeout(probe_timeout)
            .send()
            .await
        {
            if resp.status().is_success() {
                if let Ok(body) = resp.json::<Value>().await {
                    if body.get("error").is_none() {
                        debug!(url, "detected Ollama endpoint");
                        return Ok(Protocol::Ollama);
                    }
                }
            }
        }

        Err(ShoeboxError::AiUnavailable(format!(
            "no compatible AI API detected at {url}"
        )))
    }

    /// Verify the endpoint answers and, for Ollama, that the model is
    /// installed.
    pub async fn ensure_available(&self) -> Result<()> {
        match self.protocol().await? {
            Protocol::OpenAi => Ok(()),
            Protocol::Ollama => {
                let resp = self
                    .http
                    .get(format!("{}/api/tags", self.spec.url))
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .map_err(|e| ShoeboxError::AiUnavailable(e.to_string()))?;
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| ShoeboxError::AiUnavailable(e.to_string()))?;
                let models: Vec<String> = body
                    .get("models")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|m| {
                                m.get("name")
                                    .or_else(|| m.get("model"))
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let want = &self.spec.model;
                let found = models
                    .iter()
                    .any(|m| m == want || m.starts_with(&format!("{want}:")));
                if !found && !models.is_empty() {
                    return Err(ShoeboxError::AiUnavailable(format!(
                        "model '{want}' not installed at {} (have: {models:?})",
                        self.spec.url
                    )));
                }
                Ok(())
            }
        }
    }

    async fn enforce_throttle(&self) {
        if self.throttle.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.throttle {
                tokio::time::sleep(self.throttle - elapsed).await;
            }
        }
        *last = Some(std::time::Instant::now());
    }

    /// One chat round-trip with retries, backoff, and token accounting.
    /// Returns the assistant's text content.
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let protocol = self.protocol().await?;
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                let wait = self.backoff.powi(attempt as i32 - 1);
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
            self.enforce_throttle().await;
            match self.chat_once(protocol, system, user).await {
                Ok(content) => return Ok(content),
                Err(e) => {
                    warn!(
                        url = %self.spec.url,
                        attempt = attempt + 1,
                        max = self.retries + 1,
                        error = %e,
                        "AI request failed"
                    );
                    last_error = e.to_string();
                }
            }
        }
        Err(ShoeboxError::AiUnavailable(format!(
            "{} after {} attempts: {last_error}",
            self.spec.url,
            self.retries + 1
        )))
    }

    async fn chat_once(&self, protocol: Protocol, system: &str, user: &str) -> Result<String> {
        let (path, body) = match protocol {
            Protocol::OpenAi => (
                "/v1/chat/completions",
                json!({
                    "model": self.spec.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                    "temperature": 0,
                    "stream": false,
                }),
            ),
            Protocol::Ollama => (
                "/api/chat",
                json!({
                    "model": self.spec.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                    "stream": false,
                    "options": {"temperature": 0},
                }),
            ),
        };

        let resp = self
            .http
            .post(format!("{}{path}", self.spec.url))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ShoeboxError::AiUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ShoeboxError::AiUnavailable(format!(
                "HTTP {} from {}",
                resp.status(),
                self.spec.url
            )));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ShoeboxError::AiUnavailable(e.to_string()))?;

        let (content, tokens_in, tokens_out) = match protocol {
            Protocol::OpenAi => (
                data.pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                data.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
                data.pointer("/usage/completion_tokens")
                    .and_then(Value::as_u64),
            ),
            Protocol::Ollama => (
                data.pointer("/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                data.get("prompt_eval_count").and_then(Value::as_u64),
                data.get("eval_count").and_then(Value::as_u64),
            ),
        };
        if let Some(n) = tokens_in {
            self.tokens.input.fetch_add(n, Ordering::Relaxed);
        }
        if let Some(n) = tokens_out {
            self.tokens.output.fetch_add(n, Ordering::Relaxed);
        }
        if content.is_empty() {
            return Err(ShoeboxError::AiUnavailable(format!(
                "empty completion from {}",
                self.spec.url
            )));
        }
        Ok(content)
    }

    /// Ask for a folder decision. Malformed output is retried once, then
    /// reported unavailable.
    pub async fn decide_folder(&self, request: &FolderActionRequest) -> Result<FolderDecision> {
        let mut system = FOLDER_SYSTEM_PROMPT.to_string();
        if let Some(hint) = request.hint {
            system.push_str(&format!(
                " If uncertain, lean towards the rule hint: {hint}."
            ));
        }
        let mut payload = request.payload.clone();
        if let Some(hint) = request.hint {
            payload["rule_hint"] = json!(hint.as_str());
        }
        if let Some(category) = &request.rule_category {
            payload["rule_category"] = json!(category);
        }
        let user = payload.to_string();

        for parse_attempt in 0..2 {
            let content = self.chat(&system, &user).await?;
            match parse_folder_decision(&content) {
                Some(decision) => return Ok(decision),
                None => {
                    warn!(
                        url = %self.spec.url,
                        attempt = parse_attempt + 1,
                        raw = %content,
                        "malformed folder decision"
                    );
                }
            }
        }
        Err(ShoeboxError::AiUnavailable(format!(
            "malformed folder decision from {}",
            self.spec.url
        )))
    }

    /// Ask for a file category.
    pub async fn classify_file(
        &self,
        request: &FileClassifyRequest,
        categories_json: &str,
    ) -> Result<FileDecision> {
        let system = format!("{FILE_SYSTEM_PROMPT}\n\nKnown categories: {categories_json}");
        let mut lines = vec![
            format!("Filename: {}", request.name),
            format!("Path: {}", request.rel_path),
            format!("MIME: {}", request.mime),
        ];
        if let Some(hint) = &request.rule_hint {
            lines.push(format!("Rule Hint: {hint}"));
        }
        let interesting: Vec<String> = request
            .metadata
            .iter()
            .filter(|(k, v)| !v.is_empty() && !matches!(k.as_str(), "filename" | "extension"))
            .take(10)
            .map(|(k, v)| format!("  {k}: {v}"))
            .collect();
        if !interesting.is_empty() {
            lines.push("Metadata:".to_string());
            lines.extend(interesting);
        }
        lines.push("Content Sample:".to_string());
        lines.push(request.sample.clone());
        let user = lines.join("\n");

        for parse_attempt in 0..2 {
            let content = self.chat(&system, &user).await?;
            match parse_file_decision(&content) {
                Some(decision) => return Ok(decision),
                None => {
                    warn!(
                        url = %self.spec.url,
                        attempt = parse_attempt + 1,
                        raw = %content,
                        "malformed file decision"
                    );
                }
            }
        }
        Err(ShoeboxError::AiUnavailable(format!(
            "malformed file decision from {}",
            self.spec.url
        )))
    }
}

/// Extract the first JSON object embedded in model output.
fn extract_json(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

fn parse_folder_decision(content: &str) -> Option<FolderDecision> {
    let value = extract_json(content)?;
    let wire: FolderDecisionWire = serde_json::from_value(value).ok()?;
    let action = match wire.decision.trim().to_lowercase().as_str() {
        "keep" => FolderAction::Keep,
        "disaggregate" | "strip" => FolderAction::Disaggregate,
        _ => return None,
    };
    Some(FolderDecision {
        action,
        category: wire.category.filter(|c| !c.trim().is_empty()),
        confidence: wire.confidence,
    })
}

fn parse_file_decision(content: &str) -> Option<FileDecision> {
    let value = extract_json(content)?;
    let category = value
        .get("category")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|c| !c.trim().is_empty())?;
    Some(FileDecision {
        category: Some(category),
        confidence: value.get("confidence").and_then(Value::as_f64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_decision() {
        let decision = parse_folder_decision(r#"{"decision": "keep", "confidence": 0.9}"#).unwrap();
        assert_eq!(decision.action, FolderAction::Keep);
        assert_eq!(decision.confidence, Some(0.9));
    }

    #[test]
    fn parses_fenced_json_decision() {
        let content = "Here you go:\n```json\n{\"decision\": \"disaggregate\", \
                       \"category\": \"Documents/Finance\"}\n```";
        let decision = parse_folder_decision(content).unwrap();
        assert_eq!(decision.action, FolderAction::Disaggregate);
        assert_eq!(decision.category.as_deref(), Some("Documents/Finance"));
    }

    #[test]
    fn rejects_ambiguous_decision() {
        assert!(parse_folder_decision(r#"{"decision": "maybe"}"#).is_none());
        assert!(parse_folder_decision("keep").is_none());
    }

    #[test]
    fn parses_file_decision_category() {
        let decision = parse_file_decision(r#"{"category": "Media/Audio"}"#).unwrap();
        assert_eq!(decision.category.as_deref(), Some("Media/Audio"));
    }
}
