use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::error::EnhancementError;
use super::traits::AgentBackend;
use super::types::{AgentRequest, AgentResult, ValidationStatus};

/// HTTP agent service client. Each agent lives at `{base_url}/agents/{name}`.
/// A retryable failure on the primary endpoint is retried once against the
/// fallback endpoint, when one is configured.
pub struct HttpAgentBackend {
    base_url: String,
    fallback_url: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAgentBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EnhancementError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnhancementError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            fallback_url: None,
            api_key: None,
            client,
            timeout,
        })
    }

    pub fn with_fallback(mut self, url: &str) -> Self {
        self.fallback_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    async fn post(
        &self,
        base_url: &str,
        agent: &str,
        request: &AgentRequest,
    ) -> Result<AgentResult, EnhancementError> {
        let url = format!("{base_url}/agents/{agent}");
        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EnhancementError::Timeout {
                    agent: agent.to_string(),
                    after_ms: self.timeout.as_millis() as u64,
                }
            } else if e.is_connect() {
                EnhancementError::AgentInvocation {
                    agent: agent.to_string(),
                    reason: format!("connection failed to {base_url}"),
                    retryable: true,
                }
            } else {
                EnhancementError::agent_failure(agent, e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EnhancementError::agent_failure(agent, e.to_string()))?;

        if !status.is_success() {
            return Err(EnhancementError::AgentInvocation {
                agent: agent.to_string(),
                reason: format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let value = parse_json_strict(&body)?;
        let wire: AgentResponse = serde_json::from_value(value)
            .map_err(|e| EnhancementError::JsonParsing(format!("agent '{agent}': {e}")))?;
        Ok(wire.into_result(agent))
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn call_agent(
        &self,
        agent_name: &str,
        request: &AgentRequest,
    ) -> Result<AgentResult, EnhancementError> {
        let primary_err = match self.post(&self.base_url, agent_name, request).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let fallback = match &self.fallback_url {
            Some(url) if primary_err.is_retryable() => url,
            _ => return Err(primary_err),
        };

        tracing::warn!(
            agent = agent_name,
            error = %primary_err,
            "Primary agent endpoint failed, trying fallback"
        );
        match self.post(fallback, agent_name, request).await {
            Ok(result) => {
                tracing::info!(agent = agent_name, "Fallback agent endpoint succeeded");
                Ok(result)
            }
            Err(fallback_err) => Err(EnhancementError::AgentInvocation {
                agent: agent_name.to_string(),
                reason: format!("primary: {primary_err}; fallback: {fallback_err}"),
                retryable: fallback_err.is_retryable(),
            }),
        }
    }
}

/// Agent reply body. Only `confidence` is required.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    confidence: f64,
    #[serde(default, alias = "extractedData")]
    extracted_data: serde_json::Value,
    #[serde(default, alias = "validationStatus")]
    validation_status: Option<ValidationStatus>,
    #[serde(default, alias = "sourceQuote")]
    source_quote: Option<String>,
    #[serde(default, alias = "pageNumber")]
    page_number: Option<u32>,
    #[serde(default, alias = "processingTimeMs")]
    processing_time_ms: u64,
}

impl AgentResponse {
    fn into_result(self, agent: &str) -> AgentResult {
        AgentResult {
            agent_name: agent.to_string(),
            confidence: self.confidence,
            extracted_data: self.extracted_data,
            processing_time_ms: self.processing_time_ms,
            validation_status: self.validation_status.unwrap_or(ValidationStatus::Validated),
            source_quote: self.source_quote,
            page_number: self.page_number,
        }
    }
}

/// Parse a JSON object out of model-style output: markdown fences and
/// surrounding prose are stripped, the outermost `{...}` is kept.
pub fn parse_json_strict(text: &str) -> Result<serde_json::Value, EnhancementError> {
    let mut cleaned = text.trim();

    if cleaned.starts_with("```") {
        // Drop the opening fence line and a closing fence, if present
        cleaned = cleaned.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        let trimmed = cleaned.trim_end();
        if let Some(stripped) = trimmed.strip_suffix("```") {
            cleaned = stripped;
        }
    }

    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if end > start {
            cleaned = &cleaned[start..=end];
        }
    }

    serde_json::from_str(cleaned).map_err(|e| EnhancementError::JsonParsing(e.to_string()))
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
