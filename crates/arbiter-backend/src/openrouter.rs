use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use arbiter_types::UsageTotals;

use crate::{
    with_retries, Backend, BackendFailure, CallSuccess, ChatRequest, EmbedRequest, EmbedSuccess,
    FailureCode,
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Live backend speaking the OpenRouter chat-completions and embeddings API.
pub struct OpenRouterBackend {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenRouterBackend {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Self {
        Self {
            base_url: normalize_base(base_url),
            api_key,
            client: Client::new(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("OPENROUTER_API_KEY must be set to use the live backend")
            })?;
        Ok(Self::new(api_key))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(Value, u16), BackendFailure> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(url)
            .header("HTTP-Referer", "https://github.com/arbiter-run/arbiter")
            .header("X-Title", "Arbiter")
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                BackendFailure::new(FailureCode::Network, format!("request failed: {err}"), true)
            })?;

        let status = response.status();
        let value: Value = response.json().await.map_err(|err| {
            BackendFailure::new(
                FailureCode::BadResponse,
                format!("response was not JSON: {err}"),
                status.is_server_error(),
            )
        })?;
        Ok((value, status.as_u16()))
    }
}

#[async_trait]
impl Backend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn chat(&self, request: ChatRequest) -> Result<CallSuccess, BackendFailure> {
        let wire_messages = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        let mut body = json!({
            "model": request.model,
            "messages": wire_messages,
            "stream": false,
        });
        for (key, value) in &request.params {
            body[key.as_str()] = json!(value);
        }

        let retry = request.options.retry.clone();
        let signal = request.options.signal.clone();
        let started = Instant::now();

        let (outcome, retry_count) = with_retries(&retry, &signal, |_| {
            let body = body.clone();
            async move {
                let attempt_started = Instant::now();
                let (value, status) = self.post_json("/chat/completions", &body).await?;
                classify_response(&value, status)?;

                let content = extract_chat_text(&value).ok_or_else(|| {
                    BackendFailure::new(
                        FailureCode::BadResponse,
                        "response carried no completion content",
                        false,
                    )
                })?;
                let actual_model = value
                    .get("model")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                Ok((
                    content,
                    actual_model,
                    extract_usage(&value),
                    value,
                    attempt_started.elapsed().as_millis() as u64,
                ))
            }
        })
        .await
        .map_err(|mut failure| {
            failure.latency_ms = Some(started.elapsed().as_millis() as u64);
            failure
        })?;

        let (content, actual_model, usage, response_body, latency_ms) = outcome;
        Ok(CallSuccess {
            actual_model,
            content,
            request_payload: body,
            response_body,
            usage,
            latency_ms,
            retry_count,
        })
    }

    async fn embed(&self, request: EmbedRequest) -> Result<EmbedSuccess, BackendFailure> {
        let body = json!({
            "model": request.model,
            "input": request.text,
        });
        let retry = request.options.retry.clone();
        let signal = request.options.signal.clone();

        let (success, _retries) = with_retries(&retry, &signal, |_| {
            let body = body.clone();
            async move {
                let (value, status) = self.post_json("/embeddings", &body).await?;
                classify_response(&value, status)?;

                let raw = value
                    .get("data")
                    .and_then(|v| v.get(0))
                    .and_then(|v| v.get("embedding"))
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        BackendFailure::new(
                            FailureCode::BadResponse,
                            "response carried no embedding vector",
                            false,
                        )
                    })?;
                let vector = raw
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Option<Vec<f32>>>()
                    .ok_or_else(|| {
                        BackendFailure::new(
                            FailureCode::BadResponse,
                            "embedding vector held non-numeric values",
                            false,
                        )
                    })?;
                let model = value
                    .get("model")
                    .and_then(|v| v.as_str())
                    .or_else(|| body.get("model").and_then(|v| v.as_str()))
                    .unwrap_or_default()
                    .to_string();
                let generation_id = value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                Ok(EmbedSuccess {
                    vector,
                    model,
                    generation_id,
                })
            }
        })
        .await?;

        Ok(success)
    }
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

/// Map an OpenRouter response to a failure when it is not a success payload.
fn classify_response(value: &Value, status: u16) -> Result<(), BackendFailure> {
    let detail = extract_error_message(value);
    if status == 404 || detail.as_deref().is_some_and(is_model_unavailable_text) {
        return Err(BackendFailure::new(
            FailureCode::ModelUnavailable,
            detail.unwrap_or_else(|| format!("model not available (status {status})")),
            false,
        ));
    }
    if status == 429 || status >= 500 {
        return Err(BackendFailure::new(
            FailureCode::Http,
            detail.unwrap_or_else(|| format!("provider request failed with status {status}")),
            true,
        ));
    }
    if status >= 400 {
        return Err(BackendFailure::new(
            FailureCode::Http,
            detail.unwrap_or_else(|| format!("provider request failed with status {status}")),
            false,
        ));
    }
    if let Some(detail) = detail {
        return Err(BackendFailure::new(FailureCode::Http, detail, false));
    }
    Ok(())
}

fn is_model_unavailable_text(detail: &str) -> bool {
    let lowered = detail.to_ascii_lowercase();
    lowered.contains("model not found")
        || lowered.contains("no such model")
        || lowered.contains("is not available")
}

fn extract_error_message(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_chat_text(value: &Value) -> Option<String> {
    let content = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
            (!out.is_empty()).then_some(out)
        }
        _ => None,
    }
}

fn extract_usage(value: &Value) -> Option<UsageTotals> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    let cost = usage.get("cost").and_then(|v| v.as_f64());
    Some(UsageTotals {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization_appends_v1_once() {
        assert_eq!(
            normalize_base("https://openrouter.ai/api/v1/"),
            "https://openrouter.ai/api/v1"
        );
        assert_eq!(
            normalize_base("https://example.com/api"),
            "https://example.com/api/v1"
        );
    }

    #[test]
    fn missing_model_maps_to_model_unavailable() {
        let body = json!({"error": {"message": "Model not found: openai/nonexistent"}});
        let err = classify_response(&body, 404).unwrap_err();
        assert_eq!(err.code, FailureCode::ModelUnavailable);
        assert!(err.model_unavailable);
        assert!(!err.retryable);
    }

    #[test]
    fn rate_limit_is_retryable() {
        let body = json!({"error": {"message": "rate limited"}});
        let err = classify_response(&body, 429).unwrap_err();
        assert!(err.retryable);
    }

    #[test]
    fn chat_text_extraction_handles_parts() {
        let body = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "first "},
                {"type": "text", "text": "second"}
            ]}}]
        });
        assert_eq!(extract_chat_text(&body).unwrap(), "first second");
    }

    #[test]
    fn usage_totals_fall_back_to_sum() {
        let body = json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}});
        let usage = extract_usage(&body).unwrap();
        assert_eq!(usage.total_tokens, 10);
        assert_eq!(usage.cost, None);
    }
}
