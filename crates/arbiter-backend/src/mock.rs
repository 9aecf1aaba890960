use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};

use arbiter_types::UsageTotals;

use crate::{
    Backend, BackendFailure, CallSuccess, ChatRequest, EmbedRequest, EmbedSuccess, FailureCode,
};

/// Environment toggle that makes every mock reply whitespace-only, which
/// normalizes to an empty embed text downstream.
pub const MOCK_EMPTY_EMBED_ENV: &str = "ARBITER_MOCK_EMPTY_EMBED";

const MOCK_DIMENSIONS: usize = 16;

const REPLY_TEMPLATES: [&str; 6] = [
    "After weighing the trade-offs, the strongest answer is",
    "On balance the evidence points to",
    "The most defensible position here is",
    "Considering the constraints, I would choose",
    "The clearest resolution is",
    "Taking the question at face value, the answer is",
];

/// Deterministic in-process backend. Replies and embeddings are pure
/// functions of the request, so identical plans produce identical runs.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    fixed_reply: Option<String>,
    fixed_vector: Option<Vec<f32>>,
    unavailable_models: HashSet<String>,
    embed_failure: Option<String>,
    latency: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chat call answers with exactly this text.
    pub fn with_fixed_reply(mut self, reply: impl Into<String>) -> Self {
        self.fixed_reply = Some(reply.into());
        self
    }

    /// Every embed call returns exactly this vector.
    pub fn with_fixed_vector(mut self, vector: Vec<f32>) -> Self {
        self.fixed_vector = Some(vector);
        self
    }

    /// Chat calls for this model fail with `model_unavailable`.
    pub fn with_unavailable_model(mut self, slug: impl Into<String>) -> Self {
        self.unavailable_models.insert(slug.into());
        self
    }

    /// Every embed call fails with the given message.
    pub fn with_embed_failure(mut self, message: impl Into<String>) -> Self {
        self.embed_failure = Some(message.into());
        self
    }

    /// Simulated per-call latency, cancellable through the request signal.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn simulate_latency(&self, request_signal: &tokio_util::sync::CancellationToken) -> Result<(), BackendFailure> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {}
                _ = request_signal.cancelled() => return Err(BackendFailure::cancelled()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, request: ChatRequest) -> Result<CallSuccess, BackendFailure> {
        if request.options.signal.is_cancelled() {
            return Err(BackendFailure::cancelled());
        }
        self.simulate_latency(&request.options.signal).await?;

        if self.unavailable_models.contains(&request.model) {
            return Err(BackendFailure::new(
                FailureCode::ModelUnavailable,
                format!("mock model `{}` is not available", request.model),
                false,
            ));
        }

        let digest = chat_digest(&request);
        let content = if std::env::var(MOCK_EMPTY_EMBED_ENV).is_ok() {
            "   ".to_string()
        } else if let Some(reply) = &self.fixed_reply {
            reply.clone()
        } else if wants_contract_json(&request) {
            json!({
                "outcome": format!("option-{}", &digest[..6]),
                "rationale": format!("mock rationale {}", &digest[..10]),
                "confidence": confidence_from_digest(&digest),
            })
            .to_string()
        } else {
            let template = REPLY_TEMPLATES[template_index(&digest)];
            format!("{template} option-{}.", &digest[..6])
        };

        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        let request_payload = json!({
            "model": request.model,
            "messages": request
                .messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "params": request.params,
        });

        Ok(CallSuccess {
            actual_model: Some(format!("mock/{}", request.model)),
            content: content.clone(),
            request_payload,
            response_body: json!({
                "id": format!("mockchat-{}", &digest[..8]),
                "choices": [{"message": {"role": "assistant", "content": content}}],
            }),
            usage: Some(UsageTotals {
                prompt_tokens: (prompt_chars as u64).div_ceil(4),
                completion_tokens: (content.len() as u64).div_ceil(4),
                total_tokens: (prompt_chars as u64).div_ceil(4) + (content.len() as u64).div_ceil(4),
                cost: None,
            }),
            latency_ms: self.latency.map(|l| l.as_millis() as u64).unwrap_or(0),
            retry_count: 0,
        })
    }

    async fn embed(&self, request: EmbedRequest) -> Result<EmbedSuccess, BackendFailure> {
        if request.options.signal.is_cancelled() {
            return Err(BackendFailure::cancelled());
        }
        self.simulate_latency(&request.options.signal).await?;

        if let Some(message) = &self.embed_failure {
            return Err(BackendFailure::new(
                FailureCode::Http,
                message.clone(),
                false,
            ));
        }

        let digest = hex_digest(request.text.as_bytes());
        let vector = match &self.fixed_vector {
            Some(vector) => vector.clone(),
            None => vector_from_text(&request.text),
        };

        Ok(EmbedSuccess {
            vector,
            model: request.model,
            generation_id: Some(format!("mockgen-{}", &digest[..8])),
        })
    }
}

fn chat_digest(request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    for message in &request.messages {
        hasher.update([0x1f]);
        hasher.update(message.role.as_bytes());
        hasher.update([0x1f]);
        hasher.update(message.content.as_bytes());
    }
    for (key, value) in &request.params {
        hasher.update([0x1f]);
        hasher.update(key.as_bytes());
        hasher.update(value.to_le_bytes());
    }
    hex::encode_lower(hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    hex::encode_lower(Sha256::digest(bytes))
}

// Tiny local hex encoder so the mock does not grow a dependency.
mod hex {
    pub fn encode_lower(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    }
}

fn template_index(digest: &str) -> usize {
    digest
        .bytes()
        .next()
        .map(|b| b as usize % REPLY_TEMPLATES.len())
        .unwrap_or(0)
}

fn confidence_from_digest(digest: &str) -> f64 {
    let byte = u8::from_str_radix(&digest[..2], 16).unwrap_or(0);
    0.5 + (byte as f64) / 512.0
}

fn wants_contract_json(request: &ChatRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.role == "system" && m.content.contains("\"outcome\""))
}

/// Unit-length vector derived from the SHA-256 of the text. Stable across
/// processes, with enough spread that distinct texts land in distinct
/// directions.
fn vector_from_text(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut vector: Vec<f32> = digest
        .iter()
        .take(MOCK_DIMENSIONS)
        .map(|b| (*b as f32) / 255.0 - 0.5)
        .collect();
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    } else {
        vector[0] = 1.0;
    }
    vector
}
