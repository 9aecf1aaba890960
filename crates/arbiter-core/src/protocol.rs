use serde_json::json;

use arbiter_types::{DecisionContract, ProtocolPrompts, ResolvedConfig, TranscriptTurn};

use crate::canonical::canonical_sha256;

pub const DEFAULT_INDEPENDENT_SYSTEM: &str =
    "Answer the user's question directly and concisely, committing to a single answer.";

pub const DEFAULT_PROPOSER_SYSTEM: &str = "You are the proposer in a structured debate. State \
     your answer to the question and defend it with your strongest reasoning.";

pub const DEFAULT_CRITIC_SYSTEM: &str = "You are a critic in a structured debate. Challenge the \
     positions taken so far: find weaknesses, counterexamples, and overlooked alternatives.";

pub const DEFAULT_PROPOSER_FINAL_SYSTEM: &str = "You are the proposer closing a structured \
     debate. Weigh the full discussion and give your final answer to the question.";

/// Default decision-contract clause. A configured contract may override it
/// with its own exact text; either way the effective text is hashed into the
/// prompt manifest.
pub const DEFAULT_CONTRACT_CLAUSE: &str = "Respond with a single JSON object of the form \
     {\"outcome\": string, \"rationale\": string, \"confidence\": number between 0 and 1}. \
     Output the JSON object and nothing else.";

/// Effective protocol prompts after defaulting.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    pub proposer_system: String,
    pub critic_system: String,
    pub proposer_final_system: String,
}

impl PromptSet {
    pub fn from_config(prompts: Option<&ProtocolPrompts>) -> Self {
        let pick = |configured: Option<&String>, default: &str| {
            configured
                .map(|s| s.as_str())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            system: pick(
                prompts.and_then(|p| p.system.as_ref()),
                DEFAULT_INDEPENDENT_SYSTEM,
            ),
            proposer_system: pick(
                prompts.and_then(|p| p.proposer_system.as_ref()),
                DEFAULT_PROPOSER_SYSTEM,
            ),
            critic_system: pick(
                prompts.and_then(|p| p.critic_system.as_ref()),
                DEFAULT_CRITIC_SYSTEM,
            ),
            proposer_final_system: pick(
                prompts.and_then(|p| p.proposer_final_system.as_ref()),
                DEFAULT_PROPOSER_FINAL_SYSTEM,
            ),
        }
    }
}

/// Persona text for a persona id, falling back to a neutral framing.
pub fn persona_prompt(config: &ResolvedConfig, persona_id: &str) -> String {
    config
        .sampling
        .personas
        .iter()
        .find(|p| p.id == persona_id)
        .and_then(|p| p.prompt.clone())
        .unwrap_or_else(|| format!("You answer as the persona `{persona_id}`."))
}

/// Persona first, separator, then the protocol system prompt.
pub fn compose_system(persona: &str, system: &str) -> String {
    format!("{persona}\n\n{system}")
}

pub fn contract_clause(contract: &DecisionContract) -> &str {
    contract
        .clause
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(DEFAULT_CONTRACT_CLAUSE)
}

/// Render prior turns as `Turn t [slot]: content` lines.
pub fn transcript_block(transcript: &[TranscriptTurn]) -> String {
    transcript
        .iter()
        .map(|t| format!("Turn {} [{}]: {}", t.turn, t.slot, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content hash over every prompt text that can reach a model, including the
/// effective decision-contract clause.
pub fn prompt_manifest_sha256(config: &ResolvedConfig) -> String {
    let prompts = PromptSet::from_config(config.protocol.prompts.as_ref());
    let clause = config
        .protocol
        .decision_contract
        .as_ref()
        .map(contract_clause);
    let personas: Vec<_> = config
        .sampling
        .personas
        .iter()
        .map(|p| json!({"id": p.id, "prompt": persona_prompt(config, &p.id)}))
        .collect();
    canonical_sha256(&json!({
        "system": prompts.system,
        "proposer_system": prompts.proposer_system,
        "critic_system": prompts.critic_system,
        "proposer_final_system": prompts.proposer_final_system,
        "decision_contract_clause": clause,
        "personas": personas,
        "question": config.question.text,
    }))
}
