use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use arbiter_types::{
    AssignedConfig, DecodeSetting, PlanEntry, ProtocolType, ResolvedConfig, RoleAssignment,
    SeedValue,
};

use crate::canonical::canonical_sha256_of;

/// Deterministic ordered list of trials plus the hash of its canonical
/// encoding. Same seed and config always yield a byte-identical plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("weighted list `{0}` has no positive weights")]
    DegenerateWeights(&'static str),
    #[error("decode range for `{key}` is inverted: min {min} > max {max}")]
    InvertedRange { key: String, min: f64, max: f64 },
    #[error("debate_v1 requires at least 2 participants, got {0}")]
    TooFewParticipants(u32),
    #[error("plan encoding failed: {0}")]
    Encoding(String),
}

/// Derive one of the per-trial random streams. Pure: the stream is a function
/// of (seed, label, index) alone.
pub fn rng_stream(seed: &SeedValue, label: &str, index: u32) -> ChaCha8Rng {
    let mut hasher = Sha256::new();
    hasher.update(seed.stream_key().as_bytes());
    hasher.update([0u8]);
    hasher.update(label.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    ChaCha8Rng::from_seed(hasher.finalize().into())
}

/// Materialize the full trial plan for a resolved config.
pub fn build_plan(config: &ResolvedConfig) -> Result<Plan, PlanError> {
    preflight(config)?;

    let seed = &config.run.seed;
    let mut entries = Vec::with_capacity(config.execution.k_max as usize);

    for trial_id in 0..config.execution.k_max {
        let mut plan_rng = rng_stream(seed, "plan", trial_id);
        let mut decode_rng = rng_stream(seed, "decode", trial_id);

        let model = pick_weighted(&mut plan_rng, &config.sampling.models, |m| m.weight, "models")?;
        let persona = pick_weighted(
            &mut plan_rng,
            &config.sampling.personas,
            |p| p.weight,
            "personas",
        )?;
        let prompt = pick_weighted(
            &mut plan_rng,
            &config.sampling.protocols,
            |p| p.weight,
            "protocols",
        )?;

        let decode = sample_decode(&config.sampling.decode, &mut decode_rng)?;

        let role_assignments = match config.protocol.protocol_type {
            ProtocolType::Independent => None,
            ProtocolType::DebateV1 => {
                let participants = config.protocol.participants.unwrap_or(2);
                let mut slots = BTreeMap::new();
                // Slot A is the proposer/final answerer and carries the
                // trial's primary assignment; remaining slots re-sample.
                slots.insert(
                    slot_name(0),
                    RoleAssignment {
                        model_slug: model.slug.clone(),
                        persona_id: persona.id.clone(),
                        decode: decode.clone(),
                    },
                );
                for slot_index in 1..participants {
                    let slot_model = pick_weighted(
                        &mut plan_rng,
                        &config.sampling.models,
                        |m| m.weight,
                        "models",
                    )?;
                    let slot_persona = pick_weighted(
                        &mut plan_rng,
                        &config.sampling.personas,
                        |p| p.weight,
                        "personas",
                    )?;
                    let slot_decode = sample_decode(&config.sampling.decode, &mut decode_rng)?;
                    slots.insert(
                        slot_name(slot_index),
                        RoleAssignment {
                            model_slug: slot_model.slug.clone(),
                            persona_id: slot_persona.id.clone(),
                            decode: slot_decode,
                        },
                    );
                }
                Some(slots)
            }
        };

        entries.push(PlanEntry {
            trial_id,
            protocol: config.protocol.protocol_type,
            assigned_config: AssignedConfig {
                model_slug: model.slug.clone(),
                persona_id: persona.id.clone(),
                protocol_prompt_id: prompt.id.clone(),
                decode,
            },
            role_assignments,
        });
    }

    let sha256 = canonical_sha256_of(&entries).map_err(|err| PlanError::Encoding(err.to_string()))?;
    Ok(Plan { entries, sha256 })
}

fn preflight(config: &ResolvedConfig) -> Result<(), PlanError> {
    if config.protocol.protocol_type == ProtocolType::DebateV1 {
        let participants = config.protocol.participants.unwrap_or(2);
        if participants < 2 {
            return Err(PlanError::TooFewParticipants(participants));
        }
    }
    for (key, setting) in &config.sampling.decode {
        if let DecodeSetting::Range { min, max } = setting {
            if min > max {
                return Err(PlanError::InvertedRange {
                    key: key.clone(),
                    min: *min,
                    max: *max,
                });
            }
        }
    }
    Ok(())
}

/// Weighted pick over cumulative thresholds: the first element whose
/// cumulative weight reaches the target wins. Zero and negative weights are
/// skipped, so reordering them never changes the outcome.
fn pick_weighted<'a, T>(
    rng: &mut ChaCha8Rng,
    items: &'a [T],
    weight_of: impl Fn(&T) -> f64,
    list_name: &'static str,
) -> Result<&'a T, PlanError> {
    let total: f64 = items
        .iter()
        .map(&weight_of)
        .filter(|w| *w > 0.0)
        .sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(PlanError::DegenerateWeights(list_name));
    }

    let target = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    let mut last_positive = None;
    for item in items {
        let weight = weight_of(item);
        if weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = Some(item);
        if cumulative >= target {
            return Ok(item);
        }
    }
    // Floating-point shortfall: the final positive item absorbs the tail.
    last_positive.ok_or(PlanError::DegenerateWeights(list_name))
}

fn sample_decode(
    settings: &BTreeMap<String, DecodeSetting>,
    rng: &mut ChaCha8Rng,
) -> Result<BTreeMap<String, f64>, PlanError> {
    let mut decode = BTreeMap::new();
    for (key, setting) in settings {
        let value = match setting {
            DecodeSetting::Scalar(value) => *value,
            DecodeSetting::Range { min, max } => min + rng.gen::<f64>() * (max - min),
        };
        decode.insert(key.clone(), value);
    }
    Ok(decode)
}

/// Alphabetic slot names: A, B, ..., Z, AA, AB, ...
pub fn slot_name(index: u32) -> String {
    let mut name = String::new();
    let mut value = index;
    loop {
        name.insert(0, (b'A' + (value % 26) as u8) as char);
        if value < 26 {
            break;
        }
        value = value / 26 - 1;
    }
    name
}
