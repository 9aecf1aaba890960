use serde_json::{json, Value};

use crate::SchemaKind;

const SHA256_HEX: &str = "^[0-9a-f]{64}$";

pub(crate) fn schema_for(kind: SchemaKind) -> Value {
    match kind {
        SchemaKind::ResolvedConfig => resolved_config(),
        SchemaKind::PlanEntry => plan_entry(),
        SchemaKind::TrialRecord => trial_record(),
        SchemaKind::ParsedOutput => parsed_output(),
        SchemaKind::EmbeddingRecord => embedding_record(),
        SchemaKind::ClusterAssignment => cluster_assignment(),
        SchemaKind::MonitoringRecord => monitoring_record(),
        SchemaKind::ClustersState => clusters_state(),
        SchemaKind::Aggregates => aggregates(),
        SchemaKind::EmbeddingsProvenance => embeddings_provenance(),
        SchemaKind::Manifest => manifest(),
    }
}

fn weighted_item(id_key: &str) -> Value {
    json!({
        "type": "object",
        "required": [id_key, "weight"],
        "properties": {
            (id_key): {"type": "string", "minLength": 1},
            "weight": {"type": "number"}
        }
    })
}

fn resolved_config() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["run", "question", "sampling", "protocol", "execution", "measurement", "output"],
        "properties": {
            "run": {
                "type": "object",
                "required": ["seed"],
                "properties": {"seed": {"type": ["integer", "string"]}}
            },
            "question": {
                "type": "object",
                "required": ["text"],
                "properties": {"text": {"type": "string", "minLength": 1}}
            },
            "sampling": {
                "type": "object",
                "required": ["models", "personas", "protocols"],
                "properties": {
                    "models": {"type": "array", "minItems": 1, "items": weighted_item("slug")},
                    "personas": {"type": "array", "minItems": 1, "items": weighted_item("id")},
                    "protocols": {"type": "array", "minItems": 1, "items": weighted_item("id")},
                    "decode": {
                        "type": "object",
                        "additionalProperties": {
                            "oneOf": [
                                {"type": "number"},
                                {
                                    "type": "object",
                                    "required": ["min", "max"],
                                    "properties": {
                                        "min": {"type": "number"},
                                        "max": {"type": "number"}
                                    }
                                }
                            ]
                        }
                    }
                }
            },
            "protocol": {
                "type": "object",
                "required": ["type", "timeouts"],
                "properties": {
                    "type": {"enum": ["independent", "debate_v1"]},
                    "participants": {"type": "integer", "minimum": 2},
                    "rounds": {"type": "integer", "minimum": 1},
                    "timeouts": {
                        "type": "object",
                        "required": ["total_trial_ms", "per_call_ms"],
                        "properties": {
                            "total_trial_ms": {"type": "integer", "minimum": 1},
                            "per_call_ms": {"type": "integer", "minimum": 1},
                            "per_call_max_retries": {"type": "integer", "minimum": 0}
                        }
                    },
                    "decision_contract": {
                        "type": "object",
                        "properties": {
                            "policy": {"enum": ["warn", "exclude", "fail"]},
                            "clause": {"type": "string"}
                        }
                    }
                }
            },
            "execution": {
                "type": "object",
                "required": ["k_max", "batch_size", "workers", "stop_mode", "stop_policy", "retry_policy"],
                "properties": {
                    "k_max": {"type": "integer", "minimum": 0},
                    "k_min": {"type": "integer", "minimum": 0},
                    "batch_size": {"type": "integer", "minimum": 1},
                    "workers": {"type": "integer", "minimum": 1},
                    "stop_mode": {"enum": ["advisor", "enforcer", "disabled", "resolve_only"]},
                    "stop_policy": {
                        "type": "object",
                        "required": ["novelty_epsilon", "similarity_threshold", "patience"],
                        "properties": {
                            "novelty_epsilon": {"type": "number", "minimum": 0.0},
                            "similarity_threshold": {"type": "number"},
                            "patience": {"type": "integer", "minimum": 1}
                        }
                    },
                    "retry_policy": {
                        "type": "object",
                        "required": ["max_retries", "backoff_ms"],
                        "properties": {
                            "max_retries": {"type": "integer", "minimum": 0},
                            "backoff_ms": {"type": "integer", "minimum": 0}
                        }
                    },
                    "grace_window_ms": {"type": "integer", "minimum": 0}
                }
            },
            "measurement": {
                "type": "object",
                "required": ["embedding_model", "embed_text_strategy", "embedding_max_chars", "novelty_threshold", "clustering"],
                "properties": {
                    "embedding_model": {"type": "string", "minLength": 1},
                    "embed_text_strategy": {"enum": ["outcome_only", "full_text"]},
                    "embedding_max_chars": {"type": "integer", "minimum": 1},
                    "novelty_threshold": {"type": "number"},
                    "clustering": {
                        "type": "object",
                        "required": ["enabled", "tau", "centroid_update_rule"],
                        "properties": {
                            "enabled": {"type": "boolean"},
                            "tau": {"type": "number", "exclusiveMinimum": 0.0, "maximum": 1.0},
                            "centroid_update_rule": {
                                "type": "object",
                                "required": ["rule"],
                                "properties": {
                                    "rule": {"enum": ["running_mean", "ema"]},
                                    "alpha": {"type": "number", "exclusiveMinimum": 0.0, "maximum": 1.0}
                                }
                            },
                            "cluster_limit": {"type": "integer", "minimum": 1}
                        }
                    }
                }
            },
            "output": {
                "type": "object",
                "required": ["runs_dir"],
                "properties": {
                    "runs_dir": {"type": "string", "minLength": 1},
                    "debug_enabled": {"type": "boolean"},
                    "validate_artifacts": {"type": "boolean"}
                }
            }
        }
    })
}

fn assigned_config() -> Value {
    json!({
        "type": "object",
        "required": ["model_slug", "persona_id", "protocol_prompt_id", "decode"],
        "properties": {
            "model_slug": {"type": "string", "minLength": 1},
            "persona_id": {"type": "string", "minLength": 1},
            "protocol_prompt_id": {"type": "string", "minLength": 1},
            "decode": {"type": "object", "additionalProperties": {"type": "number"}}
        }
    })
}

fn role_assignments() -> Value {
    json!({
        "type": "object",
        "additionalProperties": {
            "type": "object",
            "required": ["model_slug", "persona_id", "decode"],
            "properties": {
                "model_slug": {"type": "string", "minLength": 1},
                "persona_id": {"type": "string", "minLength": 1},
                "decode": {"type": "object", "additionalProperties": {"type": "number"}}
            }
        }
    })
}

fn plan_entry() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["trial_id", "protocol", "assigned_config"],
        "properties": {
            "trial_id": {"type": "integer", "minimum": 0},
            "protocol": {"enum": ["independent", "debate_v1"]},
            "assigned_config": assigned_config(),
            "role_assignments": role_assignments()
        }
    })
}

fn usage_totals() -> Value {
    json!({
        "type": "object",
        "required": ["prompt_tokens", "completion_tokens", "total_tokens"],
        "properties": {
            "prompt_tokens": {"type": "integer", "minimum": 0},
            "completion_tokens": {"type": "integer", "minimum": 0},
            "total_tokens": {"type": "integer", "minimum": 0},
            "cost": {"type": "number", "minimum": 0.0}
        }
    })
}

fn trial_record() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["trial_id", "requested_model_slug", "protocol", "status",
                     "assigned_config", "calls", "transcript", "embedding_summary"],
        "properties": {
            "trial_id": {"type": "integer", "minimum": 0},
            "requested_model_slug": {"type": "string", "minLength": 1},
            "actual_model": {"type": "string"},
            "protocol": {"enum": ["independent", "debate_v1"]},
            "status": {"enum": ["success", "error", "model_unavailable", "timeout_exhausted", "shutdown_abort"]},
            "assigned_config": assigned_config(),
            "role_assignments": role_assignments(),
            "calls": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["turn", "purpose", "model_slug", "ok", "latency_ms", "retry_count"],
                    "properties": {
                        "turn": {"type": "integer", "minimum": 0},
                        "round": {"type": "integer", "minimum": 1},
                        "slot": {"type": "string"},
                        "purpose": {"enum": ["single", "debate_turn", "final"]},
                        "model_slug": {"type": "string"},
                        "ok": {"type": "boolean"},
                        "latency_ms": {"type": "integer", "minimum": 0},
                        "retry_count": {"type": "integer", "minimum": 0},
                        "usage": usage_totals(),
                        "error": {"type": "string"}
                    }
                }
            },
            "transcript": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["turn", "round", "slot", "content"],
                    "properties": {
                        "turn": {"type": "integer", "minimum": 0},
                        "round": {"type": "integer", "minimum": 1},
                        "slot": {"type": "string"},
                        "content": {"type": "string"}
                    }
                }
            },
            "raw_assistant_text": {"type": "string"},
            "usage": usage_totals(),
            "error": {"type": "string"},
            "embedding_summary": {
                "type": "object",
                "required": ["status"],
                "properties": {
                    "status": {"enum": ["success", "skipped", "failed"]},
                    "skip_reason": {"enum": ["trial_not_success", "empty_embed_text", "contract_parse_excluded"]},
                    "generation_id": {"type": "string"}
                }
            }
        }
    })
}

fn parsed_output() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["trial_id", "parse_status", "parser_version"],
        "properties": {
            "trial_id": {"type": "integer", "minimum": 0},
            "parse_status": {"enum": ["success", "fallback", "failed"]},
            "outcome": {"type": "string"},
            "rationale": {"type": "string"},
            "raw_assistant_text": {"type": "string"},
            "embed_text": {"type": "string"},
            "extraction_method": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "parser_version": {"type": "string", "minLength": 1}
        }
    })
}

fn embedding_record() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["trial_id", "embedding_status", "dtype", "encoding", "embed_text_sha256"],
        "properties": {
            "trial_id": {"type": "integer", "minimum": 0},
            "embedding_status": {"enum": ["success", "skipped", "failed"]},
            "skip_reason": {"enum": ["trial_not_success", "empty_embed_text", "contract_parse_excluded"]},
            "vector_b64": {"type": "string", "minLength": 1},
            "dtype": {"const": "float32"},
            "encoding": {"const": "float32le_base64"},
            "dimensions": {"type": "integer", "minimum": 1},
            "embed_text_sha256": {"type": "string", "pattern": SHA256_HEX},
            "error": {"type": "string"}
        }
    })
}

fn cluster_assignment() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["trial_id", "cluster_id", "batch_number", "forced"],
        "properties": {
            "trial_id": {"type": "integer", "minimum": 0},
            "cluster_id": {"type": "integer", "minimum": 0},
            "batch_number": {"type": "integer", "minimum": 0},
            "forced": {"type": "boolean"}
        }
    })
}

fn stop_block() -> Value {
    json!({
        "type": "object",
        "required": ["mode", "would_stop", "should_stop"],
        "properties": {
            "mode": {"enum": ["advisor", "enforcer", "disabled", "resolve_only"]},
            "would_stop": {"type": "boolean"},
            "should_stop": {"type": "boolean"},
            "stop_reason": {"type": "string"}
        }
    })
}

fn cluster_metrics() -> Value {
    json!({
        "type": "object",
        "required": ["cluster_count", "new_clusters_this_batch", "largest_cluster_share",
                     "cluster_distribution", "entropy", "effective_cluster_count",
                     "singleton_count", "cluster_limit_hit",
                     "forced_assignments_this_batch", "forced_assignments_cumulative"],
        "properties": {
            "cluster_count": {"type": "integer", "minimum": 0},
            "new_clusters_this_batch": {"type": "integer", "minimum": 0},
            "largest_cluster_share": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "cluster_distribution": {"type": "array", "items": {"type": "integer", "minimum": 0}},
            "entropy": {"type": "number", "minimum": 0.0},
            "effective_cluster_count": {"type": "number", "minimum": 0.0},
            "singleton_count": {"type": "integer", "minimum": 0},
            "js_divergence": {"type": ["number", "null"]},
            "cluster_limit_hit": {"type": "boolean"},
            "forced_assignments_this_batch": {"type": "integer", "minimum": 0},
            "forced_assignments_cumulative": {"type": "integer", "minimum": 0}
        }
    })
}

fn monitoring_record() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["batch_number", "k_attempted", "k_eligible", "has_eligible_in_batch",
                     "novelty_rate", "mean_max_sim_to_prior", "recorded_at", "stop"],
        "properties": {
            "batch_number": {"type": "integer", "minimum": 0},
            "k_attempted": {"type": "integer", "minimum": 0},
            "k_eligible": {"type": "integer", "minimum": 0},
            "has_eligible_in_batch": {"type": "boolean"},
            "novelty_rate": {"type": ["number", "null"], "minimum": 0.0, "maximum": 1.0},
            "mean_max_sim_to_prior": {"type": ["number", "null"]},
            "recorded_at": {"type": "string"},
            "stop": stop_block(),
            "cluster_metrics": cluster_metrics()
        }
    })
}

fn clusters_state() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["cluster_count", "member_counts", "forced_cumulative", "updated_at"],
        "properties": {
            "cluster_count": {"type": "integer", "minimum": 0},
            "member_counts": {"type": "array", "items": {"type": "integer", "minimum": 0}},
            "forced_cumulative": {"type": "integer", "minimum": 0},
            "dimensions": {"type": "integer", "minimum": 1},
            "updated_at": {"type": "string"}
        }
    })
}

fn aggregates() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["batches", "k_attempted", "k_eligible", "novelty_rate",
                     "mean_max_sim_to_prior", "stop", "computed_at"],
        "properties": {
            "batches": {"type": "integer", "minimum": 0},
            "k_attempted": {"type": "integer", "minimum": 0},
            "k_eligible": {"type": "integer", "minimum": 0},
            "novelty_rate": {"type": ["number", "null"]},
            "mean_max_sim_to_prior": {"type": ["number", "null"]},
            "stop": stop_block(),
            "cluster_metrics": cluster_metrics(),
            "computed_at": {"type": "string"}
        }
    })
}

fn embeddings_provenance() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["status", "count", "finalized_at"],
        "properties": {
            "status": {"enum": ["arrow_generated", "jsonl_fallback", "not_generated"]},
            "reason": {"type": "string"},
            "embedding_model": {"type": "string"},
            "dimensions": {"type": "integer", "minimum": 1},
            "count": {"type": "integer", "minimum": 0},
            "path": {"type": "string"},
            "finalized_at": {"type": "string"}
        }
    })
}

fn manifest() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["schema_version", "arbiter_version", "run_id", "started_at",
                     "plan_sha256", "config_sha256", "hash_algorithm",
                     "k_planned", "k_attempted", "k_eligible", "incomplete",
                     "stop", "notes", "artifacts"],
        "properties": {
            "schema_version": {"const": "1.0.0"},
            "arbiter_version": {"type": "string", "minLength": 1},
            "run_id": {"type": "string", "minLength": 1},
            "started_at": {"type": "string"},
            "completed_at": {"type": "string"},
            "plan_sha256": {"type": "string", "pattern": SHA256_HEX},
            "config_sha256": {"type": "string", "pattern": SHA256_HEX},
            "hash_algorithm": {"const": "sha256"},
            "k_planned": {"type": "integer", "minimum": 0},
            "k_attempted": {"type": "integer", "minimum": 0},
            "k_eligible": {"type": "integer", "minimum": 0},
            "stop_reason": {"enum": ["completed", "k_max_reached", "converged", "user_interrupt", "error"]},
            "incomplete": {"type": "boolean"},
            "stop": {
                "type": "object",
                "required": ["stop_mode", "stop_policy", "novelty_threshold"],
                "properties": {
                    "stop_mode": {"enum": ["advisor", "enforcer", "disabled", "resolve_only"]},
                    "stop_policy": {
                        "type": "object",
                        "required": ["novelty_epsilon", "similarity_threshold", "patience"]
                    },
                    "novelty_threshold": {"type": "number"}
                }
            },
            "model_catalog_version": {"type": "string"},
            "model_catalog_sha256": {"type": "string"},
            "prompt_manifest_sha256": {"type": "string"},
            "usage": {
                "type": "object",
                "required": ["totals"],
                "properties": {
                    "totals": usage_totals(),
                    "per_model": {"type": "object", "additionalProperties": usage_totals()}
                }
            },
            "notes": {"type": "array", "items": {"type": "string"}},
            "artifacts": {"type": "array", "items": {"type": "string"}}
        }
    })
}
