//! The structured generation contract
//!
//! Generator responses are a strict JSON envelope; an optional surrounding
//! markdown fence is tolerated and nothing else. When the envelope does not
//! parse, the whole response is demoted to raw code and the artifact is
//! marked `parse_fallback` so the trajectory shows what happened.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A generator response that failed to parse as its envelope
#[derive(Debug, Error)]
#[error("Response is not a valid envelope: {detail}")]
pub struct ContractError {
    pub detail: String,
}

/// Parsed `{code, description, tags}` generation envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationEnvelope {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// True when the response was not an envelope and was demoted to raw code
    #[serde(default, skip_serializing, skip_deserializing)]
    pub parse_fallback: bool,
}

/// Parsed `{code, fixes_applied, analysis}` escalation envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEnvelope {
    pub code: String,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
    #[serde(default)]
    pub analysis: String,
}

/// Remove one surrounding markdown fence, with or without a language tag
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed.to_string();
    };

    // Drop the language tag on the opening line, if any
    match body.split_once('\n') {
        Some((first, remainder)) if !first.trim().contains(char::is_whitespace) => remainder.trim_end().to_string(),
        _ => body.trim().to_string(),
    }
}

/// Parse text as a single JSON object, tolerating one outer fence
pub fn parse_json_object(text: &str) -> Result<serde_json::Value, ContractError> {
    let unfenced = strip_code_fences(text);
    let value: serde_json::Value = serde_json::from_str(unfenced.trim()).map_err(|e| ContractError {
        detail: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(ContractError {
            detail: "top-level JSON is not an object".to_string(),
        });
    }
    Ok(value)
}

/// Parse a generation response, falling back to raw code on envelope failure
pub fn parse_generation(text: &str) -> GenerationEnvelope {
    if let Ok(value) = parse_json_object(text)
        && value.get("code").is_some_and(|c| c.is_string())
        && let Ok(mut envelope) = serde_json::from_value::<GenerationEnvelope>(value)
    {
        envelope.code = strip_code_fences(&envelope.code);
        envelope.parse_fallback = false;
        return envelope;
    }

    GenerationEnvelope {
        code: strip_code_fences(text),
        description: String::new(),
        tags: Vec::new(),
        parse_fallback: true,
    }
}

/// Parse an escalation response strictly; a failure is an attempt failure
pub fn parse_repair(text: &str) -> Result<RepairEnvelope, ContractError> {
    let value = parse_json_object(text)?;
    if !value.get("code").is_some_and(|c| c.is_string()) {
        return Err(ContractError {
            detail: "envelope is missing a string 'code' field".to_string(),
        });
    }
    let mut envelope: RepairEnvelope = serde_json::from_value(value).map_err(|e| ContractError {
        detail: e.to_string(),
    })?;
    envelope.code = strip_code_fences(&envelope.code);
    Ok(envelope)
}
