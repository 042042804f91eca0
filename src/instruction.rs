use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

// ========================= Types =========================

/// Next action requested by the decision service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    Click { x: f64, y: f64, radius: f64 },
    Wait { seconds: f64 },
    End,
}

impl Instruction {
    pub fn click(x: f64, y: f64, radius: f64) -> Self {
        Instruction::Click { x, y, radius }
    }

    pub fn wait(seconds: f64) -> Self {
        Instruction::Wait { seconds }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Click { .. } => "click",
            Instruction::Wait { .. } => "wait",
            Instruction::End => "end",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Click { x, y, radius } => write!(f, "click({x}, {y}, r={radius})"),
            Instruction::Wait { seconds } => write!(f, "wait({seconds}s)"),
            Instruction::End => f.write_str("end"),
        }
    }
}

/// Body returned by the decision endpoint, kept verbatim until parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse(pub String);

impl RawResponse {
    pub fn parse(&self) -> Parsed {
        parse_response(&self.0)
    }
}

/// Something the parser had to paper over. Never fatal.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseFallback {
    MissingField { key: &'static str },
    MalformedField { key: &'static str, raw: String },
    /// A comma-separated segment with no `key:value` shape.
    StraySegment { raw: String },
    MissingKind,
    UnknownKind { raw: String },
}

impl fmt::Display for ParseFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFallback::MissingField { key } => write!(f, "missing `{key}`, using 0.0"),
            ParseFallback::MalformedField { key, raw } => {
                write!(f, "malformed `{key}` = {raw:?}, using 0.0")
            }
            ParseFallback::StraySegment { raw } => write!(f, "ignored segment {raw:?}"),
            ParseFallback::MissingKind => f.write_str("missing `action_type`, treating as end"),
            ParseFallback::UnknownKind { raw } => {
                write!(f, "unknown action_type {raw:?}, treating as end")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parsed {
    pub instruction: Instruction,
    pub fallbacks: Vec<ParseFallback>,
}

// ========================= Parser =========================

const KIND_KEY: &str = "action_type";
const RADIUS_ALIAS: &str = "radius";

/// Parse the flat `key:value, key:value` body the decision service answers with.
///
/// Braces and double quotes are stripped first, so a one-level JSON object
/// (`{"action_type": "click", "x": 12}`) reads the same as the bare form.
/// Numeric fields that are absent or unparseable become `0.0`; an absent or
/// unrecognized `action_type` becomes [`Instruction::End`].
pub fn parse_response(body: &str) -> Parsed {
    let mut fallbacks = Vec::new();
    let pairs = split_pairs(body, &mut fallbacks);

    let instruction = match pairs.get(KIND_KEY).map(|k| k.to_ascii_lowercase()) {
        Some(kind) if kind == "click" => Instruction::Click {
            x: number(&pairs, "x", &mut fallbacks),
            y: number(&pairs, "y", &mut fallbacks),
            radius: radius(&pairs, &mut fallbacks),
        },
        Some(kind) if kind == "wait" => Instruction::Wait {
            seconds: number(&pairs, "seconds", &mut fallbacks),
        },
        Some(kind) if kind == "end" => Instruction::End,
        Some(kind) => {
            fallbacks.push(ParseFallback::UnknownKind { raw: kind });
            Instruction::End
        }
        None => {
            fallbacks.push(ParseFallback::MissingKind);
            Instruction::End
        }
    };

    for fb in &fallbacks {
        warn!(instruction = %instruction, "decision response: {}", fb);
    }
    Parsed { instruction, fallbacks }
}

fn split_pairs(body: &str, fallbacks: &mut Vec<ParseFallback>) -> HashMap<String, String> {
    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, '{' | '}' | '"'))
        .collect();

    let mut pairs = HashMap::new();
    for segment in cleaned.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match segment.split_once(':') {
            Some((k, v)) if !k.trim().is_empty() => {
                // later duplicates win
                pairs.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => fallbacks.push(ParseFallback::StraySegment { raw: segment.to_string() }),
        }
    }
    pairs
}

fn number(
    pairs: &HashMap<String, String>,
    key: &'static str,
    fallbacks: &mut Vec<ParseFallback>,
) -> f64 {
    match pairs.get(key) {
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                fallbacks.push(ParseFallback::MalformedField { key, raw: raw.clone() });
                0.0
            }
        },
        None => {
            fallbacks.push(ParseFallback::MissingField { key });
            0.0
        }
    }
}

/// The service spells it `radiu`; `radius` is accepted when `radiu` is absent.
fn radius(pairs: &HashMap<String, String>, fallbacks: &mut Vec<ParseFallback>) -> f64 {
    if !pairs.contains_key("radiu") && pairs.contains_key(RADIUS_ALIAS) {
        return number(pairs, RADIUS_ALIAS, fallbacks);
    }
    number(pairs, "radiu", fallbacks)
}
