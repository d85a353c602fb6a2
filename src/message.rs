use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Inbound shapes
// ---------------------------------------------------------------------------

/// One untrusted inbound chat message. Different chat widgets send wildly
/// different shapes for `content` (plain string, `{text}`, `{content}`,
/// arrays of parts, `{parts: [...]}`), so both fields stay raw JSON until
/// normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<Value>,
    #[serde(default)]
    pub content: Option<Value>,
}

/// The `POST /api/chat` request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

// ---------------------------------------------------------------------------
// Canonical roles
// ---------------------------------------------------------------------------

/// Closed role enum. Every inbound role string maps into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
    Unknown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

static ROLE_SYNONYMS: Lazy<HashMap<&'static str, Role>> = Lazy::new(|| {
    HashMap::from([
        ("user", Role::User),
        ("human", Role::User),
        ("assistant", Role::Assistant),
        ("ai", Role::Assistant),
        ("model", Role::Assistant),
        ("bot", Role::Assistant),
        ("system", Role::System),
    ])
});

/// Map a raw role value to the closed enum. Missing or non-string roles
/// map to `Unknown`, as does any string outside the synonym table.
pub fn map_role(raw: Option<&Value>) -> Role {
    match raw.and_then(Value::as_str) {
        Some(s) => ROLE_SYNONYMS
            .get(s.to_lowercase().as_str())
            .copied()
            .unwrap_or(Role::Unknown),
        None => Role::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// A normalized `(role, text)` pair. `text` is always present; empty means
/// "no extractable content".
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub role: Role,
    pub text: String,
}

/// Extract the text of one raw content value. Priority order: string,
/// object `text`, object `content`, array of parts, object `parts` array.
/// Unrecognized shapes degrade to the empty string; nothing here can fail.
fn extract_text(content: Option<&Value>) -> String {
    let extracted = match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => join_parts(parts),
        Some(Value::Object(obj)) => {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                text.to_string()
            } else if let Some(text) = obj.get("content").and_then(Value::as_str) {
                text.to_string()
            } else if let Some(Value::Array(parts)) = obj.get("parts") {
                join_parts(parts)
            } else {
                String::new()
            }
        }
        _ => String::new(),
    };
    extracted.trim().to_string()
}

/// Flatten an array of parts: strings pass through, objects contribute their
/// `text` or `content` string field, everything else contributes nothing.
/// Empties are dropped and the rest joined with single spaces.
fn join_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .map(|part| match part {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => obj
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| obj.get("content").and_then(Value::as_str))
                .unwrap_or(""),
            _ => "",
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize an inbound message list. Pure and deterministic; malformed
/// input degrades, it never errors.
pub fn normalize(raw: &[ChatMessage]) -> Vec<NormalizedMessage> {
    raw.iter()
        .map(|m| NormalizedMessage {
            role: map_role(m.role.as_ref()),
            text: extract_text(m.content.as_ref()),
        })
        .collect()
}

/// The effective user utterance for a request: the text of the last message
/// with role `user` and non-empty text, scanning from the end.
pub fn last_user_utterance(messages: &[NormalizedMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.text.is_empty())
        .map(|m| m.text.as_str())
}
