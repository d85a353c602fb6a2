use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------
//
// One frame per line: a one-character type tag, a colon, a JSON payload,
// a newline.
//
//   0:{"type":"text-delta","textDelta":"Hola,"}
//   d:{"finishReason":"stop","usage":{"promptTokens":0,"completionTokens":0}}
//
// Lines with an unrecognized tag are noise to the decoder, which keeps the
// format forward-compatible.

pub const DELTA_TAG: &str = "0:";
pub const DONE_TAG: &str = "d:";

/// Why the stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Error,
}

/// Token usage placeholders carried by the done frame. The upstream is
/// atomic and reports no counts, so these stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One frame of the stream protocol. Every stream is zero or more `Delta`
/// frames followed by exactly one `Done` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Delta { text_delta: String },
    Done { finish_reason: FinishReason, usage: Usage },
}

// Payload shapes, kept separate from `Frame` so field names and order on the
// wire are pinned down independently of how the enum evolves.

#[derive(Serialize, Deserialize)]
struct DeltaPayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "textDelta")]
    text_delta: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DonePayload {
    finish_reason: FinishReason,
    usage: Usage,
}

const TEXT_DELTA_KIND: &str = "text-delta";

impl Frame {
    pub fn delta(text: impl Into<String>) -> Self {
        Frame::Delta {
            text_delta: text.into(),
        }
    }

    pub fn done(finish_reason: FinishReason) -> Self {
        Frame::Done {
            finish_reason,
            usage: Usage::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Frame::Done { .. })
    }

    /// Serialize to one wire line, trailing newline included.
    pub fn encode_line(&self) -> String {
        match self {
            Frame::Delta { text_delta } => {
                let payload = DeltaPayload {
                    kind: TEXT_DELTA_KIND,
                    text_delta: text_delta.clone(),
                };
                // Serialization of these payloads cannot fail; fall back to
                // an empty delta rather than propagate.
                let json = serde_json::to_string(&payload).unwrap_or_default();
                format!("{}{}\n", DELTA_TAG, json)
            }
            Frame::Done {
                finish_reason,
                usage,
            } => {
                let payload = DonePayload {
                    finish_reason: *finish_reason,
                    usage: *usage,
                };
                let json = serde_json::to_string(&payload).unwrap_or_default();
                format!("{}{}\n", DONE_TAG, json)
            }
        }
    }

    /// Parse one line (without its newline). `None` means the line is not a
    /// recognizable frame — unknown tag, malformed JSON, or a delta payload
    /// of some other type — and should be skipped, not treated as fatal.
    pub fn parse_line(line: &str) -> Option<Frame> {
        if let Some(json) = line.strip_prefix(DELTA_TAG) {
            let payload: DeltaPayload<'_> = serde_json::from_str(json).ok()?;
            if payload.kind != TEXT_DELTA_KIND {
                return None;
            }
            return Some(Frame::Delta {
                text_delta: payload.text_delta,
            });
        }
        if let Some(json) = line.strip_prefix(DONE_TAG) {
            let payload: DonePayload = serde_json::from_str(json).ok()?;
            return Some(Frame::Done {
                finish_reason: payload.finish_reason,
                usage: payload.usage,
            });
        }
        None
    }
}
