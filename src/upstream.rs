use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Fixed reply text when the upstream answers 2xx but carries no usable
/// `text` field.
pub const NO_TEXT_PLACEHOLDER: &str = "(no response text)";

/// Cap on the error-body snippet surfaced to the client.
pub const SNIPPET_CAP: usize = 300;

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

/// Body of every upstream call.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamBody {
    pub question: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// A fully prepared upstream call: URL, JSON body, optional bearer.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub body: UpstreamBody,
    pub bearer: Option<String>,
}

/// Build the upstream request from configuration. A base URL containing a
/// `/webhook/` segment is used verbatim; anything else is treated as a
/// service root and routed to the prediction API. The bearer credential is
/// only attached in prediction mode — webhook endpoints authenticate through
/// the URL itself.
pub fn build_request(
    config: &RelayConfig,
    question: &str,
    session_id: &str,
) -> Result<UpstreamRequest, RelayError> {
    let (base, agent_id) = config.require_upstream()?;

    let (url, bearer) = if base.contains("/webhook/") {
        (base.to_string(), None)
    } else {
        let agent = agent_id.ok_or(RelayError::Configuration("FLOWISE_AGENT_ID"))?;
        let root = base.trim_end_matches('/');
        (
            format!("{}/api/v1/prediction/{}", root, agent),
            config.api_key.clone(),
        )
    };

    Ok(UpstreamRequest {
        url,
        body: UpstreamBody {
            question: question.to_string(),
            session_id: session_id.to_string(),
        },
        bearer,
    })
}

// ---------------------------------------------------------------------------
// Bounded invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpstreamReply {
    #[serde(default)]
    text: Option<String>,
}

/// Classified result of one upstream call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    Success(String),
    UpstreamError { status: u16, snippet: String },
    Timeout,
    NetworkFailure,
}

impl UpstreamOutcome {
    /// Fold the failure variants into the error taxonomy. `Success` stays.
    pub fn into_result(self) -> Result<String, RelayError> {
        match self {
            UpstreamOutcome::Success(text) => Ok(text),
            UpstreamOutcome::UpstreamError { status, snippet } => {
                Err(RelayError::Upstream { status, snippet })
            }
            UpstreamOutcome::Timeout => Err(RelayError::Timeout),
            UpstreamOutcome::NetworkFailure => Err(RelayError::Network),
        }
    }
}

/// Call the upstream under a hard wall-clock deadline.
///
/// The deadline timer lives inside `tokio::time::timeout` and is freed on
/// completion whatever the outcome. Dropping the returned future cancels the
/// in-flight call — callers wanting cooperative cancellation race this
/// future in a `select!`.
pub async fn invoke(
    client: &Client,
    request: &UpstreamRequest,
    deadline: Duration,
) -> UpstreamOutcome {
    match tokio::time::timeout(deadline, send(client, request)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(url = %request.url, ?deadline, "upstream call hit deadline");
            UpstreamOutcome::Timeout
        }
    }
}

async fn send(client: &Client, request: &UpstreamRequest) -> UpstreamOutcome {
    let mut builder = client
        .post(&request.url)
        .header("Content-Type", "application/json")
        .json(&request.body);
    if let Some(key) = &request.bearer {
        builder = builder.bearer_auth(key);
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return UpstreamOutcome::Timeout,
        Err(e) => {
            tracing::warn!(url = %request.url, error = %e, "upstream transport failure");
            return UpstreamOutcome::NetworkFailure;
        }
    };

    let status = response.status();
    if !status.is_success() {
        // Best effort: an unreadable error body yields an empty snippet,
        // never a second failure.
        let snippet = response
            .text()
            .await
            .map(|body| truncate_snippet(&body))
            .unwrap_or_default();
        tracing::warn!(url = %request.url, status = status.as_u16(), "upstream returned error status");
        return UpstreamOutcome::UpstreamError {
            status: status.as_u16(),
            snippet,
        };
    }

    match response.json::<UpstreamReply>().await {
        Ok(reply) => match reply.text {
            Some(text) if !text.is_empty() => UpstreamOutcome::Success(text),
            _ => UpstreamOutcome::Success(NO_TEXT_PLACEHOLDER.to_string()),
        },
        Err(e) => {
            tracing::warn!(url = %request.url, error = %e, "upstream returned malformed JSON");
            UpstreamOutcome::UpstreamError {
                status: status.as_u16(),
                snippet: "malformed response body".to_string(),
            }
        }
    }
}

/// First `SNIPPET_CAP` characters of an error body.
fn truncate_snippet(body: &str) -> String {
    body.chars().take(SNIPPET_CAP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn prediction_config() -> RelayConfig {
        RelayConfig {
            base_url: Some("http://localhost:3000".to_string()),
            agent_id: Some("flow-1".to_string()),
            api_key: None,
            ..RelayConfig::default()
        }
    }

    // -- build_request --

    #[test]
    fn test_prediction_url_construction() {
        let req = build_request(&prediction_config(), "hi", "chat-1").expect("build");
        assert_eq!(req.url, "http://localhost:3000/api/v1/prediction/flow-1");
    }

    #[test]
    fn test_prediction_url_trailing_slash_collapsed() {
        let mut cfg = prediction_config();
        cfg.base_url = Some("http://localhost:3000/".to_string());
        let req = build_request(&cfg, "hi", "chat-1").expect("build");
        assert_eq!(req.url, "http://localhost:3000/api/v1/prediction/flow-1");
    }

    #[test]
    fn test_webhook_url_used_verbatim() {
        let mut cfg = prediction_config();
        cfg.base_url = Some("https://host/webhook/uuid-7".to_string());
        let req = build_request(&cfg, "hi", "chat-1").expect("build");
        assert_eq!(req.url, "https://host/webhook/uuid-7");
    }

    #[test]
    fn test_bearer_attached_in_prediction_mode() {
        let mut cfg = prediction_config();
        cfg.api_key = Some("secret".to_string());
        let req = build_request(&cfg, "hi", "chat-1").expect("build");
        assert_eq!(req.bearer.as_deref(), Some("secret"));
    }

    #[test]
    fn test_bearer_never_attached_in_webhook_mode() {
        // Preserved asymmetry: webhook endpoints authenticate differently,
        // so a configured key is deliberately not forwarded.
        let mut cfg = prediction_config();
        cfg.base_url = Some("https://host/webhook/uuid-7".to_string());
        cfg.api_key = Some("secret".to_string());
        let req = build_request(&cfg, "hi", "chat-1").expect("build");
        assert!(req.bearer.is_none());
    }

    #[test]
    fn test_body_carries_question_and_session() {
        let req = build_request(&prediction_config(), "¿cómo?", "chat-9").expect("build");
        let json = serde_json::to_string(&req.body).expect("serialize");
        assert_eq!(json, "{\"question\":\"¿cómo?\",\"sessionId\":\"chat-9\"}");
    }

    #[test]
    fn test_missing_base_url_is_configuration_error() {
        let cfg = RelayConfig::default();
        match build_request(&cfg, "hi", "chat-1") {
            Err(RelayError::Configuration(name)) => assert_eq!(name, "FLOWISE_BASE_URL"),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_agent_id_is_configuration_error() {
        let cfg = RelayConfig {
            base_url: Some("http://localhost:3000".to_string()),
            ..RelayConfig::default()
        };
        match build_request(&cfg, "hi", "chat-1") {
            Err(RelayError::Configuration(name)) => assert_eq!(name, "FLOWISE_AGENT_ID"),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    // -- outcome folding --

    #[test]
    fn test_outcome_success_folds_to_ok() {
        assert_eq!(
            UpstreamOutcome::Success("hi".to_string()).into_result().ok(),
            Some("hi".to_string())
        );
    }

    #[test]
    fn test_outcome_upstream_error_keeps_status_and_snippet() {
        let err = UpstreamOutcome::UpstreamError {
            status: 500,
            snippet: "boom".to_string(),
        }
        .into_result()
        .expect_err("error");
        assert_eq!(err.to_string(), "Flowise error: 500 - boom");
    }

    #[test]
    fn test_outcome_timeout_and_network_fold() {
        assert!(matches!(
            UpstreamOutcome::Timeout.into_result(),
            Err(RelayError::Timeout)
        ));
        assert!(matches!(
            UpstreamOutcome::NetworkFailure.into_result(),
            Err(RelayError::Network)
        ));
    }

    // -- snippet truncation --

    #[test]
    fn test_truncate_snippet_caps_at_300_chars() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_snippet(&long).len(), SNIPPET_CAP);
    }

    #[test]
    fn test_truncate_snippet_short_body_untouched() {
        assert_eq!(truncate_snippet("boom"), "boom");
    }

    #[test]
    fn test_truncate_snippet_counts_chars_not_bytes() {
        let long: String = "é".repeat(400);
        let snippet = truncate_snippet(&long);
        assert_eq!(snippet.chars().count(), SNIPPET_CAP);
    }

    // -- reply parsing shape --

    #[test]
    fn test_upstream_reply_text_field() {
        let reply: UpstreamReply = serde_json::from_str(r#"{"text":"hola"}"#).expect("deser");
        assert_eq!(reply.text.as_deref(), Some("hola"));
    }

    #[test]
    fn test_upstream_reply_missing_text() {
        let reply: UpstreamReply =
            serde_json::from_str(r#"{"chatId":"abc"}"#).expect("deser");
        assert!(reply.text.is_none());
    }
}
