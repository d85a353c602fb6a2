pub mod cli;
pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod message;
pub mod protocol;
pub mod session;
pub mod upstream;
pub mod web;

use reqwest::Client;
use tokio::sync::mpsc;

use config::RelayConfig;
use encoder::{stream_failure, stream_success, Pacing};
use error::RelayError;
use message::{last_user_utterance, normalize, ChatMessage};
use protocol::Frame;
use upstream::{build_request, invoke};

// ---------------------------------------------------------------------------
// ChatRelay — the request-scoped relay pipeline
// ---------------------------------------------------------------------------

/// The relay engine: normalize → validate → build → invoke → encode.
///
/// One instance is shared across connections; it holds nothing mutable, so
/// every request is an independent unit of work. The only cross-request
/// state in the whole system is the upstream's own conversation memory,
/// which the relay never touches — the session id is a pass-through key.
pub struct ChatRelay {
    client: Client,
    config: RelayConfig,
    pacing: Pacing,
}

impl ChatRelay {
    pub fn new(config: RelayConfig) -> Self {
        ChatRelay {
            client: Client::new(),
            config,
            pacing: Pacing::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Pre-flight checks, run before any response byte is written: extract
    /// the effective user utterance and confirm the upstream is configured.
    /// Failures here can still be rejected with a proper HTTP status.
    pub fn preflight(&self, messages: &[ChatMessage]) -> Result<String, RelayError> {
        let normalized = normalize(messages);
        let question = last_user_utterance(&normalized)
            .ok_or(RelayError::Validation)?
            .to_string();
        self.config.require_upstream()?;
        Ok(question)
    }

    /// Run one chat turn to completion, emitting frames through `tx`.
    ///
    /// Never returns an error: once this runs the response headers are
    /// committed, so every failure is folded into the in-stream error path
    /// (one `Error: ...` delta, one done-with-error frame). Exactly one done
    /// frame terminates the emission in all cases.
    pub async fn run_turn(
        &self,
        question: &str,
        session_id: &str,
        tx: &mpsc::UnboundedSender<Frame>,
    ) {
        let request = match build_request(&self.config, question, session_id) {
            Ok(r) => r,
            Err(e) => {
                stream_failure(&e.to_string(), tx);
                return;
            }
        };

        tracing::debug!(url = %request.url, session = %session_id, "dispatching upstream call");
        let outcome = invoke(&self.client, &request, self.config.deadline).await;

        match outcome.into_result() {
            Ok(text) => {
                tracing::debug!(chars = text.len(), "upstream answered, streaming");
                stream_success(&text, self.pacing, tx).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn failed, streaming error frames");
                stream_failure(&e.to_string(), tx);
            }
        }
    }
}
