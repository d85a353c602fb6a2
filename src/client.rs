use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::message::Role;
use crate::protocol::{FinishReason, Frame};

/// Reserved input: clears the transcript and input buffer, no network.
pub const CLEAR_COMMAND: &str = "/clear";

/// What the assistant bubble shows when the stream itself breaks. Short and
/// non-technical; the real cause goes to the log.
pub const READ_ERROR_MESSAGE: &str = "Something went wrong while answering. Please try again.";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Cancellation token
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag for one exchange. The controller owns the
/// current exchange's token and signals the previous one when a new
/// submission supersedes it; every consumer checks the flag before touching
/// the transcript.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Register with the notifier before re-checking the flag, so a
            // cancel landing in between cannot be missed.
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn same_exchange(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream decoder
// ---------------------------------------------------------------------------

/// A decoded frame event, ready for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Delta(String),
    Done(FinishReason),
}

/// Incremental decoder for the line protocol.
///
/// Feeds on raw byte chunks: multi-byte characters may straddle chunk
/// boundaries, so undecodable trailing bytes are carried into the next push.
/// Each complete line is parsed by its tag; anything unparseable is logged
/// and skipped, never fatal.
pub struct StreamDecoder {
    carry: Vec<u8>,
    line_buf: String,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder {
            carry: Vec::new(),
            line_buf: String::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume one chunk, returning the events completed by it. After the
    /// done frame the stream is over; later lines are dropped.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<DecodeEvent> {
        self.carry.extend_from_slice(chunk);
        let decoded = drain_utf8(&mut self.carry);
        self.line_buf.push_str(&decoded);

        let mut events = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            if self.finished {
                continue;
            }
            if let Some(event) = self.decode_line(line.trim_end_matches(['\n', '\r'])) {
                if matches!(event, DecodeEvent::Done(_)) {
                    self.finished = true;
                }
                events.push(event);
            }
        }
        events
    }

    /// Signal end-of-data. A trailing unterminated line is still decoded,
    /// and a stream that ended without a done frame is closed off
    /// defensively.
    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if !self.finished && !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            if let Some(event) = self.decode_line(line.trim_end_matches('\r')) {
                if matches!(event, DecodeEvent::Done(_)) {
                    self.finished = true;
                }
                events.push(event);
            }
        }
        if !self.finished {
            self.finished = true;
            events.push(DecodeEvent::Done(FinishReason::Stop));
        }
        events
    }

    fn decode_line(&self, line: &str) -> Option<DecodeEvent> {
        if line.is_empty() {
            return None;
        }
        match Frame::parse_line(line) {
            Some(Frame::Delta { text_delta }) => Some(DecodeEvent::Delta(text_delta)),
            Some(Frame::Done { finish_reason, .. }) => Some(DecodeEvent::Done(finish_reason)),
            None => {
                tracing::debug!(line, "skipping unrecognized stream line");
                None
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode the longest valid UTF-8 prefix of `buf`, leaving an incomplete
/// trailing sequence in place for the next chunk. Invalid (not merely
/// incomplete) sequences are replaced rather than aborting the stream.
fn drain_utf8(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buf) {
            Ok(s) => {
                out.push_str(s);
                buf.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&buf[..valid]).unwrap_or_default());
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buf.drain(..valid + bad);
                    }
                    None => {
                        // Incomplete tail: keep it for the next chunk.
                        buf.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange controller
// ---------------------------------------------------------------------------

/// One rendered transcript entry. `content` accumulates while the exchange
/// streams; `is_streaming` is true only until the first delta lands.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp_ms: u64,
    pub is_streaming: bool,
}

impl ClientMessage {
    fn new(role: Role, content: &str, is_streaming: bool) -> Self {
        ClientMessage {
            id: format!("msg-{}", Uuid::new_v4()),
            role,
            content: content.to_string(),
            timestamp_ms: now_ms(),
            is_streaming,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Done,
    Errored,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sending,
    Streaming,
    Settled(Settlement),
}

/// What a submission turned into.
pub enum SubmitAction {
    /// A new exchange began; drive it with this token.
    Started(CancelToken),
    /// The reserved clear command ran; no network activity.
    Cleared,
    /// Empty input; nothing happened.
    Ignored,
}

struct Exchange {
    cancel: CancelToken,
    state: ExchangeState,
    assistant_ix: usize,
    saw_delta: bool,
}

/// Owns the transcript and the current-exchange slot. All transcript
/// mutation funnels through here: the decoder and network layer only hand
/// events in, each tagged with its exchange's token, and events from a
/// superseded exchange are discarded at the door.
pub struct ChatController {
    transcript: Vec<ClientMessage>,
    input: String,
    current: Option<Exchange>,
}

impl ChatController {
    pub fn new() -> Self {
        ChatController {
            transcript: Vec::new(),
            input: String::new(),
            current: None,
        }
    }

    pub fn transcript(&self) -> &[ClientMessage] {
        &self.transcript
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: &str) {
        self.input = text.to_string();
    }

    pub fn state(&self) -> ExchangeState {
        self.current
            .as_ref()
            .map(|e| e.state)
            .unwrap_or(ExchangeState::Idle)
    }

    /// Submit user input. Supersedes any still-running exchange before the
    /// new one's first transcript mutation, appends the user message and the
    /// streaming assistant placeholder atomically, and hands back the new
    /// exchange's cancellation token.
    pub fn submit(&mut self, text: &str) -> SubmitAction {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return SubmitAction::Ignored;
        }
        if trimmed == CLEAR_COMMAND {
            self.supersede();
            self.transcript.clear();
            self.input.clear();
            return SubmitAction::Cleared;
        }

        self.supersede();

        self.transcript
            .push(ClientMessage::new(Role::User, trimmed, false));
        self.transcript
            .push(ClientMessage::new(Role::Assistant, "", true));
        let assistant_ix = self.transcript.len() - 1;

        let cancel = CancelToken::new();
        self.current = Some(Exchange {
            cancel: cancel.clone(),
            state: ExchangeState::Sending,
            assistant_ix,
            saw_delta: false,
        });
        self.input.clear();
        SubmitAction::Started(cancel)
    }

    /// Cancel the in-flight exchange, if any. Its partial content stays in
    /// the transcript as-is; it just stops being updated.
    fn supersede(&mut self) {
        if let Some(previous) = self.current.take() {
            if !matches!(previous.state, ExchangeState::Settled(_)) {
                tracing::debug!("superseding in-flight exchange");
                previous.cancel.cancel();
                if let Some(msg) = self.transcript.get_mut(previous.assistant_ix) {
                    msg.is_streaming = false;
                }
            }
        }
    }

    /// Response headers arrived for the exchange owning `token`.
    pub fn on_headers(&mut self, token: &CancelToken) {
        if let Some(exchange) = self.current_for(token) {
            if exchange.state == ExchangeState::Sending {
                exchange.state = ExchangeState::Streaming;
            }
        }
    }

    /// Apply one decoded event. Checks the cancellation flag and the slot
    /// identity before every mutation — a stale exchange's frames fall
    /// through silently.
    pub fn apply(&mut self, token: &CancelToken, event: DecodeEvent) {
        if token.is_cancelled() {
            return;
        }
        let Some(exchange) = self.current_for(token) else {
            return;
        };
        match event {
            DecodeEvent::Delta(text) => {
                exchange.state = ExchangeState::Streaming;
                let first = !exchange.saw_delta;
                exchange.saw_delta = true;
                let ix = exchange.assistant_ix;
                if let Some(msg) = self.transcript.get_mut(ix) {
                    msg.content.push_str(&text);
                    if first {
                        msg.is_streaming = false;
                    }
                }
            }
            DecodeEvent::Done(reason) => {
                let settlement = match reason {
                    FinishReason::Stop => Settlement::Done,
                    FinishReason::Error => Settlement::Errored,
                };
                exchange.state = ExchangeState::Settled(settlement);
                let ix = exchange.assistant_ix;
                if let Some(msg) = self.transcript.get_mut(ix) {
                    msg.is_streaming = false;
                }
            }
        }
    }

    /// The stream broke before settling: overwrite the placeholder with the
    /// fixed user-facing error text.
    pub fn on_transport_error(&mut self, token: &CancelToken) {
        if token.is_cancelled() {
            return;
        }
        let Some(exchange) = self.current_for(token) else {
            return;
        };
        exchange.state = ExchangeState::Settled(Settlement::Errored);
        let ix = exchange.assistant_ix;
        if let Some(msg) = self.transcript.get_mut(ix) {
            msg.content = READ_ERROR_MESSAGE.to_string();
            msg.is_streaming = false;
        }
    }

    fn current_for(&mut self, token: &CancelToken) -> Option<&mut Exchange> {
        self.current
            .as_mut()
            .filter(|e| e.cancel.same_exchange(token))
    }
}

impl Default for ChatController {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Network driver
// ---------------------------------------------------------------------------

/// A headless chat client for one relay endpoint: submits through the
/// controller, streams the response body, feeds the decoder, and applies
/// events until settlement. With `echo` on, deltas print to stdout as they
/// arrive.
pub struct ChatClient {
    http: reqwest::Client,
    relay_url: String,
    pub controller: ChatController,
    echo: bool,
}

impl ChatClient {
    pub fn new(relay_url: impl Into<String>) -> Self {
        ChatClient {
            http: reqwest::Client::new(),
            relay_url: relay_url.into(),
            controller: ChatController::new(),
            echo: false,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Run one exchange to settlement and return its final state.
    pub async fn send(&mut self, text: &str) -> ExchangeState {
        let token = match self.controller.submit(text) {
            SubmitAction::Started(token) => token,
            SubmitAction::Cleared | SubmitAction::Ignored => return self.controller.state(),
        };

        let body = serde_json::json!({
            "messages": [{"role": "user", "content": text}]
        });

        let response = tokio::select! {
            _ = token.cancelled() => return self.controller.state(),
            r = self.http.post(&self.relay_url).json(&body).send() => r,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "relay request failed before any byte arrived");
                self.controller.on_transport_error(&token);
                return self.controller.state();
            }
        };

        self.controller.on_headers(&token);

        let mut decoder = StreamDecoder::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => break,
                c = stream.next() => c,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for event in decoder.push_chunk(&bytes) {
                        self.echo_event(&event);
                        self.controller.apply(&token, event);
                    }
                    if decoder.is_finished() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "stream read failed mid-exchange");
                    self.controller.on_transport_error(&token);
                    return self.controller.state();
                }
                None => break,
            }
        }

        for event in decoder.finish() {
            self.controller.apply(&token, event);
        }
        self.controller.state()
    }

    fn echo_event(&self, event: &DecodeEvent) {
        if self.echo {
            if let DecodeEvent::Delta(text) = event {
                print!("{}", text);
                let _ = io::stdout().flush();
            }
        }
    }
}
