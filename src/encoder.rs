use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{FinishReason, Frame};

/// Default inter-frame delay on the success path. Purely cosmetic — it makes
/// the atomic upstream answer read like incremental generation.
pub const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(35);

/// Emission pacing. `None` disables delays entirely without changing frame
/// content or order, which is what every test uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    None,
    Fixed(Duration),
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Fixed(DEFAULT_FRAME_DELAY)
    }
}

impl Pacing {
    async fn pause(&self) {
        if let Pacing::Fixed(delay) = self {
            tokio::time::sleep(*delay).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Frame construction
// ---------------------------------------------------------------------------

/// Frames for a successful upstream answer: one delta per whitespace-
/// delimited word, every word after the first carrying a single leading
/// space, then the stop frame. Concatenating the deltas reconstructs the
/// text with whitespace runs collapsed to single spaces.
pub fn success_frames(text: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = text
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            if i == 0 {
                Frame::delta(word)
            } else {
                Frame::delta(format!(" {}", word))
            }
        })
        .collect();
    frames.push(Frame::done(FinishReason::Stop));
    frames
}

/// Frames for any failure: exactly one `Error: ...` delta, then the error
/// frame. This is the only reporting channel once the 200 headers are out.
pub fn failure_frames(message: &str) -> Vec<Frame> {
    vec![
        Frame::delta(format!("Error: {}", message)),
        Frame::done(FinishReason::Error),
    ]
}

// ---------------------------------------------------------------------------
// Paced emission
// ---------------------------------------------------------------------------

/// Emit the success frames through `tx`, pausing between frames according to
/// `pacing`. Stops early if the receiver is gone (client disconnected).
pub async fn stream_success(text: &str, pacing: Pacing, tx: &mpsc::UnboundedSender<Frame>) {
    for (i, frame) in success_frames(text).into_iter().enumerate() {
        if i > 0 {
            pacing.pause().await;
        }
        if tx.send(frame).is_err() {
            tracing::debug!("frame receiver dropped mid-stream");
            return;
        }
    }
}

/// Emit the failure frames through `tx`. Never paced — an error should land
/// immediately.
pub fn stream_failure(message: &str, tx: &mpsc::UnboundedSender<Frame>) {
    for frame in failure_frames(message) {
        if tx.send(frame).is_err() {
            return;
        }
    }
}
