//! Per-turn translation task.
//!
//! One spawned task owns the upstream [`FrameStream`] for a turn and drives
//! it through decoder, normalizer and emitter, sending outward chunks over
//! an mpsc channel. The task is the only place that waits on the upstream;
//! it stops reading as soon as the caller goes away or a timer fires, and
//! drops the source before reporting back.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;

use super::decoder::{FrameDecoder, Framing};
use super::delta::Delta;
use super::emitter::{Emitter, OutwardChunk};
use super::normalizer::{Normalizer, Outcome};
use crate::config::{ProviderKind, ThinkingStyle};
use crate::upstream::FrameStream;

/// Channel depth between the turn task and the response body.
const CHANNEL_CAPACITY: usize = 32;

/// Everything a turn task needs besides the frames.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub kind: ProviderKind,
    /// Model name echoed in every chunk.
    pub model: String,
    pub thinking: ThinkingStyle,
    /// Longest wait for the next frame.
    pub idle_timeout: Duration,
    /// Wall-clock bound for the whole turn.
    pub max_turn: Duration,
}

/// What the turn task learned, handed to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Last linkage id the upstream sent.
    pub linkage: Option<String>,
    /// `Open` when the caller disconnected before the turn finished.
    pub outcome: Outcome,
    /// Assistant text as the caller received it.
    pub reply: String,
}

impl TurnReport {
    pub fn completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

/// Start translating `frames`; returns the outward chunk stream.
///
/// `on_complete` runs exactly once, after the upstream source has been
/// dropped, whether the turn finished, failed, timed out or was abandoned.
/// The outward stream ends only after it has returned.
pub fn spawn_turn<F>(ctx: TurnContext, frames: FrameStream, on_complete: F) -> ReceiverStream<OutwardChunk>
where
    F: FnOnce(TurnReport) + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let report = run_turn(ctx, frames, &tx).await;
        on_complete(report);
        drop(tx);
    });
    ReceiverStream::new(rx)
}

async fn run_turn(
    ctx: TurnContext,
    mut frames: FrameStream,
    tx: &mpsc::Sender<OutwardChunk>,
) -> TurnReport {
    let mut decoder = FrameDecoder::new(Framing::from(ctx.kind));
    let mut normalizer = Normalizer::new(ctx.kind);
    let mut emitter = Emitter::new(ctx.model.clone(), ctx.thinking);
    let deadline = Instant::now() + ctx.max_turn;
    let mut reply = String::new();

    'turn: while !normalizer.is_finished() {
        let wake = (Instant::now() + ctx.idle_timeout).min(deadline);
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(model = %ctx.model, "caller disconnected, abandoning turn");
                break 'turn;
            }
            next = timeout_at(wake, frames.next()) => next,
        };

        let deltas: Vec<Delta> = match next {
            Ok(Some(Ok(frame))) => decoder
                .push(&frame)
                .iter()
                .flat_map(|event| normalizer.push(event))
                .collect(),
            Ok(Some(Err(e))) => {
                tracing::error!(error = %e, model = %ctx.model, "upstream stream failed");
                normalizer.fail(e.to_string()).into_iter().collect()
            }
            Ok(None) => {
                let mut deltas: Vec<Delta> = decoder
                    .finish()
                    .iter()
                    .flat_map(|event| normalizer.push(event))
                    .collect();
                deltas.extend(normalizer.finish());
                deltas
            }
            Err(_) => {
                let message = timeout_message(&ctx, deadline);
                tracing::error!(model = %ctx.model, "{}", message);
                normalizer.fail(message).into_iter().collect()
            }
        };

        for delta in deltas {
            for chunk in emitter.push(delta) {
                if let Some(text) = chunk.as_chunk().and_then(|c| c.content()) {
                    reply.push_str(text);
                }
                if tx.send(chunk).await.is_err() {
                    tracing::debug!(model = %ctx.model, "caller disconnected mid-write");
                    break 'turn;
                }
            }
        }
    }

    drop(frames);
    TurnReport {
        linkage: normalizer.linkage().map(str::to_string),
        outcome: normalizer.outcome(),
        reply,
    }
}

fn timeout_message(ctx: &TurnContext, deadline: Instant) -> String {
    if Instant::now() >= deadline {
        format!(
            "Upstream timed out: turn exceeded {}s",
            ctx.max_turn.as_secs()
        )
    } else {
        format!(
            "Upstream timed out: no data for {}s",
            ctx.idle_timeout.as_secs()
        )
    }
}
