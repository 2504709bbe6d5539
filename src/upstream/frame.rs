//! Transport-agnostic unit of upstream data.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::Error;

/// One chunk of upstream bytes in arrival order.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Identifies the connection or captured request the bytes came from.
    pub source: Arc<str>,
    /// Arrival order within the turn, starting at 0.
    pub seq: u64,
    pub payload: Bytes,
}

/// Ordered frames for one turn. An `Err` item ends the turn with an
/// upstream failure.
pub type FrameStream = BoxStream<'static, Result<RawFrame, Error>>;

/// Number a byte stream's chunks and tag them with `source`.
pub fn sequence<S, E>(source: impl Into<Arc<str>>, chunks: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Error>,
{
    let source = source.into();
    chunks
        .enumerate()
        .map(move |(seq, chunk)| {
            chunk.map(|payload| RawFrame {
                source: source.clone(),
                seq: seq as u64,
                payload,
            })
            .map_err(Into::into)
        })
        .boxed()
}

/// Frames from in-memory chunks, mostly useful for tests and replays.
pub fn from_chunks<I, B>(source: &str, chunks: I) -> FrameStream
where
    I: IntoIterator<Item = B>,
    B: Into<Bytes>,
{
    let chunks: Vec<Result<Bytes, Error>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
    sequence(source, futures::stream::iter(chunks))
}
