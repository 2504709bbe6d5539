//! Translation core.
//!
//! Raw upstream frames are decoded into provider events, normalized into
//! [`Delta`]s by a per-provider strategy and written out as OpenAI-style
//! chunks. [`pipeline::spawn_turn`] wires the stages together for one turn.

pub mod decoder;
pub mod delta;
pub mod emitter;
pub mod normalizer;
pub mod pipeline;

pub use decoder::{FrameDecoder, Framing, ProviderEvent};
pub use delta::{Delta, Phase};
pub use emitter::{collect_response, Emitter, EmitterState, OutwardChunk};
pub use normalizer::{Normalizer, Outcome, Signal, Strategy};
pub use pipeline::{spawn_turn, TurnContext, TurnReport};
