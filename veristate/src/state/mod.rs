//! Envelope state: references, the hybrid payload codec, and the
//! envelope manager.

mod codec;
mod envelope;
mod reference;

pub use codec::{HybridCodec, SlotEntry, DEFAULT_INLINE_THRESHOLD};
pub use envelope::{Envelope, EnvelopeManager};
pub use reference::Reference;
