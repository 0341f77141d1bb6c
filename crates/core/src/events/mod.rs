//! Structured progress events: emitted by workers, logged, and fanned out.

mod broadcaster;
mod dispatcher;
mod emitter;
mod types;

pub use broadcaster::{EventBroadcaster, EventSubscription, Received};
pub use dispatcher::{create_event_pipeline, EventDispatcher};
pub use emitter::{EventEmitter, EventScope};
pub use types::*;
