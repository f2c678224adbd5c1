//! External event source adapters (spec.md §4.5/§6, "connectEventSource").
//!
//! spec.md §5 is explicit that this crate has no background thread and no
//! suspension points: an event source is a cooperative, pollable feed the
//! caller drains by calling [`super::StreamingCollection::pump_event_sources`]
//! — there is no scheduler hidden inside `connect_event_source` itself.

use crate::error::Result;
use crate::value::Value;

/// A push-style external feed of raw events. Implementations wrap
/// whatever the embedding application's actual transport is (a channel
/// receiver, a websocket frame queue, …) — this crate only needs a
/// non-blocking `poll`.
pub trait EventSource {
    /// Drains and returns the next available raw event, or `None` if
    /// nothing is currently buffered.
    fn poll(&mut self) -> Option<Value>;
}

/// User transform applied to each raw event before it is folded into
/// `addBulk`. Synchronous, per spec.md §5; an `Err` skips the event and
/// emits [`super::Event::TransformError`] rather than panicking or
/// aborting the rest of the pump.
pub type Transform = Box<dyn FnMut(Value) -> Result<Value>>;

/// Configuration for [`super::StreamingCollection::connect_event_source`].
pub struct EventSourceConfig {
    pub source: Box<dyn EventSource>,
    pub event_name: String,
    pub transform: Option<Transform>,
    /// Whether this source should be pumped by default. This crate has
    /// no scheduler to start/stop, so the flag is advisory: a caller can
    /// still invoke `pump_event_sources` regardless, and
    /// `disconnect_event_source` is the actual on/off switch.
    pub auto_start: bool,
}

/// A handle returned by `connect_event_source`, used to
/// `disconnect_event_source` later. Backed by a random `Uuid` rather than
/// a counter so handles stay valid identifiers even if a caller persists
/// one across a process restart (the collection itself never does; this
/// just avoids handing out a representation that implies otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSourceHandle(pub(crate) uuid::Uuid);

pub(crate) struct ActiveSource {
    pub(crate) source: Box<dyn EventSource>,
    pub(crate) event_name: String,
    pub(crate) transform: Option<Transform>,
    pub(crate) running: bool,
}
