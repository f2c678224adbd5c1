//! Event payloads a [`super::StreamingCollection`] emits synchronously
//! during `add`/`addBulk`/`remove*` calls and event-source pumping
//! (spec.md §4.5, "Event emissions"; §5: handlers run inline and must not
//! re-enter the collection).

use crate::error::AggError;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Event {
    /// One or more documents were inserted in a single `add`/`addBulk` call.
    DataAdded { new_documents: Vec<Value>, total_count: usize },

    /// One or more documents were removed in a single `remove*` call.
    DataRemoved {
        removed_documents: Vec<Value>,
        removed_count: usize,
        total_count: usize,
    },

    /// A registered plan's materialized result changed. Fires at most once
    /// per affected plan per operation, in plan-registration order.
    ResultUpdated { result: Vec<Value>, pipeline: Value },

    /// An external event source's transform raised an error; the event
    /// was skipped (not delivered to any plan).
    TransformError { error: AggError, event_name: String },
}
