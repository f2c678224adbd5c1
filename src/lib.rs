//! # Aggview
//!
//! An incremental-view-maintenance engine for MongoDB-style aggregation
//! pipelines over in-memory document collections.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Pipeline Document (JSON-shaped `Value`)
//!     ↓
//! [Stage Grammar (stage)]        → Vec<Stage>
//!     ↓
//! [Planner (plan)]               → ExecutionPlan (capability flags, top-k hint)
//!     ↓
//! [Batch Executor (batch)]       → ground truth, full recompute
//!     ↓
//! [IVM Chain (ivm)]              → StageRuntime per stage, delta propagation
//!     ↓
//! [Streaming Collection (collection)] → owns the store, drives both executors
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aggview::{Config, StreamingCollection, Value};
//!
//! let mut collection = StreamingCollection::new(Config::default());
//! collection.add(Value::doc([("region".into(), Value::string("west"))]))?;
//!
//! let pipeline = Value::array([
//!     Value::doc([("$group".into(), Value::doc([
//!         ("_id".into(), Value::string("$region")),
//!         ("count".into(), Value::doc([("$count".into(), Value::Null)])),
//!     ]))]),
//! ]);
//!
//! let result = collection.stream(pipeline)?;
//! # Ok::<(), aggview::AggError>(())
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Document/value domain, row ids, path resolution |
//! | `expr` | Expression engine (operators, field paths, system variables) |
//! | `match_predicate` | `$match` query-predicate grammar |
//! | `store` | Columnar store: live set, dimensions, multisets, order-stat tree |
//! | `group` | `$group` accumulator state machine |
//! | `stage` | Pipeline stage grammar shared by both executors |
//! | `foreign` | `$lookup`'s foreign-collection capability |
//! | `batch` | Ground-truth batch executor (full recompute) |
//! | `plan` | Pipeline planner/compiler |
//! | `ivm` | Incremental per-stage operators and the delta-propagation chain |
//! | `collection` | The streaming collection facade and its event bus |

pub mod batch;
pub mod collection;
pub mod config;
pub mod error;
pub mod expr;
pub mod foreign;
pub mod group;
pub mod ivm;
pub mod match_predicate;
pub mod plan;
pub mod stage;
pub mod store;
pub mod value;

pub use collection::{Event, EventSource, EventSourceConfig, EventSourceHandle, StreamingCollection};
pub use config::Config;
pub use error::{AggError, Result};
pub use plan::ExecutionPlan;
pub use value::{Document, RowId, Value};
