//! The streaming collection facade (spec.md §4.5, §5, §6).
//!
//! Owns the columnar store, the table of active plans keyed by a
//! canonical pipeline serialization, and the synchronous event bus.
//! Every public method here runs to completion before returning — there
//! are no suspension points (spec.md §5) — and event handlers fire
//! inline during the call that produced them.

pub mod events;
pub mod external_source;

pub use events::Event;
pub use external_source::{EventSource, EventSourceConfig, EventSourceHandle};

use crate::batch;
use crate::config::Config;
use crate::error::{AggError, Result};
use crate::foreign::{ForeignSource, StaticForeign};
use crate::ivm::IvmChain;
use crate::match_predicate;
use crate::plan::{self, ExecutionPlan};
use crate::stage::Stage;
use crate::store::ColumnStore;
use crate::value::{RowId, Value};
use external_source::ActiveSource;
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

struct PlanEntry {
    pipeline: Value,
    exec_plan: ExecutionPlan,
    chain: IvmChain,
    last_good_result: Vec<Value>,
}

/// Owns one collection's documents and every pipeline currently streamed
/// against it.
pub struct StreamingCollection {
    store: ColumnStore,
    config: Config,
    plans: IndexMap<String, PlanEntry>,
    foreign: StaticForeign,
    sources: HashMap<uuid::Uuid, ActiveSource>,
    listeners: Vec<Box<dyn FnMut(&Event)>>,
}

impl Default for StreamingCollection {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl StreamingCollection {
    pub fn new(config: Config) -> Self {
        StreamingCollection {
            store: ColumnStore::new(),
            config,
            plans: IndexMap::new(),
            foreign: StaticForeign::new(),
            sources: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Registers a named, fixed snapshot `$lookup` can join against.
    /// Matches this crate's `ForeignSource` assumption that the foreign
    /// collection is immutable for the lifetime of any plan built
    /// against it (spec.md §4.2, "Lookup").
    pub fn register_foreign(&mut self, name: impl Into<String>, docs: Vec<Value>) {
        self.foreign.register(name, docs);
    }

    /// Subscribes a handler invoked synchronously for every event this
    /// collection emits, in emission order. Per spec.md §5, a handler
    /// must not call back into the collection.
    pub fn on_event(&mut self, handler: impl FnMut(&Event) + 'static) {
        self.listeners.push(Box::new(handler));
    }

    fn emit(&mut self, event: Event) {
        for listener in &mut self.listeners {
            listener(&event);
        }
    }

    pub fn count(&self) -> usize {
        self.store.len()
    }

    // ---- mutation -----------------------------------------------------

    pub fn add(&mut self, doc: Value) -> Result<()> {
        self.add_bulk(vec![doc])
    }

    /// Applies every document in `docs`, in order, to the store and to
    /// every active plan before any event fires (spec.md §5: "within one
    /// `addBulk` call, deltas are applied in array order; all plans
    /// observe the same interleaving").
    pub fn add_bulk(&mut self, docs: Vec<Value>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut inserted = Vec::with_capacity(docs.len());
        for doc in docs {
            let row_id = self.store.next_base_id();
            self.store.insert(row_id.clone(), doc.clone());
            inserted.push((row_id, doc));
        }

        let plan_keys: Vec<String> = self.plans.keys().cloned().collect();
        for key in &plan_keys {
            for (row_id, doc) in &inserted {
                self.propagate_add(key, row_id.clone(), doc.clone());
            }
        }

        let total_count = self.count();
        let new_documents: Vec<Value> = inserted.into_iter().map(|(_, d)| d).collect();
        debug!(count = new_documents.len(), total_count, "documents added");
        self.emit(Event::DataAdded { new_documents, total_count });
        self.fire_changed_results(&plan_keys);
        Ok(())
    }

    fn propagate_add(&mut self, plan_key: &str, row_id: RowId, doc: Value) {
        let Some(entry) = self.plans.get_mut(plan_key) else {
            return;
        };
        if let Err(err) = entry.chain.on_add(row_id, doc) {
            warn!(pipeline_key = plan_key, %err, "IVM onAdd failed, rebuilding plan from batch");
            self.recover_plan(plan_key);
        }
    }

    fn propagate_remove(&mut self, plan_key: &str, row_id: RowId) {
        let Some(entry) = self.plans.get_mut(plan_key) else {
            return;
        };
        if let Err(err) = entry.chain.on_remove(row_id) {
            warn!(pipeline_key = plan_key, %err, "IVM onRemove failed, rebuilding plan from batch");
            self.recover_plan(plan_key);
        }
    }

    /// Removes every live document matching `predicate`. Predicates are
    /// evaluated against a stable read-only snapshot first so a failure
    /// partway through never leaves a partial removal (spec.md §6,
    /// "Error surface").
    pub fn remove(&mut self, predicate: impl Fn(&Value) -> bool) -> Vec<Value> {
        let to_remove: Vec<RowId> = self
            .ordered_live()
            .into_iter()
            .filter(|(_, doc)| predicate(doc))
            .map(|(id, _)| id)
            .collect();
        self.remove_ids(to_remove)
    }

    /// Removes every live document matching a `$match`-style query
    /// document. Predicates are evaluated over a read-only snapshot
    /// before any removal happens, so a `TypeMismatch`/`UnknownOperator`
    /// partway through leaves the store untouched.
    pub fn remove_by_query(&mut self, query: &Value) -> Result<Vec<Value>> {
        let Value::Document(pred) = query else {
            return Err(AggError::invalid_pipeline("removeByQuery expects a match-predicate document"));
        };
        let mut to_remove = Vec::new();
        for (id, doc) in self.ordered_live() {
            if match_predicate::matches(&doc, pred)? {
                to_remove.push(id);
            }
        }
        Ok(self.remove_ids(to_remove))
    }

    pub fn remove_by_id(&mut self, id: u64) -> Option<Value> {
        self.remove_ids(vec![RowId::base(id)]).into_iter().next()
    }

    /// Removes the `n` earliest-arrived live documents.
    pub fn remove_first(&mut self, n: usize) -> Vec<Value> {
        let ids: Vec<RowId> = self.ordered_live().into_iter().take(n).map(|(id, _)| id).collect();
        self.remove_ids(ids)
    }

    /// Removes the `n` most-recently-arrived live documents.
    pub fn remove_last(&mut self, n: usize) -> Vec<Value> {
        let live = self.ordered_live();
        let ids: Vec<RowId> = live.into_iter().rev().take(n).map(|(id, _)| id).collect();
        self.remove_ids(ids)
    }

    fn remove_ids(&mut self, ids: Vec<RowId>) -> Vec<Value> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut removed_documents = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(doc) = self.store.remove(id) {
                removed_documents.push(doc);
            }
        }

        let plan_keys: Vec<String> = self.plans.keys().cloned().collect();
        for key in &plan_keys {
            for id in &ids {
                self.propagate_remove(key, id.clone());
            }
        }

        let total_count = self.count();
        let removed_count = removed_documents.len();
        debug!(removed_count, total_count, "documents removed");
        self.emit(Event::DataRemoved {
            removed_documents: removed_documents.clone(),
            removed_count,
            total_count,
        });
        self.fire_changed_results(&plan_keys);
        removed_documents
    }

    fn fire_changed_results(&mut self, plan_keys: &[String]) {
        let live_docs = self.ordered_live();
        let mut updates = Vec::new();
        for key in plan_keys {
            let Some(entry) = self.plans.get_mut(key) else { continue };
            let result = entry.chain.materialize(live_docs.clone());
            if result != entry.last_good_result {
                entry.last_good_result = result.clone();
                updates.push((result, entry.pipeline.clone()));
            }
        }
        for (result, pipeline) in updates {
            self.emit(Event::ResultUpdated { result, pipeline });
        }
    }

    // ---- plan registration ---------------------------------------------

    /// Registers `pipeline` (if not already registered under this exact
    /// pipeline, per spec.md §4.5's canonical-key sharing) and returns
    /// its current materialized result.
    pub fn stream(&mut self, pipeline: Value) -> Result<Vec<Value>> {
        let key = canonical_key(&pipeline);
        if let Some(entry) = self.plans.get(&key) {
            return Ok(entry.last_good_result.clone());
        }

        let exec_plan = plan::compile(&pipeline, &self.config)?;
        let live_docs = self.ordered_live();
        let chain = build_and_replay(&exec_plan.stages, &self.foreign, exec_plan.top_k_bound, &live_docs)?;
        let result = chain.materialize(live_docs.clone());
        trace!(pipeline_key = %key, result_len = result.len(), "pipeline registered");
        self.plans.insert(
            key,
            PlanEntry {
                pipeline,
                exec_plan,
                chain,
                last_good_result: result.clone(),
            },
        );
        Ok(result)
    }

    /// Deregisters `pipeline`, discarding its incremental state.
    pub fn unstream(&mut self, pipeline: &Value) {
        let key = canonical_key(pipeline);
        self.plans.shift_remove(&key);
    }

    /// Returns the last materialized result for `pipeline` without
    /// registering it, if it is already streamed.
    pub fn get_streaming_result(&self, pipeline: &Value) -> Option<Vec<Value>> {
        let key = canonical_key(pipeline);
        self.plans.get(&key).map(|e| e.last_good_result.clone())
    }

    /// Runs `pipeline` once over the collection's current live set with
    /// the non-incremental batch executor, without registering a plan.
    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        let stages = crate::stage::parse_pipeline(pipeline)?;
        let docs: Vec<Value> = self.ordered_live().into_iter().map(|(_, d)| d).collect();
        batch::run(&stages, docs, &self.foreign)
    }

    /// Discards a plan's incremental state and rebuilds it from the
    /// batch executor over the current live set (spec.md §4.3, "Failure
    /// semantics"). If the rebuild itself fails, the plan keeps its last
    /// good result and the failure is logged — the store is never
    /// corrupted either way.
    fn recover_plan(&mut self, plan_key: &str) {
        let Some(entry) = self.plans.get(plan_key) else { return };
        let stages = entry.exec_plan.stages.clone();
        let top_k_bound = entry.exec_plan.top_k_bound;
        let live_docs = self.ordered_live();

        match build_and_replay(&stages, &self.foreign, top_k_bound, &live_docs) {
            Ok(chain) => {
                if let Some(entry) = self.plans.get_mut(plan_key) {
                    entry.chain = chain;
                }
            }
            Err(err) => {
                warn!(pipeline_key = plan_key, %err, "plan rebuild also failed; keeping last good result");
            }
        }
    }

    fn ordered_live(&self) -> Vec<(RowId, Value)> {
        let mut rows: Vec<(RowId, Value)> = self.store.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect();
        rows.sort_by(|(a, _), (b, _)| a.cmp(b));
        rows
    }

    // ---- external event sources -----------------------------------------

    pub fn connect_event_source(&mut self, config: EventSourceConfig) -> EventSourceHandle {
        let id = uuid::Uuid::new_v4();
        self.sources.insert(
            id,
            ActiveSource {
                source: config.source,
                event_name: config.event_name,
                transform: config.transform,
                running: config.auto_start,
            },
        );
        EventSourceHandle(id)
    }

    pub fn disconnect_event_source(&mut self, handle: EventSourceHandle) {
        self.sources.remove(&handle.0);
    }

    /// Drains every running event source, translates each raw event
    /// through its transform (if any), and folds the results into one
    /// `addBulk` call per source. A transform error skips just that
    /// event and emits `TransformError`, per spec.md §5.
    pub fn pump_event_sources(&mut self) -> Result<()> {
        let ids: Vec<uuid::Uuid> = self.sources.iter().filter(|(_, s)| s.running).map(|(id, _)| *id).collect();
        for id in ids {
            self.pump_one_source(id)?;
        }
        Ok(())
    }

    fn pump_one_source(&mut self, id: uuid::Uuid) -> Result<()> {
        let mut batch = Vec::new();
        let mut failures = Vec::new();
        {
            let Some(active) = self.sources.get_mut(&id) else { return Ok(()) };
            while let Some(raw) = active.source.poll() {
                let transformed = match &mut active.transform {
                    Some(f) => f(raw),
                    None => Ok(raw),
                };
                match transformed {
                    Ok(doc) => batch.push(doc),
                    Err(err) => failures.push((err, active.event_name.clone())),
                }
            }
        }
        for (error, event_name) in failures {
            self.emit(Event::TransformError { error, event_name });
        }
        self.add_bulk(batch)
    }
}

fn build_and_replay(
    stages: &[Stage],
    foreign: &dyn ForeignSource,
    top_k_bound: Option<usize>,
    live_docs: &[(RowId, Value)],
) -> Result<IvmChain> {
    let mut chain = IvmChain::build(stages, foreign, top_k_bound)?;
    for (row_id, doc) in live_docs {
        chain.on_add(row_id.clone(), doc.clone())?;
    }
    Ok(chain)
}

/// A canonical key for pipeline sharing (spec.md §4.5): structurally
/// identical pipelines must map to the same key so they share plan
/// state. `Value`'s derived `Debug` is deterministic for a given parse
/// (field order is preserved by the underlying `IndexMap`), which is all
/// "identical pipeline" sharing needs.
fn canonical_key(pipeline: &Value) -> String {
    format!("{pipeline:?}")
}
