//! Change-tracking session (C3): wraps one database
//! transaction, captures which tracked fields changed, and publishes the
//! corresponding events; but only after the transaction commits.
//!
//! Ported from the source system's SQLAlchemy session subclass that
//! observes attribute writes via `track_changes`/`set_mercure_context`
//! decorators. Rust has no runtime attribute interception, so the tracked
//! fields are a closed enum instead of arbitrary reflected attributes:
//! the same finite set the event model's trigger fields name.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sqlx::{Postgres, Transaction};

use pf_core::{PipelineError, Result};

use crate::dispatcher::EventDispatcher;
use crate::event::{Event, StatusType};

/// The closed set of fields whose writes drive event publication (the
/// "Trigger fields" column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedField {
    OrderStatus,
    OrderPaymentStatus,
    ImageSelectedColoringId,
    ImageSelectedSvgId,
    ImageFileRef,
    ColoringVersionStatus,
    SvgVersionStatus,
}

/// Equality predicates recorded via `set_mercure_context`, narrowed here to
/// the identifiers the event table actually needs (`order_id`, `image_id`,
/// `version_id`, `status_type`) instead of a general predicate list.
#[derive(Debug, Default, Clone)]
pub struct EventContext {
    pub order_id: Option<i64>,
    pub image_id: Option<i64>,
    pub version_id: Option<i64>,
    pub status_type: Option<StatusType>,
    /// The new status string, needed only to build an `ImageStatus` payload.
    pub status_value: Option<String>,
}

impl EventContext {
    pub fn order(order_id: i64) -> Self {
        Self { order_id: Some(order_id), ..Default::default() }
    }

    pub fn image(order_id: i64, image_id: i64) -> Self {
        Self { order_id: Some(order_id), image_id: Some(image_id), ..Default::default() }
    }

    pub fn version_status(
        order_id: i64,
        image_id: i64,
        version_id: i64,
        status_type: StatusType,
        status_value: impl Into<String>,
    ) -> Self {
        Self {
            order_id: Some(order_id),
            image_id: Some(image_id),
            version_id: Some(version_id),
            status_type: Some(status_type),
            status_value: Some(status_value.into()),
        }
    }

    fn require_order(&self) -> Result<i64> {
        self.order_id.ok_or_else(|| PipelineError::context_missing(&["order_id"]))
    }

    fn require_image(&self) -> Result<i64> {
        self.image_id.ok_or_else(|| PipelineError::context_missing(&["image_id"]))
    }

    fn require_version(&self) -> Result<i64> {
        self.version_id.ok_or_else(|| PipelineError::context_missing(&["version_id"]))
    }
}

/// The "EVENT_TRIGGERS" table: which event a tracked-field write produces,
/// given the context gathered so far.
fn triggered_event(field: TrackedField, ctx: &EventContext) -> Result<Event> {
    match field {
        TrackedField::OrderStatus | TrackedField::OrderPaymentStatus => {
            Ok(Event::OrderUpdate { order_id: ctx.require_order()? })
        }
        TrackedField::ImageSelectedColoringId
        | TrackedField::ImageSelectedSvgId
        | TrackedField::ImageFileRef => {
            Ok(Event::ImageUpdate { order_id: ctx.require_order()?, image_id: ctx.require_image()? })
        }
        TrackedField::ColoringVersionStatus | TrackedField::SvgVersionStatus => {
            let status_type =
                if field == TrackedField::ColoringVersionStatus { StatusType::Coloring } else { StatusType::Svg };
            Ok(Event::ImageStatus {
                order_id: ctx.require_order()?,
                image_id: ctx.require_image()?,
                version_id: ctx.require_version()?,
                status_type,
                status: ctx.status_value.clone().unwrap_or_default(),
            })
        }
    }
}

/// Collects OrderUpdate identity keys suppressed by an active deferred
/// batch scope, so the scope can decide whether any aggregate is due.
#[derive(Default)]
pub struct DeferredBatch {
    collected: Mutex<HashSet<i64>>,
}

impl DeferredBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_order(&self, order_id: i64) {
        self.collected.lock().unwrap().insert(order_id);
    }

    fn has_collected_anything(&self) -> bool {
        !self.collected.lock().unwrap().is_empty()
    }
}

/// Runs `body` with a fresh `DeferredBatch`, then publishes at most one
/// `ListUpdate` if anything was collected. On error from `body`, collected
/// events are simply dropped; no aggregate publishes.
pub async fn deferred_batch_events<F, Fut, R>(dispatcher: &EventDispatcher, body: F) -> Result<R>
where
    F: FnOnce(std::sync::Arc<DeferredBatch>) -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    let batch = std::sync::Arc::new(DeferredBatch::new());
    let result = body(batch.clone()).await?;
    if batch.has_collected_anything() {
        dispatcher.publish(Event::ListUpdate).await;
    }
    Ok(result)
}

/// Wraps one open transaction. `track_changes`-style registration is
/// implicit: any `mark_changed` call is itself the registration, since
/// Rust's closed `TrackedField` enum needs no process-wide dedup table.
pub struct TrackedTx<'c> {
    tx: Transaction<'c, Postgres>,
    context: EventContext,
    context_set: bool,
    changed: HashMap<TrackedField, EventContext>,
}

impl<'c> TrackedTx<'c> {
    pub fn new(tx: Transaction<'c, Postgres>) -> Self {
        Self { tx, context: EventContext::default(), context_set: false, changed: HashMap::new() }
    }

    pub fn transaction_mut(&mut self) -> &mut Transaction<'c, Postgres> {
        &mut self.tx
    }

    /// Records the equality predicates this transaction's events will draw
    /// context from. Mirrors `set_mercure_context`; subsequent
    /// tracked writes use whatever context was set most recently.
    pub fn set_mercure_context(&mut self, context: EventContext) {
        self.context = context;
        self.context_set = true;
    }

    /// Registers that `field` changed. Fails with `ContextMissing` if no
    /// context has been set yet; writing a tracked field without first
    /// declaring its context is a development-time contract violation.
    pub fn mark_changed(&mut self, field: TrackedField) -> Result<()> {
        if !self.context_set {
            return Err(PipelineError::context_missing(&["mercure_context"]));
        }
        // Snapshot the context now: a later write of a *different* field
        // with different context must not retroactively change this one's.
        self.changed.insert(field, self.context.clone());
        Ok(())
    }

    /// Commits the transaction, then publishes exactly one event per
    /// distinct identity key among the changed fields (last write wins).
    /// Rolled-back transactions (an `Err` from `f` before this is called)
    /// never reach here, so they never publish; satisfied by construction.
    pub async fn commit(self, dispatcher: &EventDispatcher) -> Result<()> {
        self.commit_inner(dispatcher, None).await
    }

    /// As `commit`, but OrderUpdate events (declared `collect_events` on
    /// ListUpdate) are folded into `batch` instead of publishing; the
    /// batch scope publishes a single ListUpdate at its own exit.
    pub async fn commit_in_batch(self, dispatcher: &EventDispatcher, batch: &DeferredBatch) -> Result<()> {
        self.commit_inner(dispatcher, Some(batch)).await
    }

    async fn commit_inner(self, dispatcher: &EventDispatcher, batch: Option<&DeferredBatch>) -> Result<()> {
        let TrackedTx { tx, changed, .. } = self;
        tx.commit().await.map_err(|e| PipelineError::Database(e.to_string()))?;

        let mut by_identity: HashMap<String, Event> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (field, ctx) in changed {
            let event = triggered_event(field, &ctx)?;
            let key = event.identity_key();
            if !by_identity.contains_key(&key) {
                order.push(key.clone());
            }
            by_identity.insert(key, event);
        }

        for key in order {
            let event = by_identity.remove(&key).expect("key was just inserted");
            if let (Some(batch), Event::OrderUpdate { order_id }) = (batch, &event) {
                if event.is_collected_by_list_update() {
                    batch.collect_order(*order_id);
                    continue;
                }
            }
            dispatcher.publish(event).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_a_field_without_context_fails() {
        // Constructing a TrackedTx needs a live pool connection, so this
        // exercises the context-gate logic directly against the table fn.
        let ctx = EventContext::default();
        assert!(triggered_event(TrackedField::OrderStatus, &ctx).is_err());
    }

    #[test]
    fn order_status_resolves_to_order_update() {
        let ctx = EventContext::order(7);
        let event = triggered_event(TrackedField::OrderStatus, &ctx).unwrap();
        assert_eq!(event.identity_key(), "order:7");
    }

    #[test]
    fn coloring_status_resolves_to_image_status_with_coloring_type() {
        let ctx = EventContext::version_status(1, 2, 3, StatusType::Coloring, "error");
        let event = triggered_event(TrackedField::ColoringVersionStatus, &ctx).unwrap();
        match event {
            Event::ImageStatus { status_type, status, .. } => {
                assert_eq!(status_type, StatusType::Coloring);
                assert_eq!(status, "error");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
