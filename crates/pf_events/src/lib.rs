//! Change-tracking transaction session, event model, SSE dispatch, and the
//! background-task group (C3, C4, C10).

pub mod dispatcher;
pub mod event;
pub mod group;
pub mod hub;
pub mod session;

pub use dispatcher::EventDispatcher;
pub use event::{Event, StatusType};
pub use group::BackgroundTaskGroup;
pub use hub::{sign_publisher_token, HttpSseHub, SseHub};
pub use session::{deferred_batch_events, DeferredBatch, EventContext, TrackedField, TrackedTx};
