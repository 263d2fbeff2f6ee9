//! The dispatcher: signs, retries, and hands publication off to the
//! background-task group so the caller never blocks on the SSE hub.

use std::sync::Arc;
use std::time::Duration;

use crate::event::Event;
use crate::group::BackgroundTaskGroup;
use crate::hub::{sign_publisher_token, SseHub};

const RETRY_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

pub struct EventDispatcher {
    hub: Arc<dyn SseHub>,
    jwt_secret: String,
    group: Arc<BackgroundTaskGroup>,
}

impl EventDispatcher {
    pub fn new(hub: Arc<dyn SseHub>, jwt_secret: impl Into<String>, group: Arc<BackgroundTaskGroup>) -> Self {
        Self { hub, jwt_secret: jwt_secret.into(), group }
    }

    /// Hands one event to the background-task group for fire-and-forget
    /// publication. Never returns an error; publication failures are
    /// logged and swallowed: they must never back-propagate into a
    /// transaction that has already committed.
    pub async fn publish(&self, event: Event) {
        let hub = self.hub.clone();
        let secret = self.jwt_secret.clone();
        self.group
            .spawn(async move {
                if let Err(e) = publish_with_retry(hub.as_ref(), &secret, &event).await {
                    tracing::warn!(error = %e, event = ?event, "event publication failed, dropping");
                }
            })
            .await;
    }

    pub async fn publish_many(&self, events: Vec<Event>) {
        for event in events {
            self.publish(event).await;
        }
    }
}

async fn publish_with_retry(hub: &dyn SseHub, secret: &str, event: &Event) -> pf_core::Result<()> {
    let token = sign_publisher_token(secret)?;
    let body = serde_json::to_string(event)
        .map_err(|e| pf_core::PipelineError::Validation(e.to_string()))?;
    let topics = event.topics();

    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=RETRY_ATTEMPTS {
        match hub.publish(&topics, &body, &token).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                tracing::warn!(attempt, error = %e, "sse publish failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHub {
        fails_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SseHub for FlakyHub {
        async fn publish(&self, _topics: &[String], _body: &str, _token: &str) -> pf_core::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fails_before_success {
                Err(pf_core::PipelineError::UpstreamUnavailable("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn retries_transport_errors_up_to_the_attempt_budget() {
        let hub = Arc::new(FlakyHub { fails_before_success: 2, calls: AtomicUsize::new(0) });
        let group = Arc::new(BackgroundTaskGroup::new());
        let dispatcher = EventDispatcher::new(hub.clone(), "secret", group.clone());
        dispatcher.publish(Event::OrderUpdate { order_id: 1 }).await;
        group.join().await;
        assert_eq!(hub.calls.load(Ordering::SeqCst), 3);
    }
}
