//! Background-task group (C10): a scoped collector for
//! fire-and-forget publish coroutines. Pipeline services must not block
//! inside a record lock on an outbound HTTP POST to the SSE hub, but the
//! process must not exit before that POST lands; so the group tracks
//! every spawned publish and is joined, with a hard timeout, before the
//! owning service method returns.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BackgroundTaskGroup {
    tasks: Mutex<JoinSet<()>>,
    timeout: Duration,
}

impl Default for BackgroundTaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTaskGroup {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { tasks: Mutex::new(JoinSet::new()), timeout }
    }

    pub async fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().await.spawn(fut);
    }

    /// Awaits every spawned task up to the group's timeout; any survivor
    /// past the deadline is cancelled. Individual task panics are logged,
    /// never propagated; a failed SSE publish must never fail the caller.
    pub async fn join(&self) {
        let mut tasks = self.tasks.lock().await;
        let sleep = tokio::time::sleep(self.timeout);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                next = tasks.join_next() => {
                    match next {
                        Some(Ok(())) => continue,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "background publish task panicked");
                            continue;
                        }
                        None => break,
                    }
                }
                _ = &mut sleep => {
                    tracing::warn!("background task group timed out; cancelling survivors");
                    tasks.shutdown().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn joins_all_spawned_tasks() {
        let group = BackgroundTaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            group.spawn(async move { counter.fetch_add(1, Ordering::SeqCst); }).await;
        }
        group.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cancels_survivors_past_the_deadline() {
        let group = BackgroundTaskGroup::with_timeout(Duration::from_millis(50));
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        group
            .spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        group.join().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
