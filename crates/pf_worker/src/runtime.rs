//! Worker pool (C7): OS-thread-per-task-at-a-time pool driving the claim
//! loop. Shape ported from `casparian_worker/src/worker.rs`'s `run()`:
//! poll with a timeout, handle what comes back, keep going; with the ZMQ
//! transport replaced by the Postgres claim queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;

use crate::actor::Actor;
use crate::queue;
use crate::task::Task;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
pub struct Registry {
    actors: HashMap<&'static str, Arc<dyn Actor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, actor: Arc<dyn Actor>) {
        self.actors.insert(actor.name(), actor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Actor>> {
        self.actors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.actors.keys().copied().collect()
    }
}

pub struct WorkerPool {
    pool: PgPool,
    registry: Arc<Registry>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(pool: PgPool, registry: Registry, concurrency: usize) -> Self {
        Self { pool, registry: Arc::new(registry), concurrency, poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs until `shutdown` is set to `true`, then lets every in-flight
    /// actor finish its current task before returning.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let names: Vec<String> = self.registry.names().into_iter().map(str::to_string).collect();
        let mut handles = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let pool = self.pool.clone();
            let registry = self.registry.clone();
            let names = names.clone();
            let poll_interval = self.poll_interval;
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, pool, registry, names, poll_interval, &mut shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    pool: PgPool,
    registry: Arc<Registry>,
    actor_names: Vec<String>,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let names: Vec<&str> = actor_names.iter().map(String::as_str).collect();
    loop {
        if *shutdown.borrow() {
            return;
        }
        match queue::claim(&pool, &names).await {
            Ok(Some(task)) => run_one(worker_id, &pool, &registry, task).await,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "task claim failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

async fn run_one(worker_id: usize, pool: &PgPool, registry: &Registry, task: Task) {
    let Some(actor) = registry.get(&task.actor) else {
        tracing::error!(actor = %task.actor, "claimed task for an unregistered actor");
        let _ = queue::mark_dead_letter(pool, task.id, "no actor registered").await;
        return;
    };

    let result = tokio::time::timeout(actor.timeout(), actor.run(task.payload.clone())).await;
    match result {
        Ok(Ok(())) => {
            if let Err(e) = queue::mark_succeeded(pool, task.id).await {
                tracing::error!(worker_id, task_id = task.id, error = %e, "failed to record success");
            }
        }
        Ok(Err(e)) if actor.is_permanent(&e) => {
            tracing::warn!(worker_id, actor = %task.actor, error = %e, "permanent failure");
            let _ = queue::mark_dead_letter(pool, task.id, &e.to_string()).await;
        }
        Ok(Err(e)) => {
            tracing::warn!(worker_id, actor = %task.actor, error = %e, "transient failure, will retry");
            let _ = queue::retry_or_dead_letter(pool, &task, &e.to_string()).await;
        }
        Err(_elapsed) => {
            tracing::warn!(worker_id, actor = %task.actor, timeout = ?actor.timeout(), "task timed out");
            let _ = queue::retry_or_dead_letter(pool, &task, "task timed out").await;
        }
    }
}
