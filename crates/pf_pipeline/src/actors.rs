//! `pf_worker::Actor` wrappers around the two externally-bound pipeline
//! stages (coloring, vectorize): the only steps worth a durable,
//! retryable task-queue entry rather than a direct call, since they wait
//! on a slow third-party API (the C7/C9 split).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;

use pf_core::ids::{ColoringVersionId, SvgVersionId};
use pf_core::PipelineError;
use pf_events::EventDispatcher;
use pf_worker::Actor;

use crate::ports::{DiffusionClient, ObjectStore, VectorizerClient};
use crate::{coloring, vectorize};

#[derive(Deserialize)]
struct ColoringPayload {
    coloring_version_id: i64,
}

pub struct ColoringActor {
    pub pool: PgPool,
    pub dispatcher: Arc<EventDispatcher>,
    pub object_store: Arc<dyn ObjectStore>,
    pub diffusion: Arc<dyn DiffusionClient>,
    pub min_image_size: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

#[async_trait]
impl Actor for ColoringActor {
    fn name(&self) -> &'static str {
        "coloring"
    }

    fn timeout(&self) -> Duration {
        self.poll_timeout + Duration::from_secs(30)
    }

    async fn run(&self, payload: Value) -> Result<(), PipelineError> {
        let payload: ColoringPayload =
            serde_json::from_value(payload).map_err(|e| PipelineError::Validation(e.to_string()))?;
        coloring::process_coloring_version(
            &self.pool,
            &self.dispatcher,
            self.object_store.as_ref(),
            self.diffusion.as_ref(),
            self.min_image_size,
            self.poll_interval,
            self.poll_timeout,
            ColoringVersionId::new(payload.coloring_version_id),
            false,
        )
        .await
    }
}

#[derive(Deserialize)]
struct VectorizePayload {
    svg_version_id: i64,
}

pub struct VectorizeActor {
    pub pool: PgPool,
    pub dispatcher: Arc<EventDispatcher>,
    pub object_store: Arc<dyn ObjectStore>,
    pub vectorizer: Arc<dyn VectorizerClient>,
}

#[async_trait]
impl Actor for VectorizeActor {
    fn name(&self) -> &'static str {
        "vectorize"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(180)
    }

    async fn run(&self, payload: Value) -> Result<(), PipelineError> {
        let payload: VectorizePayload =
            serde_json::from_value(payload).map_err(|e| PipelineError::Validation(e.to_string()))?;
        vectorize::process_svg_version(
            &self.pool,
            &self.dispatcher,
            self.object_store.as_ref(),
            self.vectorizer.as_ref(),
            SvgVersionId::new(payload.svg_version_id),
            false,
        )
        .await
    }
}
