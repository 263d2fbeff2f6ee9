//! Unified CLI (`pf`) for the coloring-book order pipeline: exposes the
//! pipeline's operations as subcommands so the system is exercisable
//! without a web framework, the way `casparian`'s launcher layers a clap
//! `Subcommand` enum over one shared `Config`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pf_core::config::Config;
use pf_core::ids::{ColoringVersionId, ImageId, OrderId, SvgVersionId};
use pf_events::{BackgroundTaskGroup, EventDispatcher, HttpSseHub};
use pf_pipeline::actors::{ColoringActor, VectorizeActor};
use pf_pipeline::adapters::{
    FilesystemObjectStore, HttpImageDownloadClient, HttpUpstreamClient, RunpodDiffusionClient, VectorizerHttpClient,
};
use pf_pipeline::ports::{DiffusionClient, ObjectStore, VectorizerClient};
use pf_pipeline::{coloring, download, ingest, recovery, selection, vectorize};
use pf_worker::{Registry, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "pf", about = "Coloring-book order pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch an order from the upstream store and ingest it, then
    /// download whichever source images are already resolvable.
    SyncOrder {
        /// Upstream order number, as the storefront names it.
        order_number: String,
    },

    /// Create and select a new ColoringVersion for an image, then enqueue
    /// it for the worker pool to run through the diffusion backend.
    GenerateColoring {
        #[arg(long)]
        image_id: i64,
        #[arg(long)]
        megapixels: Option<f64>,
        #[arg(long)]
        steps: Option<i32>,
    },

    /// Create and select a new SvgVersion sourced from a completed
    /// ColoringVersion, then enqueue it for vectorization.
    GenerateSvg {
        #[arg(long)]
        image_id: i64,
        #[arg(long)]
        coloring_version_id: i64,
        #[arg(long, default_value = "stacked")]
        shape_stacking: String,
        #[arg(long, default_value = "color")]
        group_by: String,
    },

    /// Create and select a ColoringVersion for every eligible image on an
    /// order, then enqueue each for diffusion.
    GenerateColoringForOrder {
        #[arg(long)]
        order_id: i64,
        #[arg(long)]
        megapixels: Option<f64>,
        #[arg(long)]
        steps: Option<i32>,
    },

    /// Create and select an SvgVersion for every eligible image on an
    /// order, then enqueue each for vectorization.
    GenerateSvgForOrder {
        #[arg(long)]
        order_id: i64,
        #[arg(long, default_value = "stacked")]
        shape_stacking: String,
        #[arg(long, default_value = "color")]
        group_by: String,
    },

    /// Reset a coloring version stuck in Error back to Queued and
    /// re-enqueue it.
    RetryColoring {
        #[arg(long)]
        coloring_version_id: i64,
    },

    /// Reset an svg version stuck in Error back to Queued and re-enqueue
    /// it.
    RetrySvg {
        #[arg(long)]
        svg_version_id: i64,
    },

    /// Point an image's public selection at a specific Completed version.
    Select {
        #[arg(long)]
        image_id: i64,
        #[arg(long)]
        coloring_version_id: Option<i64>,
        #[arg(long)]
        svg_version_id: Option<i64>,
    },

    /// Run the task-queue worker pool (coloring + vectorize actors) until
    /// interrupted.
    Worker {
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Run one boot-recovery pass over every incomplete Order,
    /// ColoringVersion, and SvgVersion.
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration from environment")?;
    let pool = PgPool::connect(&config.database_url).await.context("connecting to the database")?;

    match cli.command {
        Command::SyncOrder { order_number } => sync_order(&pool, &config, &order_number).await?,
        Command::GenerateColoring { image_id, megapixels, steps } => {
            generate_coloring(&pool, &config, ImageId::new(image_id), megapixels, steps).await?
        }
        Command::GenerateSvg { image_id, coloring_version_id, shape_stacking, group_by } => {
            generate_svg(
                &pool,
                &config,
                ImageId::new(image_id),
                ColoringVersionId::new(coloring_version_id),
                &shape_stacking,
                &group_by,
            )
            .await?
        }
        Command::GenerateColoringForOrder { order_id, megapixels, steps } => {
            generate_coloring_for_order(&pool, &config, OrderId::new(order_id), megapixels, steps).await?
        }
        Command::GenerateSvgForOrder { order_id, shape_stacking, group_by } => {
            generate_svg_for_order(&pool, &config, OrderId::new(order_id), &shape_stacking, &group_by).await?
        }
        Command::RetryColoring { coloring_version_id } => {
            retry_coloring(&pool, &config, ColoringVersionId::new(coloring_version_id)).await?
        }
        Command::RetrySvg { svg_version_id } => {
            retry_svg(&pool, &config, SvgVersionId::new(svg_version_id)).await?
        }
        Command::Select { image_id, coloring_version_id, svg_version_id } => {
            select(&pool, &config, ImageId::new(image_id), coloring_version_id, svg_version_id).await?
        }
        Command::Worker { concurrency } => run_worker(pool, config, concurrency).await?,
        Command::Recover => run_recover(&pool, &config).await?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

fn dispatcher(config: &Config) -> (EventDispatcher, Arc<BackgroundTaskGroup>) {
    let hub = Arc::new(HttpSseHub::new(config.sse_hub_url.clone()));
    let group = Arc::new(BackgroundTaskGroup::new());
    let dispatcher = EventDispatcher::new(hub, config.sse_publisher_jwt_secret.clone(), group.clone());
    (dispatcher, group)
}

fn object_store(config: &Config) -> FilesystemObjectStore {
    let root = if config.object_storage_endpoint.is_empty() {
        "./object-storage".to_string()
    } else {
        config.object_storage_endpoint.clone()
    };
    FilesystemObjectStore::new(root, config.object_storage_bucket.clone())
}

async fn sync_order(pool: &PgPool, config: &Config, order_number: &str) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    let upstream = HttpUpstreamClient::new(config.upstream_store_handle.clone(), config.upstream_access_token.clone());
    let outcome =
        ingest::ingest_order(pool, &dispatcher, &upstream, order_number).await.context("ingesting order")?;

    if outcome.has_images_to_download {
        let download_client = HttpImageDownloadClient::new(None);
        let store = object_store(config);
        download::download_pending_images(pool, &dispatcher, &download_client, &store, outcome.order_id)
            .await
            .context("downloading source images")?;
    }

    group.join().await;
    tracing::info!(order_id = outcome.order_id.get(), "order synced");
    Ok(())
}

async fn generate_coloring(
    pool: &PgPool,
    config: &Config,
    image_id: ImageId,
    megapixels: Option<f64>,
    steps: Option<i32>,
) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    let megapixels = megapixels.unwrap_or(config.default_megapixels);
    let steps = steps.unwrap_or(config.default_steps as i32);

    let version_id = selection::create_and_select_coloring_version(pool, &dispatcher, image_id, megapixels, steps)
        .await
        .context("creating coloring version")?;

    let payload = serde_json::json!({ "coloring_version_id": version_id.get() });
    pf_worker::queue::enqueue(pool, "coloring", payload, 5, Duration::from_secs(1), Duration::from_secs(60))
        .await
        .context("enqueuing coloring task")?;

    group.join().await;
    tracing::info!(version_id = version_id.get(), "coloring version enqueued");
    Ok(())
}

async fn generate_svg(
    pool: &PgPool,
    config: &Config,
    image_id: ImageId,
    coloring_version_id: ColoringVersionId,
    shape_stacking: &str,
    group_by: &str,
) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    let version_id =
        selection::create_and_select_svg_version(pool, &dispatcher, image_id, coloring_version_id, shape_stacking, group_by)
            .await
            .context("creating svg version")?;

    let payload = serde_json::json!({ "svg_version_id": version_id.get() });
    pf_worker::queue::enqueue(pool, "vectorize", payload, 5, Duration::from_secs(1), Duration::from_secs(60))
        .await
        .context("enqueuing vectorize task")?;

    group.join().await;
    tracing::info!(version_id = version_id.get(), "svg version enqueued");
    Ok(())
}

async fn generate_coloring_for_order(
    pool: &PgPool,
    config: &Config,
    order_id: OrderId,
    megapixels: Option<f64>,
    steps: Option<i32>,
) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    let megapixels = megapixels.unwrap_or(config.default_megapixels);
    let steps = steps.unwrap_or(config.default_steps as i32);

    let version_ids =
        selection::create_and_select_coloring_versions_for_order(pool, &dispatcher, order_id, megapixels, steps)
            .await
            .context("creating coloring versions for order")?;

    for version_id in &version_ids {
        let payload = serde_json::json!({ "coloring_version_id": version_id.get() });
        pf_worker::queue::enqueue(pool, "coloring", payload, 5, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .context("enqueuing coloring task")?;
    }

    group.join().await;
    tracing::info!(order_id = order_id.get(), count = version_ids.len(), "coloring versions enqueued for order");
    Ok(())
}

async fn generate_svg_for_order(
    pool: &PgPool,
    config: &Config,
    order_id: OrderId,
    shape_stacking: &str,
    group_by: &str,
) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);

    let version_ids =
        selection::create_and_select_svg_versions_for_order(pool, &dispatcher, order_id, shape_stacking, group_by)
            .await
            .context("creating svg versions for order")?;

    for version_id in &version_ids {
        let payload = serde_json::json!({ "svg_version_id": version_id.get() });
        pf_worker::queue::enqueue(pool, "vectorize", payload, 5, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .context("enqueuing vectorize task")?;
    }

    group.join().await;
    tracing::info!(order_id = order_id.get(), count = version_ids.len(), "svg versions enqueued for order");
    Ok(())
}

async fn retry_coloring(pool: &PgPool, config: &Config, coloring_version_id: ColoringVersionId) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    coloring::retry_coloring_version(pool, &dispatcher, coloring_version_id)
        .await
        .context("preparing coloring version for retry")?;

    let payload = serde_json::json!({ "coloring_version_id": coloring_version_id.get() });
    pf_worker::queue::enqueue(pool, "coloring", payload, 5, Duration::from_secs(1), Duration::from_secs(60))
        .await
        .context("enqueuing coloring task")?;

    group.join().await;
    tracing::info!(version_id = coloring_version_id.get(), "coloring version retried");
    Ok(())
}

async fn retry_svg(pool: &PgPool, config: &Config, svg_version_id: SvgVersionId) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    vectorize::retry_svg_version(pool, &dispatcher, svg_version_id)
        .await
        .context("preparing svg version for retry")?;

    let payload = serde_json::json!({ "svg_version_id": svg_version_id.get() });
    pf_worker::queue::enqueue(pool, "vectorize", payload, 5, Duration::from_secs(1), Duration::from_secs(60))
        .await
        .context("enqueuing vectorize task")?;

    group.join().await;
    tracing::info!(version_id = svg_version_id.get(), "svg version retried");
    Ok(())
}

async fn select(
    pool: &PgPool,
    config: &Config,
    image_id: ImageId,
    coloring_version_id: Option<i64>,
    svg_version_id: Option<i64>,
) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);
    match (coloring_version_id, svg_version_id) {
        (Some(v), None) => {
            selection::select_coloring(pool, &dispatcher, image_id, ColoringVersionId::new(v))
                .await
                .context("selecting coloring version")?;
        }
        (None, Some(v)) => {
            selection::select_svg(pool, &dispatcher, image_id, SvgVersionId::new(v))
                .await
                .context("selecting svg version")?;
        }
        _ => anyhow::bail!("pass exactly one of --coloring-version-id or --svg-version-id"),
    }
    group.join().await;
    Ok(())
}

async fn run_worker(pool: PgPool, config: Config, concurrency: usize) -> Result<()> {
    let (dispatcher, _group) = dispatcher(&config);
    let dispatcher = Arc::new(dispatcher);

    let object_store: Arc<dyn ObjectStore> = Arc::new(object_store(&config));
    let diffusion: Arc<dyn DiffusionClient> =
        Arc::new(RunpodDiffusionClient::new(config.diffusion_endpoint.clone(), config.diffusion_api_key.clone()));
    let vectorizer: Arc<dyn VectorizerClient> = Arc::new(VectorizerHttpClient::new(
        config.vectorizer_url.clone(),
        config.vectorizer_api_key.clone(),
        config.vectorizer_api_secret.clone(),
    ));

    let mut registry = Registry::new();
    registry.register(Arc::new(ColoringActor {
        pool: pool.clone(),
        dispatcher: dispatcher.clone(),
        object_store: object_store.clone(),
        diffusion,
        min_image_size: config.min_image_size,
        poll_interval: config.diffusion_poll_interval,
        poll_timeout: config.diffusion_timeout,
    }));
    registry.register(Arc::new(VectorizeActor {
        pool: pool.clone(),
        dispatcher: dispatcher.clone(),
        object_store,
        vectorizer,
    }));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool_task = WorkerPool::new(pool, registry, concurrency);

    tracing::info!(concurrency, "worker pool starting");
    let run_handle = tokio::spawn(pool_task.run(shutdown_rx));
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, draining in-flight tasks");
    let _ = shutdown_tx.send(true);
    run_handle.await.context("joining worker pool")?;
    Ok(())
}

async fn run_recover(pool: &PgPool, config: &Config) -> Result<()> {
    let (dispatcher, group) = dispatcher(config);

    let upstream = HttpUpstreamClient::new(config.upstream_store_handle.clone(), config.upstream_access_token.clone());
    let download_client = HttpImageDownloadClient::new(None);
    let store = object_store(config);
    let diffusion = RunpodDiffusionClient::new(config.diffusion_endpoint.clone(), config.diffusion_api_key.clone());
    let vectorizer = VectorizerHttpClient::new(
        config.vectorizer_url.clone(),
        config.vectorizer_api_key.clone(),
        config.vectorizer_api_secret.clone(),
    );

    let deps = recovery::RecoveryDeps {
        upstream: &upstream,
        download_client: &download_client,
        object_store: &store,
        diffusion: &diffusion,
        vectorizer: &vectorizer,
        min_image_size: config.min_image_size,
        diffusion_poll_interval: config.diffusion_poll_interval,
        diffusion_timeout: config.diffusion_timeout,
    };

    let summary = recovery::run_recovery(pool, &dispatcher, &deps).await.context("running recovery pass")?;
    group.join().await;
    tracing::info!(
        orders = summary.orders,
        coloring_versions = summary.coloring_versions,
        svg_versions = summary.svg_versions,
        skipped = summary.skipped,
        "recovery complete"
    );
    Ok(())
}
