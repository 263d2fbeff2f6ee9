//! End-to-end pipeline scenarios against a disposable PostgreSQL database,
//! exercising the lock/status-machine plumbing in `coloring`, `vectorize`,
//! `selection`, and `recovery` the way the unit tests embedded in those
//! modules cannot: across real transactions and real row locks.
//!
//! Each test is backed by `#[sqlx::test]`, which provisions a fresh
//! database per test run and applies the migrations below before handing
//! back a `PgPool`; no shared fixture, no manual truncation between runs.
//!
//! Not covered here: webhook HMAC verification (lives above this crate, at
//! the not-yet-built HTTP boundary) and the single-`ListUpdate`-per-batch
//! behavior (already exercised at the `pf_events` unit-test level, where
//! `deferred_batch_events` lives).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use pf_core::ids::{ImageId, OrderId};
use pf_core::{ColoringStatus, OrderStatus, SvgStatus};
use pf_db::store;
use pf_events::{BackgroundTaskGroup, EventDispatcher, SseHub};

use pf_pipeline::coloring;
use pf_pipeline::ports::fake::{
    FakeDiffusionClient, FakeImageDownloadClient, FakeObjectStore, FakeUpstreamClient, FakeVectorizerClient,
};
use pf_pipeline::ports::{UpstreamLineItem, UpstreamOrder};
use pf_pipeline::recovery::{self, RecoveryDeps};
use pf_pipeline::selection;
use pf_pipeline::vectorize;
use pf_pipeline::{download, ingest};

/// Records every published event's topics, so assertions can check which
/// SSE events actually fired without standing up a real hub.
#[derive(Default)]
struct RecordingHub {
    published: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl SseHub for RecordingHub {
    async fn publish(&self, topics: &[String], _body: &str, _bearer_token: &str) -> pf_core::Result<()> {
        self.published.lock().unwrap().push(topics.to_vec());
        Ok(())
    }
}

fn dispatcher() -> (EventDispatcher, Arc<RecordingHub>, Arc<BackgroundTaskGroup>) {
    let hub = Arc::new(RecordingHub::default());
    let group = Arc::new(BackgroundTaskGroup::new());
    let dispatcher = EventDispatcher::new(hub.clone(), "test-publisher-secret", group.clone());
    (dispatcher, hub, group)
}

fn sample_upstream_order(order_number: &str, upstream_id: i64, image_url: &str) -> UpstreamOrder {
    UpstreamOrder {
        upstream_id,
        order_number: order_number.to_string(),
        shopify_order_number: "1001".to_string(),
        customer_email: Some("customer@example.com".to_string()),
        customer_name: Some("Jana Novakova".to_string()),
        payment_status: Some("paid".to_string()),
        shipping_method: Some("standard".to_string()),
        line_items: vec![UpstreamLineItem {
            upstream_line_item_id: 9001,
            title: "Coloring Canvas".to_string(),
            quantity: 1,
            dedication: None,
            layout_tag: None,
            custom_attributes: vec![("Fotka-1".to_string(), image_url.to_string())],
        }],
    }
}

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(w, h, image::Rgb([200, 30, 40]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// S1: a single image runs through ingest -> download -> coloring -> svg
/// without manual intervention, ending with both versions Completed and
/// the image pointing its selection at each.
#[sqlx::test(migrations = "../pf_db/migrations")]
async fn s1_happy_path_single_image(pool: PgPool) {
    let (dispatcher, hub, group) = dispatcher();

    let upstream = FakeUpstreamClient::new();
    upstream.seed(sample_upstream_order("SHOP-1", 1, "https://cdn.example/photo-1.jpg"));

    let outcome = ingest::ingest_order(&pool, &dispatcher, &upstream, "SHOP-1").await.unwrap();
    assert!(outcome.has_images_to_download);

    let download_client = FakeImageDownloadClient::new();
    download_client.serve("https://cdn.example/photo-1.jpg", png_bytes(600, 400));
    let object_store = FakeObjectStore::new("pipeline-test");
    download::download_pending_images(&pool, &dispatcher, &download_client, &object_store, outcome.order_id)
        .await
        .unwrap();

    let order = store::require_order(&pool, outcome.order_id).await.unwrap();
    assert!(matches!(*order.status, OrderStatus::ReadyForReview));

    let line_items = store::list_line_items(&pool, outcome.order_id).await.unwrap();
    let images = store::images_pending_download(&pool, outcome.order_id).await.unwrap();
    assert!(images.is_empty(), "the single image should already have a file_ref");
    let image_id = store::find_image_by_position(&pool, line_items[0].id, 1).await.unwrap().unwrap().id;

    let diffusion = FakeDiffusionClient::new(2, png_bytes(1600, 1200));
    let coloring_version_id = selection::create_and_select_coloring_version(&pool, &dispatcher, image_id, 1.0, 4)
        .await
        .unwrap();
    coloring::process_coloring_version(
        &pool,
        &dispatcher,
        &object_store,
        &diffusion,
        1200,
        Duration::from_millis(1),
        Duration::from_secs(5),
        coloring_version_id,
        false,
    )
    .await
    .unwrap();

    let version = store::require_coloring_version(&pool, coloring_version_id).await.unwrap();
    assert!(matches!(*version.status, ColoringStatus::Completed));
    assert!(version.file_ref.is_some());

    let vectorizer = FakeVectorizerClient::new(b"<svg></svg>".to_vec());
    let svg_version_id =
        selection::create_and_select_svg_version(&pool, &dispatcher, image_id, coloring_version_id, "stacked", "color")
            .await
            .unwrap();
    vectorize::process_svg_version(&pool, &dispatcher, &object_store, &vectorizer, svg_version_id, false)
        .await
        .unwrap();

    let svg = store::require_svg_version(&pool, svg_version_id).await.unwrap();
    assert!(matches!(*svg.status, SvgStatus::Completed));

    let image = store::require_image(&pool, image_id).await.unwrap();
    assert_eq!(image.selected_coloring_id, Some(coloring_version_id));
    assert_eq!(image.selected_svg_id, Some(svg_version_id));

    group.join().await;
    assert!(!hub.published.lock().unwrap().is_empty());
}

/// S2: a ColoringVersion already carrying an `external_job_id` (the
/// worker died mid-poll) must resume polling the same job, never submit a
/// second one.
#[sqlx::test(migrations = "../pf_db/migrations")]
async fn s2_recovery_resumes_an_in_flight_job_without_resubmitting(pool: PgPool) {
    let (dispatcher, _hub, _group) = dispatcher();

    let (image_id, _order_id) = seed_image_with_source(&pool, &dispatcher).await;
    let coloring_version_id =
        selection::create_and_select_coloring_version(&pool, &dispatcher, image_id, 1.0, 4).await.unwrap();

    sqlx::query("UPDATE coloring_versions SET status = $1, external_job_id = $2 WHERE id = $3")
        .bind(ColoringStatus::RunpodSubmitted.as_str())
        .bind("job-already-submitted")
        .bind(coloring_version_id.get())
        .execute(&pool)
        .await
        .unwrap();

    let object_store = FakeObjectStore::new("pipeline-test");
    let submit_calls = Arc::new(AtomicUsize::new(0));
    let diffusion = CountingDiffusionClient { inner: FakeDiffusionClient::new(1, png_bytes(1600, 1200)), submit_calls: submit_calls.clone() };

    coloring::process_coloring_version(
        &pool,
        &dispatcher,
        &object_store,
        &diffusion,
        1200,
        Duration::from_millis(1),
        Duration::from_secs(5),
        coloring_version_id,
        true,
    )
    .await
    .unwrap();

    assert_eq!(submit_calls.load(Ordering::SeqCst), 0, "recovery must not resubmit an already-running job");
    let version = store::require_coloring_version(&pool, coloring_version_id).await.unwrap();
    assert!(matches!(*version.status, ColoringStatus::Completed));
}

/// S3: two concurrent manual selections on the same image both succeed;
/// the image row's lock just serializes them, and whichever commits last
/// wins the final selection; no invariant violation either way.
#[sqlx::test(migrations = "../pf_db/migrations")]
async fn s3_concurrent_selection_is_serialized_not_rejected(pool: PgPool) {
    let (dispatcher, _hub, _group) = dispatcher();

    let (image_id, _order_id) = seed_image_with_source(&pool, &dispatcher).await;
    let object_store = FakeObjectStore::new("pipeline-test");
    let diffusion = FakeDiffusionClient::new(1, png_bytes(1600, 1200));

    let v1 = selection::create_and_select_coloring_version(&pool, &dispatcher, image_id, 1.0, 4).await.unwrap();
    coloring::process_coloring_version(
        &pool, &dispatcher, &object_store, &diffusion, 1200, Duration::from_millis(1), Duration::from_secs(5), v1, false,
    )
    .await
    .unwrap();

    let v2 = selection::create_and_select_coloring_version(&pool, &dispatcher, image_id, 1.0, 4).await.unwrap();
    coloring::process_coloring_version(
        &pool, &dispatcher, &object_store, &diffusion, 1200, Duration::from_millis(1), Duration::from_secs(5), v2, false,
    )
    .await
    .unwrap();

    let pool_a = pool.clone();
    let pool_b = pool.clone();

    let (d1, _, g1) = dispatcher();
    let (d2, _, g2) = dispatcher();
    let select_a = tokio::spawn(async move { selection::select_coloring(&pool_a, &d1, image_id, v1).await });
    let select_b = tokio::spawn(async move { selection::select_coloring(&pool_b, &d2, image_id, v2).await });

    let (ra, rb) = tokio::join!(select_a, select_b);
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();
    g1.join().await;
    g2.join().await;

    let image = store::require_image(&pool, image_id).await.unwrap();
    assert!(
        image.selected_coloring_id == Some(v1) || image.selected_coloring_id == Some(v2),
        "selection must land on one of the two racing versions, never neither"
    );
}

/// S5: a permanently-rejected vectorize call (HTTP 400 equivalent) marks
/// the SvgVersion Error rather than leaving it stuck mid-flight, and the
/// error surfaces as permanent so the task runtime never retries it.
#[sqlx::test(migrations = "../pf_db/migrations")]
async fn s5_permanent_vectorizer_failure_marks_error_not_retry(pool: PgPool) {
    let (dispatcher, _hub, _group) = dispatcher();

    let (image_id, _order_id) = seed_image_with_source(&pool, &dispatcher).await;
    let object_store = FakeObjectStore::new("pipeline-test");
    let diffusion = FakeDiffusionClient::new(1, png_bytes(1600, 1200));
    let coloring_version_id = selection::create_and_select_coloring_version(&pool, &dispatcher, image_id, 1.0, 4)
        .await
        .unwrap();
    coloring::process_coloring_version(
        &pool, &dispatcher, &object_store, &diffusion, 1200, Duration::from_millis(1), Duration::from_secs(5),
        coloring_version_id, false,
    )
    .await
    .unwrap();

    let vectorizer = FakeVectorizerClient::rejecting();
    let svg_version_id =
        selection::create_and_select_svg_version(&pool, &dispatcher, image_id, coloring_version_id, "stacked", "color")
            .await
            .unwrap();
    let result =
        vectorize::process_svg_version(&pool, &dispatcher, &object_store, &vectorizer, svg_version_id, false).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().is_permanent());
    let svg = store::require_svg_version(&pool, svg_version_id).await.unwrap();
    assert!(matches!(*svg.status, SvgStatus::Error));
}

/// A worker crashing between "submitted" and "uploaded" leaves rows the
/// boot recovery pass should pick up and finish, without needing to know
/// in advance which tables had incomplete work.
#[sqlx::test(migrations = "../pf_db/migrations")]
async fn recovery_finishes_orphaned_coloring_and_svg_versions(pool: PgPool) {
    let (dispatcher, _hub, _group) = dispatcher();

    let (image_id, _order_id) = seed_image_with_source(&pool, &dispatcher).await;
    let coloring_version_id = selection::create_and_select_coloring_version(&pool, &dispatcher, image_id, 1.0, 4)
        .await
        .unwrap();
    sqlx::query("UPDATE coloring_versions SET status = $1 WHERE id = $2")
        .bind(ColoringStatus::Processing.as_str())
        .bind(coloring_version_id.get())
        .execute(&pool)
        .await
        .unwrap();

    let upstream = FakeUpstreamClient::new();
    let download_client = FakeImageDownloadClient::new();
    let object_store = FakeObjectStore::new("pipeline-test");
    let diffusion = FakeDiffusionClient::new(1, png_bytes(1600, 1200));
    let vectorizer = FakeVectorizerClient::new(b"<svg></svg>".to_vec());

    let deps = RecoveryDeps {
        upstream: &upstream,
        download_client: &download_client,
        object_store: &object_store,
        diffusion: &diffusion,
        vectorizer: &vectorizer,
        min_image_size: 1200,
        diffusion_poll_interval: Duration::from_millis(1),
        diffusion_timeout: Duration::from_secs(5),
    };

    let summary = recovery::run_recovery(&pool, &dispatcher, &deps).await.unwrap();
    assert_eq!(summary.coloring_versions, 1);

    let version = store::require_coloring_version(&pool, coloring_version_id).await.unwrap();
    assert!(matches!(*version.status, ColoringStatus::Completed));
}

struct CountingDiffusionClient {
    inner: FakeDiffusionClient,
    submit_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl pf_pipeline::ports::DiffusionClient for CountingDiffusionClient {
    async fn submit_job(&self, image: &[u8], megapixels: f64, steps: u32) -> pf_core::Result<String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.submit_job(image, megapixels, steps).await
    }

    async fn poll_job(
        &self,
        job_id: &str,
        timeout: Duration,
        poll_interval: Duration,
        sink: &dyn pf_pipeline::ports::StatusSink,
    ) -> pf_core::Result<pf_pipeline::ports::DiffusionOutcome> {
        self.inner.poll_job(job_id, timeout, poll_interval, sink).await
    }
}

async fn seed_image_with_source(pool: &PgPool, dispatcher: &EventDispatcher) -> (ImageId, OrderId) {
    let upstream = FakeUpstreamClient::new();
    upstream.seed(sample_upstream_order("SHOP-SEED", 4242, "https://cdn.example/seed.jpg"));
    let outcome = ingest::ingest_order(pool, dispatcher, &upstream, "SHOP-SEED").await.unwrap();

    let download_client = FakeImageDownloadClient::new();
    download_client.serve("https://cdn.example/seed.jpg", png_bytes(600, 400));
    let object_store = FakeObjectStore::new("pipeline-test");
    download::download_pending_images(pool, dispatcher, &download_client, &object_store, outcome.order_id)
        .await
        .unwrap();

    let line_items = store::list_line_items(pool, outcome.order_id).await.unwrap();
    let image = store::find_image_by_position(pool, line_items[0].id, 1).await.unwrap().unwrap();
    (image.id, outcome.order_id)
}
