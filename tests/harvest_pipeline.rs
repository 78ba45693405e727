//! End-to-end harvest runs against an in-process fake catalog.

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use sunosync::config::Config;
use sunosync::harvest::{HarvestController, HarvestState};
use sunosync::metadata::{EmbedRequest, IdentityReader, MetadataEmbedder};
use sunosync::progress::{ChannelProgress, NoProgress, ProgressEvent};

const TOKEN: &str = "good-token";

struct FakeCatalog {
    pages: Vec<Vec<Value>>,
    audio_hits: AtomicUsize,
    flaky_failures: AtomicUsize,
    cover: Vec<u8>,
}

async fn feed(
    State(catalog): State<Arc<FakeCatalog>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let expected = format!("Bearer {}", TOKEN);
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if auth != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let page: usize = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let clips = catalog.pages.get(page - 1).cloned().unwrap_or_default();
    Json(json!({ "clips": clips })).into_response()
}

async fn audio(State(catalog): State<Arc<FakeCatalog>>, UrlPath(id): UrlPath<String>) -> Response {
    catalog.audio_hits.fetch_add(1, Ordering::SeqCst);
    format!("audio-bytes-for-{}", id).into_response()
}

async fn flaky(State(catalog): State<Arc<FakeCatalog>>) -> Response {
    let failing = catalog
        .flaky_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    } else {
        "steady".into_response()
    }
}

/// One chunk, then nothing ever again.
async fn stalled() -> Response {
    let first = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"partial")) });
    let body = Body::from_stream(futures::StreamExt::chain(first, futures::stream::pending()));
    body.into_response()
}

async fn cover(State(catalog): State<Arc<FakeCatalog>>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], catalog.cover.clone()).into_response()
}

fn png_cover() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(64, 64, image::Rgb([30, 90, 200]));
    let mut cursor = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut cursor, image::ImageFormat::Png)
        .unwrap();
    cursor.into_inner()
}

/// Start the fake catalog; `pages` receives the server's base URL.
async fn serve(pages: impl FnOnce(&str) -> Vec<Vec<Value>>) -> (String, Arc<FakeCatalog>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let catalog = Arc::new(FakeCatalog {
        pages: pages(&base),
        audio_hits: AtomicUsize::new(0),
        flaky_failures: AtomicUsize::new(1),
        cover: png_cover(),
    });
    let app = Router::new()
        .route("/feed", get(feed))
        .route("/audio/{id}", get(audio))
        .route("/flaky", get(flaky))
        .route("/stalled", get(stalled))
        .route("/cover.png", get(cover))
        .with_state(catalog.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base, catalog)
}

fn clip(base: &str, id: &str, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "display_name": "tester",
        "audio_url": format!("{}/audio/{}", base, id),
        "created_at": "2024-05-01T10:00:00.000Z",
        "metadata": { "tags": "synthwave", "prompt": "night drive" }
    })
}

/// In-memory tag container: identities live in a map keyed by path.
#[derive(Default)]
struct MemoryTags {
    identities: Mutex<HashMap<PathBuf, String>>,
    covers: AtomicUsize,
}

impl MetadataEmbedder for MemoryTags {
    fn embed(&self, path: &Path, request: &EmbedRequest) -> anyhow::Result<()> {
        if request.cover.is_some() {
            self.covers.fetch_add(1, Ordering::SeqCst);
        }
        self.identities
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), request.identity.clone());
        Ok(())
    }

    fn write_lyrics(&self, _path: &Path, _lyrics: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl IdentityReader for MemoryTags {
    fn read_identity(&self, path: &Path) -> Option<String> {
        self.identities.lock().unwrap().get(path).cloned()
    }
}

fn config(base: &str, archive: &Path) -> Config {
    let mut cfg = Config::with_archive(archive);
    cfg.set_token(TOKEN);
    cfg.harvest.catalog_url = format!("{}/feed", base);
    cfg.harvest.page_delay_ms = 0;
    cfg.harvest.retry_delay_secs = 0;
    cfg
}

#[tokio::test]
async fn archives_new_clips_then_skips_them_on_rerun() {
    let (base, catalog) = serve(|base| {
        let mut with_extras = clip(base, "a", "Song A");
        with_extras["image_url"] = json!(format!("{}/cover.png", base));
        with_extras["metadata"]["lyrics"] = json!("[Verse]\nla la");
        let mut silent = clip(base, "c", "Song C");
        silent["audio_url"] = Value::Null;
        vec![vec![with_extras, clip(base, "b", "Song B")], vec![silent]]
    })
    .await;
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("archive");
    let cfg = config(&base, &archive);
    let tags = Arc::new(MemoryTags::default());

    let (sink, mut events) = ChannelProgress::new();
    let first = HarvestController::from_config(&cfg, Arc::new(sink))
        .unwrap()
        .with_tag_store(tags.clone());
    let report = first.run().await.unwrap();

    assert_eq!(report.state, HarvestState::Completed);
    assert_eq!(report.pages_processed, 2);
    assert_eq!(report.summary.archived, 2);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.index_size, 2);
    assert_eq!(
        std::fs::read_to_string(archive.join("Song A.mp3")).unwrap(),
        "audio-bytes-for-a"
    );
    assert!(archive.join("Song B.mp3").exists());
    assert_eq!(
        std::fs::read_to_string(archive.join("Song A.txt")).unwrap(),
        "[Verse]\nla la"
    );
    assert!(!archive.join("Song B.txt").exists());
    assert_eq!(tags.covers.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.audio_hits.load(Ordering::SeqCst), 2);

    let mut thumbnails = 0;
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::ItemArchived { thumbnail: Some(png), .. } = &event {
            assert!(!png.is_empty());
            thumbnails += 1;
        }
    }
    assert_eq!(thumbnails, 1);

    let second = HarvestController::from_config(&cfg, Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(tags.clone());
    let rerun = second.run().await.unwrap();
    assert_eq!(rerun.state, HarvestState::Completed);
    assert_eq!(rerun.existing, 2);
    assert_eq!(rerun.summary.archived, 0);
    assert_eq!(rerun.summary.skipped, 3);
    assert_eq!(catalog.audio_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn colliding_titles_get_version_suffixes() {
    let (base, _catalog) = serve(|base| {
        vec![vec![
            clip(base, "one", "Same Song"),
            clip(base, "two", "Same Song"),
            clip(base, "three", "Same Song"),
        ]]
    })
    .await;
    let tmp = TempDir::new().unwrap();
    let cfg = config(&base, tmp.path());

    let ctl = HarvestController::from_config(&cfg, Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));
    let report = ctl.run().await.unwrap();
    assert_eq!(report.summary.archived, 3);

    let mut bodies: Vec<String> = ["Same Song.mp3", "Same Song v2.mp3", "Same Song v3.mp3"]
        .iter()
        .map(|name| std::fs::read_to_string(tmp.path().join(name)).unwrap())
        .collect();
    bodies.sort();
    assert_eq!(
        bodies,
        vec![
            "audio-bytes-for-one",
            "audio-bytes-for-three",
            "audio-bytes-for-two"
        ]
    );
}

#[tokio::test]
async fn month_folders_when_organizing() {
    let (base, _catalog) = serve(|base| vec![vec![clip(base, "m", "Monthly")]]).await;
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&base, tmp.path());
    cfg.archive.organize_by_month = true;

    let ctl = HarvestController::from_config(&cfg, Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));
    ctl.run().await.unwrap();
    assert!(tmp.path().join("2024-05").join("Monthly.mp3").exists());
}

#[tokio::test]
async fn rejected_token_fails_the_run() {
    let (base, catalog) = serve(|base| vec![vec![clip(base, "a", "Song A")]]).await;
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&base, tmp.path());
    cfg.set_token("stale-token");

    let ctl = HarvestController::from_config(&cfg, Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));
    let report = ctl.run().await.unwrap();
    assert_eq!(report.state, HarvestState::Failed);
    assert!(report.error.unwrap().contains("401"));
    assert_eq!(catalog.audio_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transient_download_error_is_retried() {
    let (base, _catalog) = serve(|base| {
        let mut c = clip(base, "f", "Flaky");
        c["audio_url"] = json!(format!("{}/flaky", base));
        vec![vec![c]]
    })
    .await;
    let tmp = TempDir::new().unwrap();
    let (sink, mut events) = ChannelProgress::new();
    let ctl = HarvestController::from_config(&config(&base, tmp.path()), Arc::new(sink))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));

    let report = ctl.run().await.unwrap();
    assert_eq!(report.summary.archived, 1);
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("Flaky.mp3")).unwrap(),
        "steady"
    );

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::ItemRetry { attempt, max_attempts, .. } = event {
            assert_eq!((attempt, max_attempts), (1, 3));
            retries += 1;
        }
    }
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_item() {
    let (base, _catalog) = serve(|base| {
        let mut broken = clip(base, "x", "Broken");
        broken["audio_url"] = json!(format!("{}/missing", base));
        vec![vec![broken, clip(base, "ok", "Fine")]]
    })
    .await;
    let tmp = TempDir::new().unwrap();
    let ctl = HarvestController::from_config(&config(&base, tmp.path()), Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));

    let report = ctl.run().await.unwrap();
    assert_eq!(report.state, HarvestState::Completed);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.archived, 1);
    assert!(!tmp.path().join("Broken.mp3").exists());
    assert!(!tmp.path().join("Broken.mp3.part").exists());
    assert_eq!(report.index_size, 1);
}

#[tokio::test]
async fn stop_mid_transfer_leaves_no_file_and_no_identity() {
    let (base, _catalog) = serve(|base| {
        let mut c = clip(base, "s", "Stalled");
        c["audio_url"] = json!(format!("{}/stalled", base));
        vec![vec![c]]
    })
    .await;
    let tmp = TempDir::new().unwrap();
    let (sink, mut events) = ChannelProgress::new();
    let ctl = Arc::new(
        HarvestController::from_config(&config(&base, tmp.path()), Arc::new(sink))
            .unwrap()
            .with_tag_store(Arc::new(MemoryTags::default())),
    );

    let running = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.run().await }
    });

    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some(ProgressEvent::ItemDownloading { .. })) => break,
            Ok(Some(_)) => continue,
            other => panic!("download never started: {:?}", other),
        }
    }
    // Let the first chunk land in the partial file.
    tokio::time::sleep(Duration::from_millis(200)).await;
    ctl.cancel_token().cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("run did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.state, HarvestState::Stopped);
    assert_eq!(report.summary.cancelled, 1);
    assert_eq!(report.index_size, 0);
    assert!(!tmp.path().join("Stalled.mp3").exists());
    assert!(!tmp.path().join("Stalled.mp3.part").exists());
    assert_eq!(ctl.state(), HarvestState::Stopped);
}

#[tokio::test]
async fn page_of_idless_clips_does_not_end_the_run() {
    let (base, catalog) = serve(|base| {
        let mut orphan = clip(base, "unused", "No Id");
        orphan.as_object_mut().unwrap().remove("id");
        vec![vec![orphan], vec![clip(base, "p2", "Second Page")]]
    })
    .await;
    let tmp = TempDir::new().unwrap();
    let ctl = HarvestController::from_config(&config(&base, tmp.path()), Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));

    let report = ctl.run().await.unwrap();
    assert_eq!(report.state, HarvestState::Completed);
    assert_eq!(report.pages_processed, 2);
    assert_eq!(report.summary.archived, 1);
    assert!(tmp.path().join("Second Page.mp3").exists());
    assert!(!tmp.path().join("No Id.mp3").exists());
    assert_eq!(catalog.audio_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn long_multibyte_title_is_archived() {
    let title = "夜".repeat(150);
    let (base, _catalog) = serve(|base| vec![vec![clip(base, "cjk", &title)]]).await;
    let tmp = TempDir::new().unwrap();
    let ctl = HarvestController::from_config(&config(&base, tmp.path()), Arc::new(NoProgress))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));

    let report = ctl.run().await.unwrap();
    assert_eq!(report.summary.archived, 1);
    assert_eq!(report.summary.failed, 0);
    let expected = format!("{}.mp3", "夜".repeat(66));
    assert!(tmp.path().join(expected).exists());
}

/// Writes nothing and rejects every embed.
struct BrokenTags;

impl MetadataEmbedder for BrokenTags {
    fn embed(&self, _path: &Path, _request: &EmbedRequest) -> anyhow::Result<()> {
        anyhow::bail!("tag container is read-only")
    }

    fn write_lyrics(&self, _path: &Path, _lyrics: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl IdentityReader for BrokenTags {
    fn read_identity(&self, _path: &Path) -> Option<String> {
        None
    }
}

#[tokio::test]
async fn embed_failure_keeps_file_without_recording_identity() {
    let (base, _catalog) = serve(|base| vec![vec![clip(base, "e", "Untaggable")]]).await;
    let tmp = TempDir::new().unwrap();
    let (sink, mut events) = ChannelProgress::new();
    let ctl = HarvestController::from_config(&config(&base, tmp.path()), Arc::new(sink))
        .unwrap()
        .with_tag_store(Arc::new(BrokenTags));

    let report = ctl.run().await.unwrap();
    assert_eq!(report.state, HarvestState::Completed);
    assert_eq!(report.summary.embed_failed, 1);
    assert_eq!(report.summary.archived, 0);
    assert_eq!(report.summary.failed, 0);
    assert_eq!(report.index_size, 0);
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("Untaggable.mp3")).unwrap(),
        "audio-bytes-for-e"
    );

    let mut embed_failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::EmbedFailed { title, error } => embed_failures.push((title, error)),
            ProgressEvent::ItemFailed { title, .. } => panic!("unexpected failure for {}", title),
            ProgressEvent::ItemArchived { title, .. } => panic!("{} reported as archived", title),
            _ => {}
        }
    }
    assert_eq!(embed_failures.len(), 1);
    assert_eq!(embed_failures[0].0, "Untaggable");
    assert!(embed_failures[0].1.contains("read-only"));
}

#[tokio::test]
async fn local_write_error_is_not_retried() {
    let (base, catalog) = serve(|base| vec![vec![clip(base, "w", "Blocked")]]).await;
    let tmp = TempDir::new().unwrap();
    // A directory where the partial file should go makes `File::create` fail.
    std::fs::create_dir(tmp.path().join("Blocked.mp3.part")).unwrap();
    let (sink, mut events) = ChannelProgress::new();
    let ctl = HarvestController::from_config(&config(&base, tmp.path()), Arc::new(sink))
        .unwrap()
        .with_tag_store(Arc::new(MemoryTags::default()));

    let report = ctl.run().await.unwrap();
    assert_eq!(report.state, HarvestState::Completed);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(catalog.audio_hits.load(Ordering::SeqCst), 1);
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::ItemRetry { title, .. } = event {
            panic!("{} was retried", title);
        }
    }
}
