//! Bounded-concurrency download pool.
//!
//! Takes the clips of one catalog page and archives each one that is not
//! already in the [`DedupIndex`]:
//!
//! 1. skip known identities and clips without audio,
//! 2. claim a collision-free destination path,
//! 3. stream the payload to `<dest>.part` and rename it into place, retrying
//!    the whole transfer from byte zero with a fixed delay,
//! 4. write the lyrics sidecar and tags,
//! 5. record the identity and report success.
//!
//! At most `workers` clips are in flight at once. A cancelled transfer
//! removes its partial file and never reaches the destination path.
//!
//! Item failures are reported through the [`ProgressSink`] and counted in the
//! [`BatchSummary`]; they never fail the batch.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::archive::{lyrics_sidecar_path, partial_path, preferred_path, target_dir, PathClaims};
use crate::config::Config;
use crate::dedup::DedupIndex;
use crate::metadata::{embed_request_for, MetadataEmbedder};
use crate::models::{ArchiveEntry, ClipRecord};
use crate::progress::{ProgressEvent, ProgressSink, SkipReason};
use crate::thumbnail::make_thumbnail;

/// Worker-pool knobs, resolved from [`Config`] once per run.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub archive_root: PathBuf,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub embed_metadata: bool,
    pub organize_by_month: bool,
    pub write_lyrics_sidecar: bool,
    pub thumbnail_size: u32,
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            archive_root: config.archive.path.clone(),
            workers: config.harvest.workers.max(1),
            max_attempts: config.harvest.max_attempts.max(1),
            retry_delay: Duration::from_secs(config.harvest.retry_delay_secs),
            request_timeout: Duration::from_secs(config.harvest.request_timeout_secs),
            embed_metadata: config.archive.embed_metadata,
            organize_by_month: config.archive.organize_by_month,
            write_lyrics_sidecar: config.archive.write_lyrics_sidecar,
            thumbnail_size: config.harvest.thumbnail_size,
        }
    }
}

/// What happened to one clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Skipped(SkipReason),
    Archived(ArchiveEntry),
    /// Downloaded, but the sidecar or tags could not be written. The file
    /// stays; the identity is not recorded.
    EmbedFailed { entry: ArchiveEntry, error: String },
    Failed(String),
    Cancelled,
}

/// Per-batch (and, merged, per-run) outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub archived: usize,
    pub skipped: usize,
    pub failed: usize,
    pub embed_failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Archived(_) => self.archived += 1,
            ItemOutcome::EmbedFailed { .. } => self.embed_failed += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
            ItemOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Add another batch's counts to these.
    pub fn merge(&mut self, other: &BatchSummary) {
        self.archived += other.archived;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.embed_failed += other.embed_failed;
        self.cancelled += other.cancelled;
    }

    /// Files that landed on disk this batch.
    pub fn downloaded(&self) -> usize {
        self.archived + self.embed_failed
    }
}

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// Writing the local file failed; another attempt cannot help.
    #[error("local file: {0}")]
    Local(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct DownloadWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    settings: DownloadSettings,
    http: reqwest::Client,
    token: String,
    index: Arc<DedupIndex>,
    embedder: Arc<dyn MetadataEmbedder>,
    sink: Arc<dyn ProgressSink>,
    claims: PathClaims,
    permits: Arc<Semaphore>,
}

impl DownloadWorkerPool {
    /// A pool of `settings.workers` concurrent transfers sharing `index`.
    pub fn new(
        settings: DownloadSettings,
        http: reqwest::Client,
        token: &str,
        index: Arc<DedupIndex>,
        embedder: Arc<dyn MetadataEmbedder>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                settings,
                http,
                token: token.to_string(),
                index,
                embedder,
                sink,
                claims: PathClaims::new(),
                permits,
            }),
        }
    }

    /// The shared dedup index, including identities added this run.
    pub fn index(&self) -> &Arc<DedupIndex> {
        &self.inner.index
    }

    /// Archive every clip in `clips` and wait until all of them finish.
    ///
    /// Dispatch stops as soon as `cancel` fires; clips already running see
    /// the same token and abandon their transfer.
    pub async fn run_batch(&self, clips: Vec<ClipRecord>, cancel: &CancellationToken) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut tasks = JoinSet::new();

        for clip in clips {
            if cancel.is_cancelled() {
                summary.cancelled += 1;
                continue;
            }
            let pool = self.clone();
            let cancel = cancel.clone();
            let permits = self.inner.permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return ItemOutcome::Cancelled;
                };
                pool.process(clip, &cancel).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    log::error!("Download task ended abnormally: {}", e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Archive a single clip.
    pub async fn process(&self, clip: ClipRecord, cancel: &CancellationToken) -> ItemOutcome {
        let inner = &self.inner;
        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        let title = clip.display_title().to_string();
        if inner.index.contains(&clip.id) {
            inner.sink.report(ProgressEvent::ItemSkipped {
                title,
                reason: SkipReason::AlreadyArchived,
            });
            return ItemOutcome::Skipped(SkipReason::AlreadyArchived);
        }
        let Some(audio_url) = clip.audio_url.clone() else {
            inner.sink.report(ProgressEvent::ItemSkipped {
                title,
                reason: SkipReason::NoAudio,
            });
            return ItemOutcome::Skipped(SkipReason::NoAudio);
        };

        let dir = target_dir(
            &inner.settings.archive_root,
            &clip,
            inner.settings.organize_by_month,
        );
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            let error = format!("cannot create {}: {}", dir.display(), e);
            inner.sink.report(ProgressEvent::ItemFailed {
                title,
                error: error.clone(),
            });
            return ItemOutcome::Failed(error);
        }
        let path = inner.claims.claim(&preferred_path(&dir, &clip));

        let cover = match &clip.image_url {
            Some(url) => self.fetch_cover(url).await,
            None => None,
        };
        let thumbnail = cover
            .as_deref()
            .and_then(|bytes| make_thumbnail(bytes, inner.settings.thumbnail_size));
        inner.sink.report(ProgressEvent::ItemDownloading {
            title: title.clone(),
            thumbnail: thumbnail.clone(),
        });

        match self.download_with_retry(&audio_url, &path, &title, cancel).await {
            Ok(()) => {}
            Err(TransferError::Cancelled) => {
                inner.claims.release(&path);
                inner.sink.report(ProgressEvent::ItemCancelled { title });
                return ItemOutcome::Cancelled;
            }
            Err(e) => {
                inner.claims.release(&path);
                let error = e.to_string();
                inner.sink.report(ProgressEvent::ItemFailed {
                    title,
                    error: error.clone(),
                });
                return ItemOutcome::Failed(error);
            }
        }

        match self.finish(&clip, &path, cover).await {
            Ok(entry) => {
                inner.index.insert(&clip.id);
                inner.sink.report(ProgressEvent::ItemArchived {
                    title,
                    path: entry.path.clone(),
                    thumbnail,
                });
                ItemOutcome::Archived(entry)
            }
            Err((entry, error)) => {
                inner.sink.report(ProgressEvent::EmbedFailed {
                    title,
                    error: error.clone(),
                });
                ItemOutcome::EmbedFailed { entry, error }
            }
        }
    }

    async fn download_with_retry(
        &self,
        url: &str,
        path: &Path,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let max_attempts = self.inner.settings.max_attempts;
        let mut attempt = 1;
        loop {
            match self.transfer(url, path, cancel).await {
                Ok(()) => return Ok(()),
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e @ TransferError::Local(_)) => return Err(e),
                Err(e) if attempt < max_attempts => {
                    log::debug!("Attempt {} for '{}' failed: {}", attempt, title, e);
                    self.inner.sink.report(ProgressEvent::ItemRetry {
                        title: title.to_string(),
                        attempt,
                        max_attempts,
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(self.inner.settings.retry_delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: stream into the partial file, then move it into place.
    async fn transfer(
        &self,
        url: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let part = partial_path(path);
        let streamed = self.stream_to(url, &part, cancel).await;
        let result = match streamed {
            Ok(()) => tokio::fs::rename(&part, path).await.map_err(TransferError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
        }
        result
    }

    async fn stream_to(
        &self,
        url: &str,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let request = self.inner.http.get(url).bearer_auth(&self.inner.token);
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = request.send() => sent?.error_for_status()?,
        };

        let mut file = tokio::fs::File::create(part).await?;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn fetch_cover(&self, url: &str) -> Option<Vec<u8>> {
        let response = self
            .inner
            .http
            .get(url)
            .bearer_auth(&self.inner.token)
            .timeout(self.inner.settings.request_timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            log::debug!("Cover fetch {} returned {}", url, response.status());
            return None;
        }
        response.bytes().await.ok().map(|b| b.to_vec())
    }

    /// Sidecar and tags for a downloaded file.
    async fn finish(
        &self,
        clip: &ClipRecord,
        path: &Path,
        cover: Option<Vec<u8>>,
    ) -> Result<ArchiveEntry, (ArchiveEntry, String)> {
        let settings = &self.inner.settings;
        let mut entry = ArchiveEntry {
            path: path.to_path_buf(),
            identity: clip.id.clone(),
            has_cover: false,
            lyrics_sidecar: None,
        };

        if settings.write_lyrics_sidecar {
            if let Some(lyrics) = &clip.metadata.lyrics {
                let sidecar = lyrics_sidecar_path(path);
                if let Err(e) = tokio::fs::write(&sidecar, lyrics).await {
                    return Err((entry, format!("lyrics sidecar: {}", e)));
                }
                entry.lyrics_sidecar = Some(sidecar);
            }
        }

        if settings.embed_metadata {
            let has_cover = cover.is_some();
            let request = embed_request_for(clip, cover);
            let embedder = self.inner.embedder.clone();
            let target = path.to_path_buf();
            let embedded =
                tokio::task::spawn_blocking(move || embedder.embed(&target, &request)).await;
            match embedded {
                Ok(Ok(())) => entry.has_cover = has_cover,
                Ok(Err(e)) => return Err((entry, format!("{:#}", e))),
                Err(e) => return Err((entry, e.to_string())),
            }
        }

        Ok(entry)
    }
}
