//! Harvest run lifecycle.
//!
//! A [`HarvestController`] drives one run:
//!
//! ```text
//! Idle ──run()──▶ Running ──▶ Completed   catalog exhausted or page limit hit
//!                        ├──▶ Stopped     cancellation observed
//!                        └──▶ Failed      page fetch failed (token expired,
//!                                         transport error)
//! ```
//!
//! Before the first page is requested the archive directory is scanned into a
//! [`DedupIndex`]. Pages are then fetched strictly in order and each page's
//! clips go through one [`DownloadWorkerPool`] batch; the next page is only
//! requested once every item of the current page has finished. Between pages
//! the controller waits `page_delay_ms`, cancellable.
//!
//! A controller runs once. Start a new one for a new run; it re-scans the
//! archive, so clips archived earlier are skipped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogClient, CatalogSource};
use crate::config::Config;
use crate::dedup::DedupIndex;
use crate::download::{BatchSummary, DownloadSettings, DownloadWorkerPool};
use crate::metadata::{Id3TagStore, IdentityReader, MetadataEmbedder};
use crate::progress::{ProgressEvent, ProgressMode, ProgressSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestState {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl HarvestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestState::Idle => "idle",
            HarvestState::Running => "running",
            HarvestState::Completed => "completed",
            HarvestState::Stopped => "stopped",
            HarvestState::Failed => "failed",
        }
    }

    /// Short status word for a status bar.
    pub fn status_word(&self) -> &'static str {
        match self {
            HarvestState::Idle => "Ready",
            HarvestState::Running => "Downloading",
            HarvestState::Completed => "Complete",
            HarvestState::Stopped => "Stopped",
            HarvestState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HarvestState::Completed | HarvestState::Stopped | HarvestState::Failed
        )
    }
}

impl std::fmt::Display for HarvestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a run could not start.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HarvestError {
    #[error("no token configured; set [auth] token or pass --token")]
    MissingCredential,
    #[error("this harvest has already been started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub state: HarvestState,
    /// Identities found in the archive before the run.
    pub existing: usize,
    /// Non-empty pages whose items were dispatched.
    pub pages_processed: u32,
    pub summary: BatchSummary,
    /// Identities known at the end of the run.
    pub index_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pagination bounds for one run.
#[derive(Debug, Clone, Copy)]
pub struct PageBounds {
    pub start_page: u32,
    /// Last page to fetch; `0` for no limit.
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl PageBounds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            start_page: config.harvest.start_page.max(1),
            max_pages: config.harvest.max_pages,
            page_delay: Duration::from_millis(config.harvest.page_delay_ms),
        }
    }

    fn past_limit(&self, page: u32) -> bool {
        self.max_pages > 0 && page > self.max_pages
    }
}

pub struct HarvestController {
    catalog: Arc<dyn CatalogSource>,
    token: Option<String>,
    settings: DownloadSettings,
    bounds: PageBounds,
    http: reqwest::Client,
    embedder: Arc<dyn MetadataEmbedder>,
    identities: Arc<dyn IdentityReader>,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<HarvestState>,
    cancel: CancellationToken,
}

impl HarvestController {
    /// Controller over an arbitrary catalog source, tagging with ID3v2.
    pub fn new(
        config: &Config,
        catalog: Arc<dyn CatalogSource>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.harvest.request_timeout_secs))
            .read_timeout(Duration::from_secs(config.harvest.download_timeout_secs))
            .build()?;
        let store = Arc::new(Id3TagStore);
        Ok(Self {
            catalog,
            token: config.token().map(str::to_string),
            settings: DownloadSettings::from_config(config),
            bounds: PageBounds::from_config(config),
            http,
            embedder: store.clone(),
            identities: store,
            sink,
            state: Mutex::new(HarvestState::Idle),
            cancel: CancellationToken::new(),
        })
    }

    /// Controller over the HTTP catalog named in `config`.
    pub fn from_config(config: &Config, sink: Arc<dyn ProgressSink>) -> Result<Self> {
        let catalog = CatalogClient::new(
            &config.harvest.catalog_url,
            config.token().unwrap_or_default(),
            Duration::from_secs(config.harvest.request_timeout_secs),
        )?;
        Self::new(config, Arc::new(catalog), sink)
    }

    /// Replace the tag backend used for both embedding and identity reads.
    pub fn with_tag_store<T>(mut self, store: Arc<T>) -> Self
    where
        T: MetadataEmbedder + IdentityReader + 'static,
    {
        self.embedder = store.clone();
        self.identities = store;
        self
    }

    /// Token observed by the page loop and every worker. Cancelling it
    /// requests a stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> HarvestState {
        *self.lock_state()
    }

    /// Run the harvest to a terminal state.
    ///
    /// Returns `Err` only when the run cannot start; everything that goes
    /// wrong after that is reported through [`HarvestReport::state`].
    pub async fn run(&self) -> Result<HarvestReport, HarvestError> {
        let token = self.token.clone().ok_or(HarvestError::MissingCredential)?;
        {
            let mut state = self.lock_state();
            if *state != HarvestState::Idle {
                return Err(HarvestError::AlreadyStarted);
            }
            *state = HarvestState::Running;
        }

        let mut report = HarvestReport {
            state: HarvestState::Running,
            existing: 0,
            pages_processed: 0,
            summary: BatchSummary::default(),
            index_size: 0,
            error: None,
        };

        match self.build_index().await {
            Ok(index) => {
                report.existing = index.len();
                let pool = DownloadWorkerPool::new(
                    self.settings.clone(),
                    self.http.clone(),
                    &token,
                    Arc::new(index),
                    self.embedder.clone(),
                    self.sink.clone(),
                );
                let state = self.page_loop(&pool, &mut report).await;
                report.state = state;
                report.index_size = pool.index().len();
            }
            Err(e) => {
                report.state = HarvestState::Failed;
                report.error = Some(format!("{:#}", e));
            }
        }

        *self.lock_state() = report.state;
        self.sink.report(ProgressEvent::RunFinished {
            state: report.state.as_str().to_string(),
            message: finish_message(&report),
        });
        log::info!(
            "Harvest {}: {} archived, {} skipped, {} failed",
            report.state,
            report.summary.archived,
            report.summary.skipped,
            report.summary.failed
        );
        Ok(report)
    }

    async fn build_index(&self) -> Result<DedupIndex> {
        let root = self.settings.archive_root.clone();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            anyhow::anyhow!("cannot create archive directory {}: {}", root.display(), e)
        })?;

        self.sink.report(ProgressEvent::IndexBuilding {
            directory: root.clone(),
        });
        let reader = self.identities.clone();
        let index =
            tokio::task::spawn_blocking(move || DedupIndex::build(&root, reader.as_ref())).await?;
        self.sink.report(ProgressEvent::IndexBuilt {
            existing: index.len(),
        });
        Ok(index)
    }

    async fn page_loop(&self, pool: &DownloadWorkerPool, report: &mut HarvestReport) -> HarvestState {
        let mut page = self.bounds.start_page;
        loop {
            if self.cancel.is_cancelled() {
                return HarvestState::Stopped;
            }
            if self.bounds.past_limit(page) {
                self.sink.report(ProgressEvent::PageLimitReached {
                    max_pages: self.bounds.max_pages,
                });
                return HarvestState::Completed;
            }

            self.sink.report(ProgressEvent::PageStarted { page });
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return HarvestState::Stopped,
                fetched = self.catalog.fetch_page(page) => fetched,
            };
            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(e) => {
                    log::warn!("Page {} failed: {}", page, e);
                    report.error = Some(e.to_string());
                    return HarvestState::Failed;
                }
            };
            if fetched.is_end() {
                self.sink.report(ProgressEvent::CatalogExhausted { page });
                return HarvestState::Completed;
            }

            let summary = pool.run_batch(fetched.clips, &self.cancel).await;
            report.summary.merge(&summary);
            report.pages_processed += 1;

            page += 1;
            tokio::select! {
                _ = self.cancel.cancelled() => return HarvestState::Stopped,
                _ = tokio::time::sleep(self.bounds.page_delay) => {}
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HarvestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `sunosync harvest`: run until a terminal state and print the summary.
///
/// Ctrl-C requests a cooperative stop. A run that ends `Failed` is returned
/// as an error so the process exits non-zero.
pub async fn run_harvest(config: &Config, progress: ProgressMode) -> Result<()> {
    let sink: Arc<dyn ProgressSink> = Arc::from(progress.sink());
    let controller = HarvestController::from_config(config, sink)?;

    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Stop requested; letting in-flight items wind down");
            cancel.cancel();
        }
    });

    let report = controller.run().await?;
    print_report(&report);

    if report.state == HarvestState::Failed {
        bail!(
            "harvest failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_report(report: &HarvestReport) {
    let summary = &report.summary;
    println!("harvest {}", report.state);
    println!("  already archived: {}", report.existing);
    println!("  pages: {}", report.pages_processed);
    println!("  archived: {}", summary.archived);
    println!("  skipped: {}", summary.skipped);
    println!("  failed: {}", summary.failed);
    if summary.embed_failed > 0 {
        println!("  metadata errors: {}", summary.embed_failed);
    }
    if summary.cancelled > 0 {
        println!("  cancelled: {}", summary.cancelled);
    }
    println!("{}", report.state.status_word());
}

fn finish_message(report: &HarvestReport) -> String {
    match report.state {
        HarvestState::Completed => format!(
            "Download Complete! {} new, {} skipped, {} failed.",
            report.summary.downloaded(),
            report.summary.skipped,
            report.summary.failed
        ),
        HarvestState::Stopped => "Download Stopped.".to_string(),
        HarvestState::Failed => format!(
            "Error: {}",
            report.error.as_deref().unwrap_or("harvest failed")
        ),
        HarvestState::Idle | HarvestState::Running => report.state.status_word().to_string(),
    }
}
