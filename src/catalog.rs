//! Paginated catalog client.
//!
//! Fetches one page of the user's feed per request:
//!
//! ```text
//! GET {base}?hide_disliked=true&hide_gen_stems=true&hide_studio_clips=true&page={n}
//! Authorization: Bearer {token}
//! ```
//!
//! The body is either a bare JSON array of clips or an object with a `clips`
//! array. An empty list is the natural end of the catalog and is returned as
//! an empty [`CatalogPage`], not as an error. Entries without an id are
//! dropped but still counted, so a page of unusable entries is not mistaken
//! for the end.
//!
//! There is no retry here: HTTP 401 maps to [`CatalogError::AuthExpired`] and
//! every other failure to [`CatalogError::Transient`]. The harvest controller
//! decides what a failed page means for the run.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::models::{ClipMetadata, ClipRecord};

const CATALOG_FILTERS: &str = "hide_disliked=true&hide_gen_stems=true&hide_studio_clips=true";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("token expired or rejected (HTTP 401)")]
    AuthExpired,
    #[error("catalog request failed: {0}")]
    Transient(String),
}

/// One fetched page.
#[derive(Debug, Default)]
pub struct CatalogPage {
    pub clips: Vec<ClipRecord>,
    /// Entries the body listed, including ones dropped for lacking an id.
    pub listed: usize,
}

impl CatalogPage {
    pub fn from_clips(clips: Vec<ClipRecord>) -> Self {
        Self {
            listed: clips.len(),
            clips,
        }
    }

    /// True when the page itself listed nothing: the catalog has run out.
    pub fn is_end(&self) -> bool {
        self.listed == 0
    }
}

/// A source of catalog pages.
///
/// [`CatalogClient`] is the HTTP implementation; tests and alternative
/// front ends can supply their own.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch page `page` (1-based). See [`CatalogPage::is_end`].
    async fn fetch_page(&self, page: u32) -> Result<CatalogPage, CatalogError>;
}

pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl CatalogClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn fetch_page(&self, page: u32) -> Result<CatalogPage, CatalogError> {
        let url = page_url(&self.base_url, page);
        log::debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CatalogError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CatalogError::AuthExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Transient(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CatalogError::Transient(format!("invalid JSON: {}", e)))?;
        parse_page(json)
    }
}

/// Build the request URL for a page.
pub fn page_url(base_url: &str, page: u32) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{}{}{}&page={}", base_url, separator, CATALOG_FILTERS, page)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    List(Vec<RawClip>),
    Wrapped {
        #[serde(default)]
        clips: Vec<RawClip>,
    },
}

#[derive(Deserialize)]
struct RawClip {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    metadata: Option<RawClipMetadata>,
}

#[derive(Deserialize, Default)]
struct RawClipMetadata {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    lyrics: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RawClip {
    fn into_record(self) -> Option<ClipRecord> {
        let id = non_empty(self.id)?;
        let meta = self.metadata.unwrap_or_default();
        Some(ClipRecord {
            id,
            title: non_empty(self.title),
            display_name: non_empty(self.display_name),
            audio_url: non_empty(self.audio_url),
            image_url: non_empty(self.image_url),
            created_at: non_empty(self.created_at),
            metadata: ClipMetadata {
                prompt: non_empty(meta.prompt),
                tags: non_empty(meta.tags),
                lyrics: non_empty(meta.lyrics).or_else(|| non_empty(meta.text)),
            },
        })
    }
}

/// Turn a page body into typed clip records.
///
/// Entries without an identity cannot be deduplicated and are dropped with a
/// warning.
pub fn parse_page(json: serde_json::Value) -> Result<CatalogPage, CatalogError> {
    let body: PageBody = serde_json::from_value(json)
        .map_err(|e| CatalogError::Transient(format!("unexpected page shape: {}", e)))?;
    let raw = match body {
        PageBody::List(clips) => clips,
        PageBody::Wrapped { clips } => clips,
    };

    let listed = raw.len();
    let clips: Vec<ClipRecord> = raw.into_iter().filter_map(RawClip::into_record).collect();
    if clips.len() < listed {
        log::warn!("Dropped {} clip(s) without an id", listed - clips.len());
    }
    Ok(CatalogPage { clips, listed })
}
