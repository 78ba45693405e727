//! # sunosync
//!
//! Harvests a generated-audio catalog into a local, tagged archive and keeps
//! a cached index of that archive for browsing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌──────────────┐
//! │ CatalogClient│──▶│ DownloadWorkerPool │──▶│ Id3TagStore  │
//! │ (page n)     │   │ N workers, retry   │   │ tags + cover │
//! └──────┬───────┘   └─────────┬──────────┘   └──────────────┘
//!        │                     │ insert
//!        │              ┌──────▼──────┐
//!  HarvestController    │ DedupIndex  │◀── archive scan at start
//!                       └─────────────┘
//!
//! LibraryScanner ──▶ ScanCache (mtime) ──▶ batches of SongMetadata
//! ```
//!
//! Every stage reports through a [`progress::ProgressSink`].
//!
//! ## Quick Start
//!
//! ```bash
//! sunosync init --archive ~/Music/Suno
//! sunosync config set auth.token eyJ...
//! sunosync harvest
//! sunosync library list --sort title
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and persistence |
//! | [`models`] | Clip and song data types |
//! | [`catalog`] | Paginated catalog client |
//! | [`dedup`] | Identity index of archived clips |
//! | [`archive`] | File naming and layout |
//! | [`download`] | Bounded-concurrency download pool |
//! | [`harvest`] | Run lifecycle and page loop |
//! | [`metadata`] | ID3 tag reading and writing |
//! | [`thumbnail`] | Cover thumbnails for progress events |
//! | [`scan_cache`] | Incremental library scan |
//! | [`library`] | Search, sort, delete, lyrics editing |
//! | [`labels`] | Keep / trash / star labels |
//! | [`progress`] | Progress events and sinks |

pub mod archive;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod download;
pub mod harvest;
pub mod labels;
pub mod library;
pub mod metadata;
pub mod models;
pub mod progress;
pub mod scan_cache;
pub mod thumbnail;
