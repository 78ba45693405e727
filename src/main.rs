//! # sunosync CLI
//!
//! ## Usage
//!
//! ```bash
//! sunosync --config ./config/sunosync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sunosync init` | Write a default config file |
//! | `sunosync harvest` | Download every clip not yet in the archive |
//! | `sunosync library list` | Scan the archive and print the song table |
//! | `sunosync library delete <path>` | Delete a song and its lyrics sidecar |
//! | `sunosync label <path> <label>` | Toggle a keep / trash / star label |
//! | `sunosync labels` | List labelled songs |
//! | `sunosync lyrics show <path>` | Print a song's lyrics |
//! | `sunosync lyrics save <path> --from <file>` | Replace a song's lyrics |
//! | `sunosync config show` | Print the effective config |
//! | `sunosync config set <key> <value>` | Change a persisted setting |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use sunosync::config::{self, Config};
use sunosync::harvest;
use sunosync::labels::{self, Label};
use sunosync::library::{self, ListOptions, SortKey};
use sunosync::progress::ProgressMode;

/// sunosync: archive a generated-audio catalog with full metadata.
#[derive(Parser)]
#[command(
    name = "sunosync",
    about = "Harvest your generated-audio catalog into a tagged local archive",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sunosync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file.
    ///
    /// Leaves an existing file untouched, so running it twice is safe.
    Init {
        /// Archive directory to record in the new config.
        #[arg(long, default_value = "./Suno_Downloads")]
        archive: PathBuf,
    },

    /// Download every clip that is not already archived.
    ///
    /// Walks the catalog page by page until it runs out, the page limit is
    /// reached, or Ctrl-C is pressed. Overriding flags are saved back to the
    /// config file.
    Harvest {
        /// Bearer token (saved to the config).
        #[arg(long)]
        token: Option<String>,

        /// First page to fetch (1-based).
        #[arg(long)]
        start_page: Option<u32>,

        /// Last page to fetch; 0 for no limit.
        #[arg(long)]
        max_pages: Option<u32>,

        /// File clips into YYYY-MM subfolders.
        #[arg(long)]
        organize: bool,

        /// Skip writing tags and cover art.
        #[arg(long)]
        no_embed: bool,

        /// Progress output (default: human when stderr is a TTY, else off).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Browse and manage archived songs.
    Library {
        #[command(subcommand)]
        action: LibraryAction,
    },

    /// Toggle a label on a song. Applying the current label clears it.
    Label {
        path: PathBuf,
        #[arg(value_enum)]
        label: Label,
    },

    /// List labelled songs.
    Labels,

    /// View or replace a song's lyrics.
    Lyrics {
        #[command(subcommand)]
        action: LyricsAction,
    },

    /// Inspect or change persisted settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum LibraryAction {
    /// Scan the archive (reusing cached metadata) and print the songs.
    List {
        /// Case-insensitive filter on title or artist.
        #[arg(long)]
        search: Option<String>,

        #[arg(long, value_enum, default_value = "date")]
        sort: SortKey,

        /// Flip the sort direction.
        #[arg(long)]
        reverse: bool,

        /// Only songs carrying this label.
        #[arg(long, value_enum)]
        label: Option<Label>,
    },

    /// Delete a song and its lyrics sidecar.
    Delete { path: PathBuf },
}

#[derive(Subcommand)]
enum LyricsAction {
    Show {
        path: PathBuf,
    },
    /// Write lyrics into the tags and sidecar, then verify the read-back.
    Save {
        path: PathBuf,
        /// Text file holding the new lyrics.
        #[arg(long)]
        from: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config with the token masked.
    Show,
    /// Set a dotted key such as `harvest.max_pages`.
    Set { key: String, value: String },
}

fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_secs()
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require an existing config
    if let Commands::Init { archive } = &cli.command {
        init_logging("warn");
        if cli.config.exists() {
            println!("Config already exists: {}", cli.config.display());
        } else {
            config::save_config(&cli.config, &Config::with_archive(archive.clone()))?;
            println!("Wrote {}", cli.config.display());
        }
        return Ok(());
    }

    let mut cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging.level);

    match cli.command {
        Commands::Init { .. } => {
            // Handled above
        }
        Commands::Harvest {
            token,
            start_page,
            max_pages,
            organize,
            no_embed,
            progress,
        } => {
            let mut changed = false;
            if let Some(token) = token {
                cfg.set_token(token);
                changed = true;
            }
            if let Some(page) = start_page {
                cfg.harvest.start_page = page;
                changed = true;
            }
            if let Some(pages) = max_pages {
                cfg.harvest.max_pages = pages;
                changed = true;
            }
            if organize {
                cfg.archive.organize_by_month = true;
                changed = true;
            }
            if no_embed {
                cfg.archive.embed_metadata = false;
                changed = true;
            }
            cfg.validate()?;
            if changed {
                config::save_config_best_effort(&cli.config, &cfg);
            }

            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            harvest::run_harvest(&cfg, progress).await?;
        }
        Commands::Library { action } => match action {
            LibraryAction::List {
                search,
                sort,
                reverse,
                label,
            } => {
                let options = ListOptions {
                    search,
                    sort,
                    reverse,
                    label,
                };
                let sink = Arc::from(ProgressMode::default_for_tty().sink());
                library::run_list(&cfg, &options, sink).await?;
            }
            LibraryAction::Delete { path } => {
                library::run_delete(&path)?;
            }
        },
        Commands::Label { path, label } => {
            labels::run_label(&cfg, &path, label)?;
        }
        Commands::Labels => {
            labels::run_list_labels(&cfg)?;
        }
        Commands::Lyrics { action } => match action {
            LyricsAction::Show { path } => library::run_lyrics_show(&path)?,
            LyricsAction::Save { path, from } => library::run_lyrics_save(&path, &from)?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", config::render_masked(&cfg)?);
            }
            ConfigAction::Set { key, value } => {
                cfg.set_value(&key, &value)?;
                config::save_config(&cli.config, &cfg)?;
                println!("{} updated", key);
            }
        },
    }

    Ok(())
}
