//! TileQuota operator CLI
//!
//! Offline tools for the disk quota engine:
//!
//! - `layout` prints the page geometry of every configured gridset
//! - `inspect` decodes a persisted page file in eviction order

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tilequota::adapters::FilePageStore;
use tilequota::domain::ports::TileLayer;
use tilequota::paging::{ExpirationStrategy, PagePyramid, TilePage};
use tilequota::DiskQuotaConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// TileQuota - paged disk quota engine for tile caches
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print tiles per page and pages per level for configured gridsets
    Layout {
        /// Disk quota configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Only show this layer
        #[arg(long)]
        layer: Option<String>,
    },

    /// Print the records of a page file in eviction order
    Inspect {
        /// Page file to decode
        file: PathBuf,

        /// Expiration order (LRU, LFU, FIFO)
        #[arg(long, default_value = "LRU")]
        strategy: String,

        /// Print at most this many pages
        #[arg(long)]
        limit: Option<usize>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    match args.command {
        Command::Layout { config, layer } => layout(&config, layer.as_deref()),
        Command::Inspect {
            file,
            strategy,
            limit,
        } => inspect(&file, &strategy, limit).await,
    }
}

fn layout(config_path: &std::path::Path, only: Option<&str>) -> Result<()> {
    let config = DiskQuotaConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let layers: Vec<_> = config
        .layers
        .iter()
        .filter(|l| only.map_or(true, |name| l.name == name))
        .collect();
    if layers.is_empty() {
        anyhow::bail!("no matching layer in {}", config_path.display());
    }

    for layer_config in layers {
        let quota = layer_config
            .quota
            .map_or_else(|| "none".to_string(), |q| q.to_string());
        println!("layer {} (quota: {})", layer_config.name, quota);

        let layer = layer_config.build_layer();
        for subset in layer.grid_subsets() {
            let pyramid = PagePyramid::new(layer.name(), &subset)
                .with_context(|| format!("gridset {}", subset.id()))?;

            println!("  gridset {} ({} pages)", pyramid.gridset_id(), pyramid.total_pages());
            println!(
                "    {:>4}  {:>20}  {:>12}  {:>14}  {:>12}",
                "zoom", "tiles", "tiles/page", "pages", "pages/level"
            );
            for level in pyramid.levels() {
                println!(
                    "    {:>4}  {:>20}  {:>12}  {:>14}  {:>12}",
                    level.zoom,
                    format!(
                        "{}x{}",
                        level.coverage.tiles_wide(),
                        level.coverage.tiles_high()
                    ),
                    format!("{}x{}", level.tiles_per_page_x, level.tiles_per_page_y),
                    format!("{}x{}", level.pages_x, level.pages_y),
                    level.pages_per_level(),
                );
            }
        }
    }
    Ok(())
}

async fn inspect(file: &std::path::Path, strategy: &str, limit: Option<usize>) -> Result<()> {
    let strategy: ExpirationStrategy = strategy.parse()?;
    let records = FilePageStore::read_file(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    debug!(records = records.len(), "Decoded page file");

    // file order is creation order
    let mut pages: Vec<TilePage> = records
        .iter()
        .enumerate()
        .map(|(seq, record)| TilePage::from_record(record).with_sequence(seq as u64))
        .collect();
    strategy.sort_pages(&mut pages);

    println!(
        "{:>5}  {:>16}  {:>12}  {:>10}  {:>12}",
        "rank", "page", "hits", "tiles", "last access"
    );
    for (rank, page) in pages.iter().take(limit.unwrap_or(usize::MAX)).enumerate() {
        println!(
            "{:>5}  {:>16}  {:>12}  {:>10}  {:>12}",
            rank + 1,
            page.index().to_string(),
            page.num_hits(),
            page.num_tiles_in_page(),
            page.last_access_minutes(),
        );
    }

    let hits: u64 = pages.iter().map(TilePage::num_hits).sum();
    let tiles: i64 = pages.iter().map(TilePage::num_tiles_in_page).sum();
    println!(
        "{} pages, {} hits, {} tiles ({} order)",
        pages.len(),
        hits,
        tiles,
        strategy.name()
    );
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // logs go to stderr so command output stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
