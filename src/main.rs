use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use radio_match::catalog::SongQuery;
use radio_match::collab::{split_collaboration, word_groupings};
use radio_match::config::EngineConfig;
use radio_match::engine::{pending_id_for, CancelToken, Engine, IngestOutcome};
use radio_match::matcher::JsonLibrary;
use radio_match::models::{PlayOutcome, ScrapedPlay};
use radio_match::normalize::{normalize_artist, normalize_title};
use radio_match::overrides::OverrideTable;
use radio_match::progress::{create_spinner, format_duration, init_logging, set_log_only};

#[derive(Parser)]
#[command(name = "radio-match")]
#[command(about = "Resolve scraped radio plays to canonical artists and match them against a media library")]
struct Args {
    /// Catalog database (defaults to catalog.path from the config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hide progress bars and log progress lines instead
    #[arg(long, global = true)]
    log_only: bool,

    #[arg(long, global = true, default_value = "0")]
    workers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the display form and comparison key of a title (or artist)
    Normalize {
        text: String,
        #[arg(long)]
        artist: bool,
    },
    /// Show the candidate groupings for an artist credit
    Split { artist: String },
    /// Ingest scraped plays from a JSON-lines file
    Ingest { plays: PathBuf },
    /// Retry resolution of PENDING artists
    RetryPending {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Match the most played songs against a library export
    Match {
        #[arg(long)]
        library: PathBuf,
        /// Trailing window in days
        #[arg(long, default_value = "7")]
        days: i64,
        #[arg(long)]
        station: Option<String>,
        #[arg(long, default_value = "100")]
        limit: usize,
        #[arg(long, default_value = "1")]
        min_plays: i64,
        /// Write build statistics as JSON
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },
    /// Delete PENDING artists not seen within catalog.pending_max_age_days
    Cleanup,
    /// Print catalog counts
    Stats,
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path)),
        None => Ok(EngineConfig::default()),
    }
}

fn open_engine(args: &Args, config: &EngineConfig) -> Result<Engine> {
    let db = args.db.clone().unwrap_or_else(|| config.catalog.path.clone());
    info!(db = %db.display(), "opening catalog");
    Engine::open(&db, config, now()).with_context(|| format!("Failed to open catalog {:?}", db))
}

/// Cancel token wired to Ctrl-C.
fn interruptible() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupted, finishing current unit of work");
        handler.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn print_rule() {
    println!("{:=<60}", "");
}

fn cmd_normalize(text: &str, artist: bool) {
    let normalized = if artist {
        normalize_artist(text)
    } else {
        normalize_title(text)
    };
    println!("display:        {}", normalized.display);
    println!("comparison key: {}", normalized.comparison_key);
    if artist && !normalized.is_empty() {
        println!("pending id:     {}", pending_id_for(text));
    }
}

fn cmd_split(artist: &str, config: &EngineConfig) {
    let overrides = match &config.resolver.overrides_path {
        Some(path) => OverrideTable::load(path),
        None => OverrideTable::empty(),
    };
    println!("Candidates for {:?}:", artist);
    for (i, grouping) in split_collaboration(artist, &overrides).iter().enumerate() {
        println!("  {}. {:?}", i + 1, grouping);
    }
    let fallback = word_groupings(artist, config.resolver.max_grouping_tokens);
    if !fallback.is_empty() {
        println!("Word-grouping fallback:");
        for (i, grouping) in fallback.iter().enumerate() {
            println!("  {}. {:?}", i + 1, grouping);
        }
    }
}

#[derive(Default)]
struct IngestTotals {
    lines: u64,
    new_buckets: u64,
    incremented: u64,
    suppressed: u64,
    skipped: u64,
    errors: u64,
}

fn cmd_ingest(engine: &Engine, path: &Path, cancel: &CancelToken) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open plays file {:?}", path))?;
    let spinner = create_spinner("Ingesting plays");
    let mut totals = IngestTotals::default();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        if cancel.is_cancelled() {
            warn!(lines = totals.lines, "ingest interrupted");
            break;
        }
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        totals.lines += 1;
        let play: ScrapedPlay = match serde_json::from_str(&line) {
            Ok(play) => play,
            Err(e) => {
                warn!(line = n + 1, error = %e, "unparseable play");
                totals.errors += 1;
                continue;
            }
        };
        match engine.ingest(&play) {
            Ok(IngestOutcome::Skipped) => totals.skipped += 1,
            Ok(IngestOutcome::Recorded { outcome, .. }) => match outcome {
                PlayOutcome::NewBucket => totals.new_buckets += 1,
                PlayOutcome::IncrementedExisting => totals.incremented += 1,
                PlayOutcome::SuppressedDuplicate => totals.suppressed += 1,
            },
            Err(e) => {
                warn!(line = n + 1, station = %play.station_id, error = %e, "ingest failed");
                totals.errors += 1;
            }
        }
        spinner.inc(1);
        if totals.lines % 1000 == 0 {
            info!(lines = totals.lines, "ingest progress");
        }
    }
    spinner.finish_and_clear();

    println!();
    print_rule();
    println!("Ingest complete: {} lines", totals.lines);
    println!("  New buckets:        {}", totals.new_buckets);
    println!("  Incremented:        {}", totals.incremented);
    println!("  Duplicates dropped: {}", totals.suppressed);
    println!("  Skipped (non-song): {}", totals.skipped);
    println!("  Errors:             {}", totals.errors);
    print_rule();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    set_log_only(args.log_only);
    init_logging("info");

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    let config = load_config(args.config.as_deref())?;
    let start = Instant::now();

    match &args.command {
        Command::Normalize { text, artist } => cmd_normalize(text, *artist),
        Command::Split { artist } => cmd_split(artist, &config),
        Command::Ingest { plays } => {
            let engine = open_engine(&args, &config)?;
            let cancel = interruptible()?;
            cmd_ingest(&engine, plays, &cancel)?;
        }
        Command::RetryPending { limit } => {
            let engine = open_engine(&args, &config)?;
            let cancel = interruptible()?;
            let report = engine.retry_pending(&cancel, *limit)?;
            print_rule();
            println!("Pending sweep{}", if report.cancelled { " (cancelled)" } else { "" });
            println!("  Artists tried:  {}", report.total);
            println!("  Resolved:       {}", report.resolved);
            println!("  Still pending:  {}", report.still_pending);
            println!("  Songs merged:   {}", report.merged_songs);
            println!("  Errors:         {}", report.errors);
            print_rule();
        }
        Command::Match {
            library,
            days,
            station,
            limit,
            min_plays,
            stats_out,
        } => {
            let engine = open_engine(&args, &config)?;
            let cancel = interruptible()?;
            let library = JsonLibrary::load(library)
                .with_context(|| format!("Failed to load library export {:?}", library))?;
            info!(tracks = library.len(), "loaded library export");

            let query = SongQuery {
                since: (now() - Duration::days(*days)).date(),
                station_id: station.clone(),
                min_plays: *min_plays,
                limit: *limit,
            };
            let build = engine.build_playlist(&query, &library, &cancel, now())?;

            print_rule();
            println!("Playlist build{}", if build.cancelled { " (cancelled)" } else { "" });
            println!("  Songs requested: {}", build.requested);
            println!("  Matched:         {}", build.matched.len());
            for (strategy, count) in &build.by_strategy {
                println!("    {:<12} {}", strategy.as_str(), count);
            }
            println!("  Missing:         {}", build.missing.len());
            print_rule();

            if let Some(out) = stats_out {
                let json = serde_json::to_string_pretty(&build)?;
                std::fs::write(out, json).with_context(|| format!("Failed to write {:?}", out))?;
                println!("Stats written to {:?}", out);
            }
        }
        Command::Cleanup => {
            let engine = open_engine(&args, &config)?;
            let deleted = engine.cleanup_stale_pending(now())?;
            println!("Deleted {} stale pending artists", deleted);
        }
        Command::Stats => {
            let engine = open_engine(&args, &config)?;
            let stats = engine.catalog().stats()?;
            print_rule();
            println!("  Resolved artists:    {}", stats.resolved_artists);
            println!("  Pending artists:     {}", stats.pending_artists);
            println!("  Songs:               {}", stats.songs);
            println!("  Play buckets:        {}", stats.play_buckets);
            println!("  Total plays:         {}", stats.total_plays);
            println!("  Open match failures: {}", stats.unresolved_failures);
            print_rule();
        }
    }

    info!(elapsed = %format_duration(start.elapsed()), "done");
    Ok(())
}
