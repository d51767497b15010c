//! Summarize open library-match failures for manual review.
//!
//! Usage: analyze-failures <catalog.db> [--near-miss 0.80] [--top N]

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::time::Instant;

use radio_match::catalog::{Catalog, MatchFailure};
use radio_match::models::{MatchStrategy, StrategyAttempt};
use radio_match::progress::format_duration;

/// Upper edges of the fuzzy-score histogram buckets.
const HISTOGRAM_EDGES: [f64; 6] = [0.5, 0.6, 0.7, 0.8, 0.85, 0.9];

fn best_fuzzy(failure: &MatchFailure) -> Option<f64> {
    let attempts: Vec<StrategyAttempt> = serde_json::from_str(&failure.attempts_json).ok()?;
    attempts
        .iter()
        .find(|a| a.strategy == MatchStrategy::Fuzzy)
        .and_then(|a| a.best_score)
}

/// Bucket index for a score: one per edge, plus one for scores at or above the last edge.
fn histogram_slot(score: f64) -> usize {
    HISTOGRAM_EDGES
        .iter()
        .position(|edge| score < *edge)
        .unwrap_or(HISTOGRAM_EDGES.len())
}

fn slot_label(slot: usize) -> String {
    let low = if slot == 0 { 0.0 } else { HISTOGRAM_EDGES[slot - 1] };
    match HISTOGRAM_EDGES.get(slot) {
        Some(high) => format!("{:.2}-{:.2}", low, high),
        None => format!("{:.2}+", low),
    }
}

fn counted<K: Clone + Ord>(map: FxHashMap<K, usize>) -> Vec<(K, usize)> {
    let mut entries: Vec<(K, usize)> = map.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: analyze-failures <catalog.db> [--near-miss 0.80] [--top N]");
        std::process::exit(1);
    }
    let db_path = Path::new(&args[1]);
    let flag = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
    };
    let near_miss: f64 = flag("--near-miss").and_then(|s| s.parse().ok()).unwrap_or(0.80);
    let top: usize = flag("--top").and_then(|s| s.parse().ok()).unwrap_or(20);

    let start = Instant::now();
    println!("Loading open match failures from {:?}...", db_path);
    let catalog = Catalog::open(db_path).with_context(|| format!("Failed to open catalog {:?}", db_path))?;
    let failures = catalog.unresolved_failures()?;
    println!("  Loaded {} failures", failures.len());
    if failures.is_empty() {
        return Ok(());
    }

    // Latest failure per song only; older ones repeat the same diagnosis.
    let mut latest: FxHashMap<i64, &MatchFailure> = FxHashMap::default();
    for failure in &failures {
        latest.entry(failure.song_id).or_insert(failure);
    }
    let mut songs: Vec<&MatchFailure> = latest.into_values().collect();
    songs.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(a.song_id.cmp(&b.song_id)));

    let mut by_reason: FxHashMap<String, usize> = FxHashMap::default();
    let mut by_artist: FxHashMap<String, usize> = FxHashMap::default();
    let mut histogram = [0usize; HISTOGRAM_EDGES.len() + 1];
    let mut unscored = 0usize;
    let mut near: Vec<(f64, &MatchFailure)> = Vec::new();

    for &failure in &songs {
        *by_reason.entry(failure.reason.clone()).or_default() += 1;
        *by_artist.entry(failure.artist.clone()).or_default() += 1;
        match best_fuzzy(failure) {
            Some(score) => {
                histogram[histogram_slot(score)] += 1;
                if score >= near_miss {
                    near.push((score, failure));
                }
            }
            None => unscored += 1,
        }
    }
    near.sort_by(|a, b| b.0.total_cmp(&a.0));

    println!("\n{:=<60}", "");
    println!("FAILURES BY REASON ({} songs)", songs.len());
    println!("{:=<60}", "");
    for (reason, count) in counted(by_reason) {
        let pct = 100.0 * count as f64 / songs.len() as f64;
        println!("  {:<22} {:>6} ({:.1}%)", reason, count, pct);
    }

    println!("\n{:=<60}", "");
    println!("BEST FUZZY SCORE");
    println!("{:=<60}", "");
    for (slot, count) in histogram.iter().enumerate() {
        println!("  {:<10} {:>6} {}", slot_label(slot), count, "#".repeat((*count).min(50)));
    }
    println!("  {:<10} {:>6}", "no score", unscored);

    println!("\n{:=<60}", "");
    println!("NEAR MISSES (fuzzy >= {:.2})", near_miss);
    println!("{:=<60}", "");
    for (score, failure) in near.iter().take(top) {
        println!("  {:.3}  {} - {}", score, failure.artist, failure.title);
    }
    if near.is_empty() {
        println!("  none");
    }

    println!("\n{:=<60}", "");
    println!("ARTISTS WITH MOST FAILURES");
    println!("{:=<60}", "");
    for (artist, count) in counted(by_artist).into_iter().take(top) {
        println!("  {:>5}  {}", count, artist);
    }

    println!("\nElapsed: {}", format_duration(start.elapsed()));
    Ok(())
}
