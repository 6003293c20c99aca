// ============================================================================
// CLI OPÉRATEUR — backfill d'horizon et audit de continuité
// ============================================================================

// anyhow::Result - Gestion d'erreurs ergonomique en Rust
// Permet de propager les erreurs avec `?` sans définir un type d'erreur explicite
use anyhow::Result;

// chrono - Bibliothèque de manipulation de dates/temps en Rust
use chrono::{DateTime, NaiveDateTime, Utc};

// clap - Bibliothèque de parsing d'arguments CLI
// Utilise les macros dérivées pour générer le code de parsing automatiquement
use clap::Parser;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use rust_candles_continuity::backfill::{BackfillOptions, run_horizon_backfill};
use rust_candles_continuity::config::EngineConfig;
use rust_candles_continuity::gap_repository::GapRepository;
use rust_candles_continuity::hub::PushHub;
use rust_candles_continuity::metrics::Metrics;
use rust_candles_continuity::scanner::scan_once;
use rust_candles_continuity::store::CanonicalStore;
use rust_candles_continuity::upstream::UpstreamAdapter;
use rust_candles_continuity::utils::format_timestamp_ms;

/// Structure des arguments CLI générée automatiquement par clap
///
/// SUBTILITÉ RUST: #[derive(Parser)] génère le code de parsing des arguments
/// à la compilation, à partir des champs et de leurs attributs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Le symbole/paire de trading à traiter (ex: BTCUSDT)
    #[arg(short, long)]
    symbol: String,

    /// Timeframe de la série (ex: 1m, 5m, 1h)
    #[arg(short, long, default_value = "1m")]
    timeframe: String,

    /// Optionnel: Date de début du backfill au format YYYY-MM-DD
    ///
    /// SUBTILITÉ RUST: Option<T> remplace les NULL d'autres langages de
    /// manière type-safe; le compilateur force à gérer l'absence de valeur
    #[arg(short = 'd', long)]
    start_date: Option<String>,

    /// Lancer l'audit de continuité au lieu du backfill
    /// (les segments manquants sont enregistrés dans le dépôt de gaps)
    #[arg(long)]
    scan: bool,

    /// Vérifier la continuité après le backfill
    #[arg(short = 'v', long)]
    verify: bool,
}

/// Point d'entrée du programme
///
/// Le CLI est entièrement synchrone: REST et SQLite le sont aussi, et aucun
/// flux temps réel n'est ouvert ici (c'est le rôle du serveur).
fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::from_env().with_stream_key(&args.symbol, &args.timeframe);
    println!(
        "Démarrage pour {}/{} (base: {})",
        config.symbol, config.timeframe, config.db_file
    );

    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(PushHub::new(Arc::clone(&metrics)));
    let shutdown = AtomicBool::new(false);

    if args.scan {
        run_audit(&config, &metrics)?;
        return Ok(());
    }

    // Horizon du backfill: depuis --start-date, sinon un an
    let horizon_days = match &args.start_date {
        Some(date_str) => {
            let start_ms = parse_start_date(date_str)?;
            let now_ms = Utc::now().timestamp_millis();
            ((now_ms - start_ms) / 86_400_000 + 1).max(1)
        }
        None => 365,
    };

    let options = BackfillOptions::new(
        config.symbol.clone(),
        config.timeframe.clone(),
        config.db_file.clone(),
    )
    .with_horizon_days(horizon_days)
    .with_paging(config.backfill_page_size, config.backfill_max_pages);

    let adapter = UpstreamAdapter::new(
        Arc::clone(&metrics),
        config.backfill_retry_max,
        config.backfill_retry_backoff_ms as u64,
    );

    let loaded = run_horizon_backfill(&adapter, &options, hub, Arc::clone(&metrics), &shutdown)?;
    println!("Backfill terminé: {} bougies matérialisées.", loaded);

    if args.verify {
        run_audit(&config, &metrics)?;
    }

    Ok(())
}

/// Audit de continuité: rapport et enregistrement des segments manquants
fn run_audit(config: &EngineConfig, metrics: &Arc<Metrics>) -> Result<()> {
    let store = CanonicalStore::new(&config.db_file)?;
    let mut gaps = GapRepository::new(&config.db_file)?;

    let report = scan_once(
        &store,
        &mut gaps,
        &config.symbol,
        &config.timeframe,
        config.interval_ms,
        config.scanner_horizon_days,
        metrics,
    )?;

    println!("\n--- Rapport de continuité ---");
    println!("Période: {} → {}",
        format_timestamp_ms(report.from_open_time),
        format_timestamp_ms(report.to_open_time)
    );
    println!("Bougies attendues: {}", report.expected_bars);
    println!("Bougies présentes: {}", report.present_bars);
    println!("Complétude: {:.4}", report.completeness_ratio);

    if report.segments.is_empty() {
        println!("✓ Aucun gap détecté - les données sont continues!");
    } else {
        println!("\n--- GAPS DÉTECTÉS ({} segments) ---", report.segments.len());
        for (i, (from, to)) in report.segments.iter().enumerate() {
            if i < 10 {
                // Limiter l'affichage aux 10 premiers
                println!(
                    "  [{} .. {}]",
                    format_timestamp_ms(*from),
                    format_timestamp_ms(*to)
                );
            }
        }
        if report.segments.len() > 10 {
            println!("  ... et {} autres segments", report.segments.len() - 10);
        }
        println!("Segments nouvellement suivis: {}", report.new_segments);
    }

    Ok(())
}

/// Parse une date au format YYYY-MM-DD en timestamp millisecondes
fn parse_start_date(date_str: &str) -> Result<i64> {
    let naive_date = NaiveDateTime::parse_from_str(
        &(date_str.to_string() + " 00:00:00"),
        "%Y-%m-%d %H:%M:%S",
    )?;
    let datetime_utc = DateTime::<Utc>::from_naive_utc_and_offset(naive_date, Utc);
    Ok(datetime_utc.timestamp_millis())
}
