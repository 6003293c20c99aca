/// Programme de vérification de la continuité des données stockées
///
/// Lance l'audit du scanner pour un couple et affiche le rapport; les
/// segments manquants découverts sont enregistrés dans le dépôt de gaps
/// (même chemin que l'audit périodique du serveur).
use anyhow::Result;
use clap::Parser;
use rust_candles_continuity::gap_repository::GapRepository;
use rust_candles_continuity::metrics::Metrics;
use rust_candles_continuity::scanner::scan_once;
use rust_candles_continuity::store::CanonicalStore;
use rust_candles_continuity::utils::{format_timestamp_ms, timeframe_to_interval};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Audit de continuité d'une série stockée")]
struct Args {
    /// Le symbole/paire de trading à vérifier (ex: BTCUSDT)
    #[arg(short, long)]
    symbol: String,

    /// Timeframe de la série
    #[arg(short, long, default_value = "1m")]
    timeframe: String,

    /// Horizon de l'audit en jours
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Fichier de base de données
    #[arg(long, default_value = "candlesticks.db")]
    db_file: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let symbol = args.symbol.to_uppercase();
    let interval_ms = timeframe_to_interval(&args.timeframe);

    println!(
        "\n=== Vérification de la continuité pour {}/{} ===",
        symbol, args.timeframe
    );
    println!("Intervalle attendu: {} ms", interval_ms);

    let store = CanonicalStore::new(&args.db_file)?;
    let mut gaps = GapRepository::new(&args.db_file)?;
    let metrics = Arc::new(Metrics::new());

    let report = scan_once(
        &store,
        &mut gaps,
        &symbol,
        &args.timeframe,
        interval_ms,
        args.days,
        &metrics,
    )?;

    println!("\n--- Statistiques ---");
    println!("Nombre total de bougies: {}", report.present_bars);
    println!("Nombre de bougies attendu: {}", report.expected_bars);
    println!("Complétude: {:.4}", report.completeness_ratio);

    if report.segments.is_empty() {
        println!("\n✓ Aucun gap détecté - les données sont continues!");
    } else {
        println!("\n--- GAPS DÉTECTÉS ({} segments) ---", report.segments.len());
        for (i, (from, to)) in report.segments.iter().enumerate() {
            if i < 10 {
                // Limiter l'affichage aux 10 premiers
                let missing = (to - from) / interval_ms + 1;
                println!(
                    "  Gap de {} à {} ({} bougies manquantes)",
                    format_timestamp_ms(*from),
                    format_timestamp_ms(*to),
                    missing
                );
            }
        }
        if report.segments.len() > 10 {
            println!("  ... et {} autres gaps", report.segments.len() - 10);
        }
        println!(
            "\nSegments nouvellement suivis dans le dépôt: {}",
            report.new_segments
        );
    }

    println!("\n{:=<60}\n", "");
    Ok(())
}
