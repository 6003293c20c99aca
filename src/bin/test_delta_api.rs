/// Programme de test: lecture delta avec troncature et recouvrement
///
/// Scénario: 250 bougies accumulées après le filigrane du client, limite à
/// 100. Attendu: 100 bougies et truncated=true, puis les appels suivants avec
/// since = dernier open_time retourné couvrent le reste sans perte. Les
/// corrections proches du filigrane sont toujours incluses.
use anyhow::Result;
use rust_candles_continuity::delta::compute_delta;
use rust_candles_continuity::models::Candle;
use rust_candles_continuity::store::CanonicalStore;
use std::collections::BTreeSet;

const INTERVAL: i64 = 60_000;

fn candle(open_time: i64, close: f64) -> Candle {
    Candle {
        open_time,
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 75.0,
        close_time: open_time + INTERVAL - 1,
        trade_count: 7,
        is_closed: true,
    }
}

fn main() -> Result<()> {
    let db_file = "test_delta_api.db";
    let _ = std::fs::remove_file(db_file);

    println!("=== TEST TRONCATURE DU DELTA ===\n");

    let mut store = CanonicalStore::new(db_file)?;
    let batch: Vec<Candle> = (0..250).map(|i| candle(i * INTERVAL, 0.60)).collect();
    store.upsert_candles("XRPUSDT", "1m", &batch)?;

    // Le client n'a rien (filigrane avant la série)
    let first = compute_delta(&store, "XRPUSDT", "1m", -INTERVAL, 100, INTERVAL)?;
    assert_eq!(first.candles.len(), 100);
    assert!(first.truncated);
    println!("✓ Première page: 100 bougies, truncated = true");

    // Boucle de rattrapage: since = dernier open_time retourné
    let mut seen: BTreeSet<i64> = first.candles.iter().map(|c| c.open_time).collect();
    let mut since = *seen.iter().next_back().unwrap();
    let mut pages = 1;
    loop {
        let page = compute_delta(&store, "XRPUSDT", "1m", since, 100, INTERVAL)?;
        // Recouvrement: le filigrane est re-reçu et dédupliqué par open_time
        assert_eq!(page.candles.first().map(|c| c.open_time), Some(since));
        seen.extend(page.candles.iter().map(|c| c.open_time));
        pages += 1;
        if !page.truncated {
            break;
        }
        since = page.candles.last().unwrap().open_time;
    }
    assert_eq!(seen.len(), 250);
    assert_eq!(*seen.iter().next_back().unwrap(), 249 * INTERVAL);
    println!("✓ Rattrapage complet en {} pages, 250 bougies dédupliquées", pages);

    println!("\n=== TEST INCLUSION DES RÉPARATIONS ===\n");

    // Correction de la bougie 100 (contenu divergent)
    store.upsert_candles("XRPUSDT", "1m", &[candle(100 * INTERVAL, 9.99)])?;

    // Filigrane à 101: la réparation est dans la fenêtre de recouvrement
    let delta = compute_delta(&store, "XRPUSDT", "1m", 101 * INTERVAL, 200, INTERVAL)?;
    assert_eq!(delta.repairs.len(), 1);
    assert_eq!(delta.repairs[0].open_time, 100 * INTERVAL);
    assert_eq!(delta.repairs[0].candle.close, 9.99);
    println!("✓ Réparation incluse pour since = open_time + 1 intervalle");

    // Le recouvrement d'un intervalle re-livre la bougie corrigée elle-même
    let delta = compute_delta(&store, "XRPUSDT", "1m", 100 * INTERVAL, 200, INTERVAL)?;
    assert_eq!(delta.candles.first().unwrap().open_time, 100 * INTERVAL);
    assert_eq!(delta.candles.first().unwrap().close, 9.99);
    println!("✓ La bougie corrigée revient via le recouvrement d'un intervalle");

    let _ = std::fs::remove_file(db_file);
    println!("\n✓ Test terminé!");
    Ok(())
}
