/// Programme de test: gap en cours de flux puis arrivée tardive
///
/// Scénario: bougies 1000, 1060, 1180, 1240 (secondes·1000). Attendu:
/// append(1000), append(1060), gap_detected([1120,1120]), append(1180),
/// append(1240). Puis l'arrivée tardive de 1120 referme le segment:
/// missing_bars tombe à 0, l'état passe recovered et gap_repaired est émis.
use anyhow::Result;
use rust_candles_continuity::consumer::StreamConsumer;
use rust_candles_continuity::events::PushPayload;
use rust_candles_continuity::gap_repository::GapRepository;
use rust_candles_continuity::hub::PushHub;
use rust_candles_continuity::metrics::Metrics;
use rust_candles_continuity::models::{Candle, GapState};
use rust_candles_continuity::store::CanonicalStore;
use rust_candles_continuity::upstream::{StreamCandleEvent, StreamMessage};
use std::sync::Arc;
use std::sync::atomic::Ordering;

const INTERVAL: i64 = 60_000;

fn finalized(open_time: i64, close: f64) -> StreamMessage {
    StreamMessage::Candle(StreamCandleEvent {
        candle: Candle {
            open_time,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            close_time: open_time + INTERVAL - 1,
            trade_count: 10,
            is_closed: true,
        },
        received_at_ms: open_time + INTERVAL,
    })
}

fn main() -> Result<()> {
    let db_file = "test_gap_detection.db";
    let _ = std::fs::remove_file(db_file);

    println!("=== TEST GAP EN COURS DE FLUX ===\n");

    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(PushHub::new(Arc::clone(&metrics)));
    let mut rx = hub.subscribe();

    let store = CanonicalStore::new(db_file)?;
    let gaps = GapRepository::new(db_file)?;
    let mut consumer = StreamConsumer::new(
        "XRPUSDT",
        "1m",
        INTERVAL,
        store,
        gaps,
        Arc::clone(&hub),
        Arc::clone(&metrics),
    );

    // 1120 manque: le flux saute de 1060 à 1180
    for open_time in [1_000_000, 1_060_000, 1_180_000, 1_240_000] {
        consumer.handle_message(finalized(open_time, 0.61));
    }

    // Séquence attendue des événements
    let mut kinds = Vec::new();
    let mut gap_range = None;
    while let Ok(event) = rx.try_recv() {
        if let PushPayload::GapDetected {
            from_open_time,
            to_open_time,
            missing_bars,
        } = &event.payload
        {
            gap_range = Some((*from_open_time, *to_open_time, *missing_bars));
        }
        kinds.push(event.payload.kind());
    }
    assert_eq!(
        kinds,
        vec!["append", "append", "gap_detected", "append", "append"]
    );
    assert_eq!(gap_range, Some((1_120_000, 1_120_000, 1)));
    println!("✓ Séquence append/gap_detected/append correcte, gap [1120,1120]");

    // Le segment est suivi en open avec missing_bars = 1
    let gaps = GapRepository::new(db_file)?;
    let open = gaps.load_open(10)?;
    assert_eq!(open.len(), 1);
    let seg = &open[0];
    assert_eq!(seg.state, GapState::Open);
    assert_eq!(seg.missing_bars, 1);
    println!("✓ Segment ouvert enregistré (missing_bars = 1)");

    println!("\n=== ARRIVÉE TARDIVE DANS LE GAP ===\n");

    // La bougie 1120 arrive en retard: absorption silencieuse (insertion)
    consumer.handle_message(finalized(1_120_000, 0.62));

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.payload.kind());
    }
    // Insertion sans contenu divergent: pas de repair, mais gap_repaired
    assert_eq!(kinds, vec!["gap_repaired"]);
    println!("✓ Absorption silencieuse + gap_repaired émis");

    let gaps = GapRepository::new(db_file)?;
    assert_eq!(gaps.count_open()?, 0);
    let seg = gaps.get(seg.id)?;
    assert_eq!(seg.state, GapState::Recovered);
    assert_eq!(seg.missing_bars, 0);
    println!("✓ Segment recovered, missing_bars = 0");

    // Base: 5 lignes contiguës
    let store = CanonicalStore::new(db_file)?;
    assert_eq!(store.count_range("XRPUSDT", "1m", 0, i64::MAX)?, 5);
    let rows = store.get_range("XRPUSDT", "1m", 0, i64::MAX, 100)?;
    for pair in rows.windows(2) {
        assert_eq!(pair[1].open_time - pair[0].open_time, INTERVAL);
    }
    println!("✓ 5 lignes contiguës en base");

    // Un doublon identique du dernier close est un no-op silencieux
    consumer.handle_message(finalized(1_240_000, 0.61));
    assert!(rx.try_recv().is_err(), "un doublon identique ne diffuse rien");
    assert_eq!(metrics.late_fills_total.load(Ordering::Relaxed), 2);
    println!("✓ Doublon identique absorbé sans diffusion");

    // Une arrivée tardive au contenu divergent est diffusée en repair
    consumer.handle_message(finalized(1_000_000, 0.99));
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.payload.kind());
    }
    assert_eq!(kinds, vec!["repair"]);
    println!("✓ Contenu divergent diffusé en repair");

    let _ = std::fs::remove_file(db_file);
    println!("\n✓ Test terminé!");
    Ok(())
}
