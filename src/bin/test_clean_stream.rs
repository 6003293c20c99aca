/// Programme de test: flux propre de bougies finalisées
///
/// Scénario: 10 bougies contiguës pour (XRPUSDT, 1m). Attendu: 10 événements
/// append avec seq 1..10 derrière le snapshot, 10 lignes en base, aucun gap.
use anyhow::Result;
use rust_candles_continuity::consumer::{ConsumerState, StreamConsumer};
use rust_candles_continuity::events::{EpochSequencer, PushPayload};
use rust_candles_continuity::gap_repository::GapRepository;
use rust_candles_continuity::hub::PushHub;
use rust_candles_continuity::metrics::Metrics;
use rust_candles_continuity::models::Candle;
use rust_candles_continuity::store::CanonicalStore;
use rust_candles_continuity::upstream::{StreamCandleEvent, StreamMessage};
use std::sync::Arc;

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
    let db_file = "test_clean_stream.db";
    let _ = std::fs::remove_file(db_file);

    println!("=== TEST FLUX PROPRE ===\n");

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

    // Resynchronisation initiale puis 10 bougies contiguës
    consumer.handle_message(StreamMessage::Reconnected);
    for i in 0..10 {
        let open_time = 1_000_000 + i * INTERVAL;
        consumer.handle_message(finalized(open_time, 0.60 + i as f64 * 0.01));
    }
    assert_eq!(consumer.state(), ConsumerState::Streaming);
    assert_eq!(consumer.last_closed(), Some(1_000_000 + 9 * INTERVAL));
    println!("✓ Machine à états en STREAMING, pointeur avancé");

    // Enveloppement côté abonné: snapshot en seq 0, appends en seq 1..10
    let epoch = hub.next_epoch();
    let mut sequencer = EpochSequencer::new(epoch);
    let snapshot = sequencer.envelope(
        "ohlcv:XRPUSDT:1m",
        0,
        PushPayload::Snapshot {
            candles: vec![],
            partial: None,
        },
    );
    assert_eq!(snapshot.seq, 0);

    let mut append_seqs = Vec::new();
    let mut last_open_time = 0;
    while let Ok(event) = rx.try_recv() {
        match event.payload {
            PushPayload::Append { open_time, .. } => {
                assert!(open_time > last_open_time, "appends non ordonnés");
                last_open_time = open_time;
                let env = sequencer.envelope("ohlcv:XRPUSDT:1m", 0, event.payload);
                append_seqs.push(env.seq);
            }
            other => panic!("événement inattendu: {}", other.kind()),
        }
    }
    assert_eq!(append_seqs, (1..=10).collect::<Vec<i64>>());
    println!("✓ 10 appends ordonnés, seq = 1..10 sans trou");

    // Base: 10 lignes contiguës, aucun gap
    let store = CanonicalStore::new(db_file)?;
    assert_eq!(store.count_range("XRPUSDT", "1m", 0, i64::MAX)?, 10);
    let rows = store.get_range("XRPUSDT", "1m", 0, i64::MAX, 100)?;
    for pair in rows.windows(2) {
        assert_eq!(pair[1].open_time - pair[0].open_time, INTERVAL);
    }
    let gaps = GapRepository::new(db_file)?;
    assert_eq!(gaps.count_open()?, 0);
    println!("✓ 10 lignes contiguës en base, aucun segment ouvert");

    let _ = std::fs::remove_file(db_file);
    println!("\n✓ Test terminé!");
    Ok(())
}
