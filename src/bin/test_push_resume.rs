/// Programme de test: protocole push (epoch, seq, backpressure)
///
/// Trois vérifications:
/// 1. seq sans trou au sein d'un epoch, heartbeats compris
/// 2. reconnexion: epoch neuf, seq repart de 0 sur le snapshot
/// 3. coalescence sous pression: 100 partielles du même open_time dans une
///    file de 8 → au plus 8 en file, seule la plus récente délivrée, aucun
///    abandon d'événement non-partiel
use anyhow::Result;
use rust_candles_continuity::events::{EpochSequencer, PushPayload};
use rust_candles_continuity::hub::{EnqueueOutcome, PushHub, SubscriberQueue};
use rust_candles_continuity::metrics::Metrics;
use rust_candles_continuity::models::Candle;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const INTERVAL: i64 = 60_000;

fn partial(open_time: i64, close: f64) -> PushPayload {
    PushPayload::PartialUpdate {
        candle: Candle {
            open_time,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            close_time: open_time + INTERVAL - 1,
            trade_count: 1,
            is_closed: false,
        },
    }
}

fn append(open_time: i64) -> PushPayload {
    PushPayload::Append {
        open_time,
        candle: Candle {
            open_time,
            open: 0.6,
            high: 0.7,
            low: 0.5,
            close: 0.65,
            volume: 10.0,
            close_time: open_time + INTERVAL - 1,
            trade_count: 1,
            is_closed: true,
        },
    }
}

fn main() -> Result<()> {
    println!("=== TEST SEQ SANS TROU ===\n");

    let metrics = Arc::new(Metrics::new());
    let hub = PushHub::new(Arc::clone(&metrics));

    let epoch1 = hub.next_epoch();
    let mut sequencer = EpochSequencer::new(epoch1.clone());

    // snapshot(0), append(1), heartbeat(2), append(3): le heartbeat compte
    let seqs: Vec<i64> = [
        PushPayload::Snapshot {
            candles: vec![],
            partial: None,
        },
        append(0),
        PushPayload::Heartbeat,
        append(INTERVAL),
    ]
    .into_iter()
    .map(|p| sequencer.envelope("ohlcv:XRPUSDT:1m", 0, p).seq)
    .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    println!("✓ seq = 0..3 sans trou, heartbeat séquencé");

    println!("\n=== TEST RECONNEXION AVEC EPOCH NEUF ===\n");

    // Le client avait lastSeq = 12 sous epoch1; le serveur redémarre
    let epoch2 = hub.next_epoch();
    assert_ne!(epoch1, epoch2, "un epoch doit être neuf par acceptation");

    let mut sequencer2 = EpochSequencer::new(epoch2.clone());
    let snapshot = sequencer2.envelope(
        "ohlcv:XRPUSDT:1m",
        0,
        PushPayload::Snapshot {
            candles: vec![],
            partial: None,
        },
    );
    assert_eq!(snapshot.seq, 0);
    assert_eq!(snapshot.epoch, epoch2);
    let next = sequencer2.envelope("ohlcv:XRPUSDT:1m", 0, append(0));
    assert_eq!(next.seq, 1);
    println!("✓ Après reconnexion: epoch {} ≠ {}, seq repart du snapshot 0", epoch2, epoch1);

    println!("\n=== TEST COALESCENCE SOUS PRESSION ===\n");

    // File de 8, 100 partielles du même open_time en rafale
    let mut queue = SubscriberQueue::new(8, true);
    let mut coalesced = 0u64;
    for i in 0..100 {
        match queue.push(partial(1_000_000, i as f64)) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Coalesced => coalesced += 1,
            other => panic!("verdict inattendu pour une partielle: {:?}", other),
        }
    }
    assert!(queue.len() <= 8);
    assert_eq!(queue.len(), 1);
    assert_eq!(coalesced, 99);
    metrics.push_coalesced_total.fetch_add(coalesced, Ordering::Relaxed);

    // Le premier append suivant est accepté et délivré après la partielle
    assert_eq!(queue.push(append(1_060_000)), EnqueueOutcome::Queued);

    let first = queue.pop().unwrap();
    match first {
        PushPayload::PartialUpdate { candle } => {
            assert_eq!(candle.close, 99.0, "seule la plus récente doit rester");
        }
        other => panic!("attendu la partielle coalescée, obtenu {}", other.kind()),
    }
    match queue.pop().unwrap() {
        PushPayload::Append { open_time, .. } => assert_eq!(open_time, 1_060_000),
        other => panic!("attendu l'append, obtenu {}", other.kind()),
    }
    assert!(queue.pop().is_none());

    // Aucun événement non-partiel abandonné
    assert_eq!(metrics.push_dropped_total.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.push_coalesced_total.load(Ordering::Relaxed), 99);
    println!("✓ 99 coalescences, 0 abandon, la plus récente puis l'append délivrés");

    println!("\n✓ Test terminé!");
    Ok(())
}
