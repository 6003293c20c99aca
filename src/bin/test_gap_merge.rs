/// Programme de test: fusion de segments chevauchants
///
/// Vérifie que merge_or_insert est associatif: quel que soit l'ordre
/// d'insertion d'un ensemble de plages chevauchantes, le segment survivant
/// couvre la même union avec le même missing_bars, et les absorbés pointent
/// tous sur lui via merged_into.
use anyhow::Result;
use rust_candles_continuity::gap_repository::{GapRepository, MergeOutcome, NewGapSegment};
use rust_candles_continuity::models::GapState;

const INTERVAL: i64 = 60_000;

fn seg(from: i64, to: i64) -> NewGapSegment {
    NewGapSegment {
        symbol: "XRPUSDT".to_string(),
        timeframe: "1m".to_string(),
        from_open_time: from,
        to_open_time: to,
        detected_at: 1_000,
    }
}

/// Toutes les permutations de [0, 1, 2]
const PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

fn main() -> Result<()> {
    println!("=== TEST ASSOCIATIVITÉ DE LA FUSION ===\n");

    let ranges = [
        (0, 3 * INTERVAL),
        (2 * INTERVAL, 6 * INTERVAL),
        (5 * INTERVAL, 9 * INTERVAL),
    ];

    let mut finals = Vec::new();
    for (n, perm) in PERMUTATIONS.iter().enumerate() {
        let db_file = format!("test_gap_merge_{}.db", n);
        let _ = std::fs::remove_file(&db_file);
        let mut repo = GapRepository::new(&db_file)?;

        let mut last_id = 0;
        for idx in perm {
            let (from, to) = ranges[*idx];
            last_id = repo.merge_or_insert(&seg(from, to), INTERVAL)?.id();
        }

        let survivor = repo.get(last_id)?;
        assert_eq!(survivor.state, GapState::Open);
        finals.push((
            survivor.from_open_time,
            survivor.to_open_time,
            survivor.missing_bars,
        ));

        // Tous les segments non survivants sont merged → survivant
        for merged in repo.list_status("XRPUSDT", "1m", 100)?.iter() {
            assert_eq!(merged.id, last_id, "un segment non fusionné subsiste");
        }

        let _ = std::fs::remove_file(&db_file);
    }

    for result in &finals {
        assert_eq!(*result, (0, 9 * INTERVAL, 10));
    }
    println!("✓ Les 6 permutations convergent vers [0 .. 9] (10 bougies)");

    println!("\n=== TEST IDEMPOTENCE SUR PLAGE EXACTE ===\n");

    let db_file = "test_gap_merge_idem.db";
    let _ = std::fs::remove_file(db_file);
    let mut repo = GapRepository::new(db_file)?;

    let first = repo.merge_or_insert(&seg(0, 4 * INTERVAL), INTERVAL)?;
    let id = first.id();
    for _ in 0..3 {
        let repeat = repo.merge_or_insert(&seg(0, 4 * INTERVAL), INTERVAL)?;
        assert_eq!(repeat, MergeOutcome::AlreadyTracked(id));
    }
    assert_eq!(repo.load_open(10)?.len(), 1);
    println!("✓ Répéter la même plage ne crée aucun segment");

    let _ = std::fs::remove_file(db_file);
    println!("\n✓ Test terminé!");
    Ok(())
}
