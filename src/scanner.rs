/// Module du scanner de continuité
///
/// Audit périodique de l'horizon complet: l'ensemble des open_time attendus
/// est déroulé pas à pas et comparé aux lignes présentes, les absences
/// consécutives sont coalescées en segments remis au dépôt de gaps. La
/// jauge de complétude est mise à jour à chaque passage.
use crate::errors::GapRepoError;
use crate::gap_repository::{GapRepository, MergeOutcome, NewGapSegment};
use crate::metrics::Metrics;
use crate::store::CanonicalStore;
use crate::utils::{align_open_time, format_timestamp_ms, now_ms};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Taille de page de lecture du store pendant l'audit
const SCAN_PAGE: usize = 5_000;

/// Accumulateur de diff attendu/présent
///
/// ALGORITHME:
/// Fenêtre glissante sur les open_time présents (ordre ascendant): tout
/// open_time attendu non observé devient une absence, les absences
/// consécutives s'agrègent en un segment [from, to].
struct MissAccumulator {
    interval_ms: i64,
    next_expected: i64,
    to: i64,
    misses: Vec<(i64, i64)>,
    present: i64,
}

impl MissAccumulator {
    fn new(from: i64, to: i64, interval_ms: i64) -> Self {
        MissAccumulator {
            interval_ms,
            next_expected: from,
            to,
            misses: Vec::new(),
            present: 0,
        }
    }

    fn record_miss(&mut self, open_time: i64) {
        match self.misses.last_mut() {
            Some((_, last_to)) if *last_to + self.interval_ms == open_time => {
                *last_to = open_time;
            }
            _ => self.misses.push((open_time, open_time)),
        }
    }

    /// Observe un open_time présent (ordre ascendant requis)
    fn observe(&mut self, open_time: i64) {
        if open_time > self.to {
            return;
        }
        while self.next_expected < open_time && self.next_expected <= self.to {
            let miss = self.next_expected;
            self.record_miss(miss);
            self.next_expected += self.interval_ms;
        }
        if open_time == self.next_expected {
            self.present += 1;
            self.next_expected += self.interval_ms;
        }
        // open_time sous la grille attendue: ligne hors pas, ignorée
    }

    fn finish(mut self) -> (Vec<(i64, i64)>, i64) {
        while self.next_expected <= self.to {
            let miss = self.next_expected;
            self.record_miss(miss);
            self.next_expected += self.interval_ms;
        }
        (self.misses, self.present)
    }
}

/// Rapport d'un passage du scanner
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub symbol: String,
    pub timeframe: String,
    pub from_open_time: i64,
    pub to_open_time: i64,
    pub expected_bars: i64,
    pub present_bars: i64,
    pub completeness_ratio: f64,
    /// Segments manquants observés pendant ce passage
    pub segments: Vec<(i64, i64)>,
    /// Segments réellement nouveaux (hors plages déjà suivies)
    pub new_segments: usize,
}

/// Audit complet d'un couple sur `horizon_days`
///
/// La bougie en cours de formation est exclue de l'horizon.
pub fn scan_once(
    store: &CanonicalStore,
    gaps: &mut GapRepository,
    symbol: &str,
    timeframe: &str,
    interval_ms: i64,
    horizon_days: i64,
    metrics: &Metrics,
) -> Result<ScanReport, GapRepoError> {
    let now = now_ms();
    let from = align_open_time(now - horizon_days * 86_400_000, interval_ms);
    let to = align_open_time(now, interval_ms) - interval_ms;
    let expected = (to - from) / interval_ms + 1;

    let mut acc = MissAccumulator::new(from, to, interval_ms);
    let mut cursor = from;
    loop {
        let page = store
            .get_range(symbol, timeframe, cursor, to, SCAN_PAGE)
            .map_err(GapRepoError::Store)?;
        let page_len = page.len();
        for candle in &page {
            acc.observe(candle.open_time);
        }
        match page.last() {
            Some(last) if page_len == SCAN_PAGE => cursor = last.open_time + 1,
            _ => break,
        }
    }

    let (misses, present) = acc.finish();

    let mut new_segments = 0usize;
    for (seg_from, seg_to) in &misses {
        let outcome = gaps.merge_or_insert(
            &NewGapSegment {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
                from_open_time: *seg_from,
                to_open_time: *seg_to,
                detected_at: now,
            },
            interval_ms,
        )?;
        match outcome {
            MergeOutcome::AlreadyTracked(_) => {}
            MergeOutcome::Inserted(_) => {
                new_segments += 1;
                metrics.gaps_detected_total.fetch_add(1, Ordering::Relaxed);
            }
            MergeOutcome::Merged { .. } => {
                new_segments += 1;
                metrics.gaps_detected_total.fetch_add(1, Ordering::Relaxed);
                metrics.gaps_merged_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    metrics.set_completeness(present, expected);
    if let Ok(open) = gaps.count_open() {
        metrics.open_gap_count.store(open, Ordering::Relaxed);
    }

    let ratio = if expected > 0 {
        present as f64 / expected as f64
    } else {
        1.0
    };

    println!(
        "🔍 Audit {}/{} [{} .. {}]: {}/{} présentes ({:.4}), {} segments manquants dont {} nouveaux",
        symbol,
        timeframe,
        format_timestamp_ms(from),
        format_timestamp_ms(to),
        present,
        expected,
        ratio,
        misses.len(),
        new_segments
    );

    Ok(ScanReport {
        symbol: symbol.to_string(),
        timeframe: timeframe.to_string(),
        from_open_time: from,
        to_open_time: to,
        expected_bars: expected,
        present_bars: present,
        completeness_ratio: ratio,
        segments: misses,
        new_segments,
    })
}

/// Boucle périodique du scanner (cadence murale)
pub async fn run_periodic(
    db_file: String,
    symbol: String,
    timeframe: String,
    interval_ms: i64,
    horizon_days: i64,
    schedule_ms: u64,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
) {
    println!(
        "🗓️ Scanner de continuité armé pour {}/{} (horizon {} jours, cadence {} ms)",
        symbol, timeframe, horizon_days, schedule_ms
    );

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let db_file_cl = db_file.clone();
        let symbol_cl = symbol.clone();
        let timeframe_cl = timeframe.clone();
        let metrics_cl = Arc::clone(&metrics);
        let result = tokio::task::spawn_blocking(move || {
            let store = CanonicalStore::new(&db_file_cl)
                .map_err(GapRepoError::Store)?;
            let mut gaps = GapRepository::new(&db_file_cl)?;
            scan_once(
                &store,
                &mut gaps,
                &symbol_cl,
                &timeframe_cl,
                interval_ms,
                horizon_days,
                &metrics_cl,
            )
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => eprintln!("⚠️ Passage du scanner en échec: {}", e),
            Err(e) => eprintln!("⚠️ Task du scanner interrompue: {}", e),
        }

        tokio::time::sleep(Duration::from_millis(schedule_ms.max(1_000))).await;
    }

    println!("🛑 Scanner arrêté pour {}/{}", symbol, timeframe);
}

#[cfg(test)]
mod tests {
    use super::*;

    const I: i64 = 60_000;

    #[test]
    fn test_serie_complete_sans_absence() {
        let mut acc = MissAccumulator::new(0, 4 * I, I);
        for t in [0, I, 2 * I, 3 * I, 4 * I] {
            acc.observe(t);
        }
        let (misses, present) = acc.finish();
        assert!(misses.is_empty());
        assert_eq!(present, 5);
    }

    #[test]
    fn test_absences_consecutives_coalescees() {
        let mut acc = MissAccumulator::new(0, 9 * I, I);
        // présents: 0, 1, 5, 9 → absents [2..4] et [6..8]
        for t in [0, I, 5 * I, 9 * I] {
            acc.observe(t);
        }
        let (misses, present) = acc.finish();
        assert_eq!(misses, vec![(2 * I, 4 * I), (6 * I, 8 * I)]);
        assert_eq!(present, 4);
    }

    #[test]
    fn test_serie_vide_un_seul_segment() {
        let acc = MissAccumulator::new(0, 4 * I, I);
        let (misses, present) = acc.finish();
        assert_eq!(misses, vec![(0, 4 * I)]);
        assert_eq!(present, 0);
    }

    #[test]
    fn test_absence_en_queue() {
        let mut acc = MissAccumulator::new(0, 4 * I, I);
        for t in [0, I] {
            acc.observe(t);
        }
        let (misses, _) = acc.finish();
        assert_eq!(misses, vec![(2 * I, 4 * I)]);
    }

    #[test]
    fn test_ligne_hors_grille_ignoree() {
        let mut acc = MissAccumulator::new(0, 2 * I, I);
        acc.observe(0);
        acc.observe(I + 1); // hors pas
        acc.observe(2 * I);
        let (misses, present) = acc.finish();
        assert_eq!(misses, vec![(I, I)]);
        assert_eq!(present, 2);
    }
}
