/// Module de backfill des chandelles manquantes
///
/// Contient la logique métier pour récupérer les bougies absentes du store:
/// soit la reprise d'un segment de gap précis (worker piloté par
/// l'orchestrateur), soit la couverture d'un horizon complet (backfill
/// annuel déclenché par l'admin). Les deux chemins partagent la pagination
/// REST, l'upsert idempotent et l'audit backfill_runs.
use crate::errors::BackfillError;
use crate::events::PushPayload;
use crate::gap_repository::GapRepository;
use crate::hub::PushHub;
use crate::metrics::Metrics;
use crate::models::{BackfillStatus, GapSegment, GapState};
use crate::store::CanonicalStore;
use crate::upstream::HistorySource;
use crate::utils::{align_open_time, format_timestamp_ms, now_ms, timeframe_to_interval};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Résultat d'une tentative de reprise d'un segment
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub segment_id: i64,
    pub recovered: bool,
    pub loaded_bars: i64,
    pub mttr_ms: Option<i64>,
}

/// Worker de reprise d'un segment de gap
///
/// ARCHITECTURE:
/// Chaque worker ouvre ses propres connexions au store et au dépôt de gaps
/// et s'exécute dans un contexte bloquant (REST et SQLite sont synchrones).
/// L'orchestrateur garantit qu'aucun autre worker ne traite une plage
/// chevauchante du même couple.
pub struct BackfillWorker {
    db_file: String,
    page_size: usize,
    max_pages: usize,
    /// Nombre de passes fetch+vérification avant d'abandonner la tentative
    passes_max: u32,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
}

impl BackfillWorker {
    pub fn new(
        db_file: &str,
        page_size: usize,
        max_pages: usize,
        passes_max: u32,
        hub: Arc<PushHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        BackfillWorker {
            db_file: db_file.to_string(),
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
            passes_max: passes_max.max(1),
            hub,
            metrics,
        }
    }

    /// Reprend un segment de gap
    ///
    /// ALGORITHME:
    /// 1. Segment marqué in_progress, run d'audit créé puis passé running
    /// 2. Par passe: pagination REST du curseur `from` vers `to`, upsert de
    ///    chaque page, diffusion `repair` des barres matérialisées
    /// 3. Vérification par comptage exact; complet → recovered + mesure du
    ///    MTTR + `gap_repaired`
    /// 4. Incomplet après toutes les passes → increment_retry, le segment
    ///    reste in_progress (ré-ouvert par la politique de cool-off ou le
    ///    scanner)
    ///
    /// Annulation coopérative: le signal d'arrêt est consulté entre chaque
    /// page.
    pub fn recover_segment(
        &self,
        source: &dyn HistorySource,
        segment: &GapSegment,
        interval_ms: i64,
        shutdown: &AtomicBool,
    ) -> Result<RecoveryOutcome, BackfillError> {
        let mut store = CanonicalStore::new(&self.db_file)?;
        let gaps = GapRepository::new(&self.db_file)?;

        let from = segment.from_open_time;
        let to = segment.to_open_time;
        let expected = segment.expected_bars(interval_ms);

        println!(
            "🔧 Reprise du gap #{} {}/{}: [{} .. {}] ({} bougies attendues)",
            segment.id,
            segment.symbol,
            segment.timeframe,
            format_timestamp_ms(from),
            format_timestamp_ms(to),
            expected
        );

        if segment.state == GapState::Open {
            gaps.mark_in_progress(segment.id)?;
        }

        let run_id = store.create_backfill_run(&segment.symbol, &segment.timeframe, from, to, expected)?;
        store.mark_run_running(run_id)?;

        let mut loaded_total = 0i64;
        let mut last_error: Option<String> = None;

        for pass in 1..=self.passes_max {
            match self.fetch_range(
                source,
                &mut store,
                &segment.symbol,
                &segment.timeframe,
                from,
                to,
                interval_ms,
                true,
                shutdown,
            ) {
                Ok(loaded) => {
                    loaded_total += loaded;
                    store.update_run_progress(run_id, loaded_total)?;
                }
                Err(BackfillError::Cancelled) => {
                    store.finish_run(
                        run_id,
                        BackfillStatus::Partial,
                        loaded_total,
                        Some("interrompu par le signal d'arrêt"),
                    )?;
                    return Err(BackfillError::Cancelled);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    eprintln!("⚠️ Passe {} en échec sur le gap #{}: {}", pass, segment.id, e);
                    continue;
                }
            }

            let present = store.count_range(&segment.symbol, &segment.timeframe, from, to)?;
            if present >= expected {
                gaps.mark_recovered(segment.id)?;
                let mttr_ms = (now_ms() - segment.detected_at).max(0);
                self.metrics.gap_mttr.record(mttr_ms as u64);
                self.metrics.gaps_repaired_total.fetch_add(1, Ordering::Relaxed);
                if let Ok(open) = gaps.count_open() {
                    self.metrics.open_gap_count.store(open, Ordering::Relaxed);
                }
                store.finish_run(run_id, BackfillStatus::Success, loaded_total, None)?;

                self.hub.publish(
                    &segment.symbol,
                    &segment.timeframe,
                    PushPayload::GapRepaired {
                        from_open_time: from,
                        to_open_time: to,
                        recovered_bars: expected,
                        mttr_ms,
                    },
                );
                println!(
                    "✅ Gap #{} refermé en {} ms ({} bougies chargées)",
                    segment.id, mttr_ms, loaded_total
                );

                return Ok(RecoveryOutcome {
                    segment_id: segment.id,
                    recovered: true,
                    loaded_bars: loaded_total,
                    mttr_ms: Some(mttr_ms),
                });
            }

            last_error = Some(format!(
                "passe {}: {} bougies présentes sur {}",
                pass, present, expected
            ));
        }

        // Le segment reste in_progress; la politique de cool-off de
        // l'orchestrateur ou le scanner le représentera
        gaps.increment_retry(segment.id, last_error.as_deref())?;
        store.finish_run(
            run_id,
            BackfillStatus::Partial,
            loaded_total,
            last_error.as_deref(),
        )?;
        eprintln!(
            "🏁 Gap #{} toujours incomplet après {} passes",
            segment.id, self.passes_max
        );

        Ok(RecoveryOutcome {
            segment_id: segment.id,
            recovered: false,
            loaded_bars: loaded_total,
            mttr_ms: None,
        })
    }

    /// Pagine [from, to] et upsert chaque page
    ///
    /// RETOUR: nombre de barres matérialisées (insertions + corrections)
    fn fetch_range(
        &self,
        source: &dyn HistorySource,
        store: &mut CanonicalStore,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
        interval_ms: i64,
        broadcast_bars: bool,
        shutdown: &AtomicBool,
    ) -> Result<i64, BackfillError> {
        let mut cursor = from;
        let mut loaded = 0i64;
        let mut pages = 0usize;

        while cursor <= to && pages < self.max_pages {
            if shutdown.load(Ordering::Relaxed) {
                return Err(BackfillError::Cancelled);
            }

            let page = source.fetch_history(
                symbol,
                timeframe,
                cursor,
                to + interval_ms - 1,
                self.page_size,
            )?;
            pages += 1;

            if page.is_empty() {
                break; // le fournisseur n'a plus rien sur la plage
            }

            let last_open_time = page.last().map(|c| c.open_time).unwrap_or(to);
            let in_range: Vec<_> = page
                .into_iter()
                .filter(|c| c.open_time >= from && c.open_time <= to)
                .collect();

            let report = store.upsert_candles(symbol, timeframe, &in_range)?;
            loaded += report.inserted + report.updated;

            if broadcast_bars {
                // Les barres comblées arrivent hors ordre temps réel: le hub
                // les étiquette repair
                for candle in report
                    .inserted_candles
                    .iter()
                    .chain(report.repairs.iter())
                {
                    self.hub.publish(
                        symbol,
                        timeframe,
                        PushPayload::Repair {
                            open_time: candle.open_time,
                            candle: candle.clone(),
                        },
                    );
                }
            }

            cursor = last_open_time + interval_ms;
        }

        Ok(loaded)
    }
}

/// Options du backfill d'horizon (déclenchement admin)
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Le symbole/paire de trading à couvrir (ex: BTCUSDT)
    pub symbol: String,
    pub timeframe: String,
    /// Horizon couvert en jours (par défaut un an)
    pub horizon_days: i64,
    pub page_size: usize,
    pub max_pages: usize,
    pub db_file: String,
}

impl BackfillOptions {
    /// Crée des options de backfill avec les valeurs par défaut
    pub fn new(symbol: String, timeframe: String, db_file: String) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            timeframe,
            horizon_days: 365,
            page_size: 1_000,
            max_pages: 600,
            db_file,
        }
    }

    /// Définit l'horizon couvert en jours
    pub fn with_horizon_days(mut self, days: i64) -> Self {
        self.horizon_days = days;
        self
    }

    pub fn with_paging(mut self, page_size: usize, max_pages: usize) -> Self {
        self.page_size = page_size;
        self.max_pages = max_pages;
        self
    }
}

/// Exécute le backfill d'horizon pour une paire de trading
///
/// Couvre [now − horizon, now − intervalle] en avançant le curseur page par
/// page. Les barres ne sont pas diffusées individuellement (volumétrie d'un
/// an); la progression est suivie dans backfill_runs et interrogeable via
/// /ohlcv/backfill/year/status.
pub fn run_horizon_backfill(
    source: &dyn HistorySource,
    options: &BackfillOptions,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
    shutdown: &AtomicBool,
) -> Result<i64, BackfillError> {
    let interval_ms = timeframe_to_interval(&options.timeframe);
    let now = now_ms();
    let from = align_open_time(now - options.horizon_days * 86_400_000, interval_ms);
    let to = align_open_time(now, interval_ms) - interval_ms;
    let expected = (to - from) / interval_ms + 1;

    println!(
        "🔄 Démarrage backfill d'horizon pour {}/{} ({} jours, {} bougies attendues)",
        options.symbol, options.timeframe, options.horizon_days, expected
    );

    let mut store = CanonicalStore::new(&options.db_file)?;
    let run_id = store.create_backfill_run(&options.symbol, &options.timeframe, from, to, expected)?;
    store.mark_run_running(run_id)?;

    let worker = BackfillWorker::new(
        &options.db_file,
        options.page_size,
        options.max_pages,
        1,
        hub,
        metrics,
    );

    match worker.fetch_range(
        source,
        &mut store,
        &options.symbol,
        &options.timeframe,
        from,
        to,
        interval_ms,
        false,
        shutdown,
    ) {
        Ok(loaded) => {
            let present = store.count_range(&options.symbol, &options.timeframe, from, to)?;
            let status = if present >= expected {
                BackfillStatus::Success
            } else {
                BackfillStatus::Partial
            };
            store.finish_run(run_id, status, loaded, None)?;
            println!(
                "✅ Backfill d'horizon terminé pour {}/{}: {} chargées, {} présentes sur {}",
                options.symbol, options.timeframe, loaded, present, expected
            );
            Ok(loaded)
        }
        Err(BackfillError::Cancelled) => {
            store.finish_run(
                run_id,
                BackfillStatus::Partial,
                0,
                Some("interrompu par le signal d'arrêt"),
            )?;
            Err(BackfillError::Cancelled)
        }
        Err(e) => {
            store.finish_run(run_id, BackfillStatus::Error, 0, Some(&e.to_string()))?;
            Err(e)
        }
    }
}
