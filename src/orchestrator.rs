/// Module de l'orchestrateur de gaps
///
/// ARCHITECTURE:
/// Au plus un orchestrateur actif par flotte: le leadership est porté par le
/// verrou consultatif nommé du store, pas par un singleton de processus. Le
/// leader charge les segments ouverts (priorité missing_bars DESC,
/// detected_at ASC), distribue au plus N workers et refuse deux workers sur
/// des plages chevauchantes d'un même couple. À la perte du verrou, les
/// workers en vol sont drainés puis l'orchestrateur se met en retrait.
use crate::backfill::{BackfillWorker, RecoveryOutcome};
use crate::errors::BackfillError;
use crate::gap_repository::GapRepository;
use crate::hub::PushHub;
use crate::metrics::Metrics;
use crate::models::{GapSegment, GapState};
use crate::store::CanonicalStore;
use crate::upstream::HistorySource;
use crate::utils::{now_ms, timeframe_to_interval};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

/// Plafond de segments rechargés par tick
const LOAD_LIMIT: usize = 64;

/// Plage en cours de reprise par un worker
#[derive(Debug, Clone)]
struct ActiveRange {
    segment_id: i64,
    symbol: String,
    timeframe: String,
    from_open_time: i64,
    to_open_time: i64,
}

pub struct GapOrchestrator {
    db_file: String,
    lock_key: String,
    poll_interval_ms: u64,
    concurrency: usize,
    page_size: usize,
    max_pages: usize,
    retry_max: u32,
    retry_backoff_ms: i64,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
}

impl GapOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_file: &str,
        lock_key: &str,
        poll_interval_ms: u64,
        concurrency: usize,
        page_size: usize,
        max_pages: usize,
        retry_max: u32,
        retry_backoff_ms: i64,
        hub: Arc<PushHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        GapOrchestrator {
            db_file: db_file.to_string(),
            lock_key: lock_key.to_string(),
            poll_interval_ms: poll_interval_ms.max(250),
            concurrency: concurrency.max(1),
            page_size,
            max_pages,
            retry_max,
            retry_backoff_ms: retry_backoff_ms.max(100),
            hub,
            metrics,
        }
    }

    /// Cool-off d'un segment in_progress selon son nombre d'échecs
    ///
    /// RETOUR: true si le segment peut être redistribué maintenant
    fn cooled_off(segment: &GapSegment, retry_backoff_ms: i64, now: i64) -> bool {
        if segment.state == GapState::Open {
            return true;
        }
        match segment.last_attempt_at {
            None => true,
            Some(last) => {
                let shift = segment.retry_count.min(6) as u32;
                now >= last + retry_backoff_ms * (1i64 << shift)
            }
        }
    }

    /// Boucle de vie de l'orchestrateur
    ///
    /// ALGORITHME (par tick):
    /// 1. Prise ou ré-armement du verrou de leadership
    /// 2. Leader: chargement des segments ouverts, distribution sous le
    ///    plafond de concurrence, rejet des chevauchements
    /// 3. Attente du prochain tick ou d'une fin de worker (re-tick immédiat)
    pub async fn run(self, source: Arc<dyn HistorySource>, shutdown: Arc<AtomicBool>) {
        let owner = format!("orchestrator-{}-{}", std::process::id(), now_ms());
        let lock_ttl_ms = (self.poll_interval_ms as i64 * 3).max(15_000);

        let store = match CanonicalStore::new(&self.db_file) {
            Ok(s) => Arc::new(Mutex::new(s)),
            Err(e) => {
                eprintln!("❌ Orchestrateur sans store: {}", e);
                return;
            }
        };
        let gaps = match GapRepository::new(&self.db_file) {
            Ok(g) => Arc::new(Mutex::new(g)),
            Err(e) => {
                eprintln!("❌ Orchestrateur sans dépôt de gaps: {}", e);
                return;
            }
        };

        let mut leader = false;
        let mut active: Vec<ActiveRange> = Vec::new();
        let mut workers: JoinSet<(i64, Result<RecoveryOutcome, BackfillError>)> = JoinSet::new();

        println!("🗂️ Orchestrateur prêt (owner {})", owner);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            // Leadership par verrou consultatif
            let held = {
                let store = Arc::clone(&store);
                let key = self.lock_key.clone();
                let owner = owner.clone();
                tokio::task::spawn_blocking(move || {
                    let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
                    store.try_acquire_lock(&key, &owner, lock_ttl_ms)
                })
                .await
                .unwrap_or(Ok(false))
                .unwrap_or(false)
            };

            if held && !leader {
                leader = true;
                println!("👑 Leadership de l'orchestrateur acquis ({})", owner);
            } else if !held && leader {
                // Perte du verrou: drainer les workers puis se mettre en retrait
                leader = false;
                eprintln!("⚠️ Leadership perdu, drainage de {} workers", workers.len());
                while workers.join_next().await.is_some() {}
                active.clear();
            }

            if leader {
                let open = {
                    let gaps = Arc::clone(&gaps);
                    tokio::task::spawn_blocking(move || {
                        let gaps = gaps.lock().unwrap_or_else(|p| p.into_inner());
                        gaps.load_open(LOAD_LIMIT)
                    })
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default()
                };

                self.metrics
                    .orchestrator_queue_depth
                    .store(open.len() as i64, Ordering::Relaxed);
                self.metrics
                    .open_gap_count
                    .store(open.len() as i64, Ordering::Relaxed);

                let now = now_ms();
                for segment in open {
                    if workers.len() >= self.concurrency {
                        break;
                    }
                    if active.iter().any(|a| a.segment_id == segment.id) {
                        continue;
                    }
                    // Jamais deux workers sur des plages chevauchantes d'un
                    // même couple
                    let overlaps = active.iter().any(|a| {
                        a.symbol == segment.symbol
                            && a.timeframe == segment.timeframe
                            && a.from_open_time <= segment.to_open_time
                            && a.to_open_time >= segment.from_open_time
                    });
                    if overlaps {
                        continue;
                    }
                    if !Self::cooled_off(&segment, self.retry_backoff_ms, now) {
                        continue;
                    }

                    active.push(ActiveRange {
                        segment_id: segment.id,
                        symbol: segment.symbol.clone(),
                        timeframe: segment.timeframe.clone(),
                        from_open_time: segment.from_open_time,
                        to_open_time: segment.to_open_time,
                    });

                    let worker = BackfillWorker::new(
                        &self.db_file,
                        self.page_size,
                        self.max_pages,
                        self.retry_max,
                        Arc::clone(&self.hub),
                        Arc::clone(&self.metrics),
                    );
                    let source = Arc::clone(&source);
                    let shutdown = Arc::clone(&shutdown);
                    let interval_ms = timeframe_to_interval(&segment.timeframe);
                    let seg_id = segment.id;

                    workers.spawn_blocking(move || {
                        let result = worker.recover_segment(
                            source.as_ref(),
                            &segment,
                            interval_ms,
                            &shutdown,
                        );
                        (seg_id, result)
                    });
                }
            }

            // Fin de worker → re-tick immédiat, sinon tick périodique
            tokio::select! {
                joined = workers.join_next(), if !workers.is_empty() => {
                    if let Some(Ok((seg_id, result))) = joined {
                        active.retain(|a| a.segment_id != seg_id);
                        match result {
                            Ok(outcome) if outcome.recovered => {}
                            Ok(outcome) => {
                                eprintln!(
                                    "🏁 Segment #{} incomplet ({} bougies chargées)",
                                    outcome.segment_id, outcome.loaded_bars
                                );
                            }
                            Err(BackfillError::Cancelled) => {}
                            Err(e) => {
                                eprintln!("⚠️ Worker en échec sur le segment #{}: {}", seg_id, e);
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)) => {}
            }
        }

        // Arrêt ordonné: drainage puis libération du verrou
        while workers.join_next().await.is_some() {}
        if leader {
            let store = Arc::clone(&store);
            let key = self.lock_key.clone();
            let owner_cl = owner.clone();
            let _ = tokio::task::spawn_blocking(move || {
                let store = store.lock().unwrap_or_else(|p| p.into_inner());
                store.release_lock(&key, &owner_cl)
            })
            .await;
        }
        println!("🛑 Orchestrateur arrêté ({})", owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(state: GapState, retry_count: i64, last_attempt_at: Option<i64>) -> GapSegment {
        GapSegment {
            id: 1,
            symbol: "XRPUSDT".to_string(),
            timeframe: "1m".to_string(),
            from_open_time: 0,
            to_open_time: 60_000,
            missing_bars: 2,
            state,
            detected_at: 0,
            retry_count,
            last_attempt_at,
            last_error: None,
            merged_into: None,
        }
    }

    #[test]
    fn test_cool_off_exponentiel() {
        let backoff = 1_000;
        // open: toujours distribuable
        assert!(GapOrchestrator::cooled_off(
            &segment(GapState::Open, 5, Some(0)),
            backoff,
            1
        ));
        // in_progress, 2 échecs: attendre 4 s après la dernière tentative
        let seg = segment(GapState::InProgress, 2, Some(10_000));
        assert!(!GapOrchestrator::cooled_off(&seg, backoff, 13_000));
        assert!(GapOrchestrator::cooled_off(&seg, backoff, 14_000));
        // jamais tenté: distribuable
        assert!(GapOrchestrator::cooled_off(
            &segment(GapState::InProgress, 0, None),
            backoff,
            0
        ));
    }
}
