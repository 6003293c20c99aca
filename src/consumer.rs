/// Module du consommateur de flux temps réel
///
/// ARCHITECTURE:
/// Un consommateur par couple (symbol, timeframe), seul émetteur des
/// événements `append` de son couple: l'ordre strictement croissant des
/// open_time est garanti par construction. Les écritures passent par le
/// store canonique (upsert idempotent) et les trous détectés sont remis au
/// dépôt de gaps; l'orchestrateur s'en charge sans référence directe.
///
/// Machine à états:
/// IDLE → CONNECTING → STREAMING → RESYNCING → STREAMING → …
/// FAULTED sur panne permanente de l'adaptateur (quarantaine).
use crate::errors::StoreError;
use crate::events::PushPayload;
use crate::gap_repository::{AbsorbOutcome, GapRepository, MergeOutcome, NewGapSegment};
use crate::hub::PushHub;
use crate::metrics::Metrics;
use crate::models::Candle;
use crate::store::CanonicalStore;
use crate::upstream::{StreamCandleEvent, StreamMessage};
use crate::utils::{format_timestamp_ms, now_ms};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Tentatives locales sur indisponibilité du store (jamais propagée)
const PERSIST_RETRY_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Streaming,
    Resyncing,
    Faulted,
}

/// Partielle en mémoire, avec l'horodatage de sa première observation
struct PendingPartial {
    candle: Candle,
    first_seen_ms: i64,
}

pub struct StreamConsumer {
    symbol: String,
    timeframe: String,
    interval_ms: i64,
    store: CanonicalStore,
    gaps: GapRepository,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
    state: ConsumerState,
    last_closed: Option<i64>,
    pending_partial: Option<PendingPartial>,
}

impl StreamConsumer {
    pub fn new(
        symbol: &str,
        timeframe: &str,
        interval_ms: i64,
        store: CanonicalStore,
        gaps: GapRepository,
        hub: Arc<PushHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        StreamConsumer {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            interval_ms,
            store,
            gaps,
            hub,
            metrics,
            state: ConsumerState::Idle,
            last_closed: None,
            pending_partial: None,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn last_closed(&self) -> Option<i64> {
        self.last_closed
    }

    /// Boucle principale, à exécuter dans un contexte bloquant
    ///
    /// À l'arrêt: on cesse de lire le flux, la partielle en mémoire est
    /// abandonnée (jamais persistée) et les écritures en cours sont déjà
    /// flushées car chaque événement est traité transactionnellement.
    pub fn run_blocking(
        mut self,
        mut rx: mpsc::Receiver<StreamMessage>,
        shutdown: Arc<AtomicBool>,
    ) {
        self.state = ConsumerState::Connecting;
        println!("▶️ Consommateur démarré pour {}/{}", self.symbol, self.timeframe);

        while let Some(msg) = rx.blocking_recv() {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.handle_message(msg);
            if self.state == ConsumerState::Faulted {
                break;
            }
        }

        println!("🛑 Consommateur arrêté pour {}/{}", self.symbol, self.timeframe);
    }

    /// Traite un message du flux (point d'entrée aussi utilisé par les tests)
    pub fn handle_message(&mut self, msg: StreamMessage) {
        match msg {
            StreamMessage::Reconnected => self.enter_resync(),
            StreamMessage::Fatal(reason) => {
                eprintln!(
                    "❌ Quarantaine de {}/{}: {}",
                    self.symbol, self.timeframe, reason
                );
                self.state = ConsumerState::Faulted;
                self.hub.publish(
                    &self.symbol,
                    &self.timeframe,
                    PushPayload::Error {
                        code: "adapter_fatal".to_string(),
                        reason,
                        request_id: String::new(),
                    },
                );
            }
            StreamMessage::Candle(event) => {
                if event.candle.is_closed {
                    self.handle_final(event);
                } else {
                    self.handle_partial(event);
                }
            }
        }
    }

    /// Recharge le pointeur de continuité depuis le store
    fn enter_resync(&mut self) {
        self.state = ConsumerState::Resyncing;
        match self.store.get_last_closed(&self.symbol, &self.timeframe) {
            Ok(last) => {
                self.last_closed = last;
                println!(
                    "🔁 Resynchronisation {}/{}: last_closed = {}",
                    self.symbol,
                    self.timeframe,
                    last.map(format_timestamp_ms).unwrap_or_else(|| "aucun".to_string())
                );
            }
            Err(e) => {
                eprintln!("⚠️ Resynchronisation impossible ({}), pointeur conservé", e);
            }
        }
    }

    /// Politique par événement finalisé
    ///
    /// ALGORITHME (ot = open_time de l'événement):
    /// - pointeur vide → persister, append, pointeur = ot
    /// - ot == pointeur + intervalle → persister, append, avancer
    /// - ot > pointeur + intervalle → persister, lever le gap
    ///   [pointeur + i, ot − i], gap_detected puis append, avancer
    /// - ot <= pointeur → arrivée tardive: upsert; repair si le contenu a
    ///   changé, absorption par le segment ouvert couvrant ot le cas échéant
    fn handle_final(&mut self, event: StreamCandleEvent) {
        let candle = event.candle.clone();
        let ot = candle.open_time;

        if matches!(
            self.state,
            ConsumerState::Idle | ConsumerState::Connecting | ConsumerState::Resyncing
        ) {
            self.state = ConsumerState::Streaming;
        }

        match self.last_closed {
            None => {
                if self.persist(&candle) {
                    self.last_closed = Some(ot);
                    self.publish_append(candle.clone());
                }
            }
            Some(last) if ot == last + self.interval_ms => {
                if self.persist(&candle) {
                    self.last_closed = Some(ot);
                    self.publish_append(candle.clone());
                }
            }
            Some(last) if ot > last + self.interval_ms => {
                if self.persist(&candle) {
                    self.raise_gap(last + self.interval_ms, ot - self.interval_ms);
                    self.last_closed = Some(ot);
                    self.publish_append(candle.clone());
                }
            }
            Some(_) => self.handle_late_fill(&candle),
        }

        // Clôture de la partielle correspondante
        let first_seen = self
            .pending_partial
            .as_ref()
            .filter(|p| p.candle.open_time == ot)
            .map(|p| p.first_seen_ms);
        if let Some(first_seen_ms) = first_seen {
            self.pending_partial = None;
            let latency_ms = (event.received_at_ms - first_seen_ms).max(0);
            self.metrics
                .partial_close_latency
                .record(latency_ms as u64);
            self.hub.publish(
                &self.symbol,
                &self.timeframe,
                PushPayload::PartialClose {
                    open_time: ot,
                    candle,
                    latency_ms,
                },
            );
        }

        if let Some(last) = self.last_closed {
            self.metrics
                .stream_lag_ms
                .store(now_ms() - last, Ordering::Relaxed);
        }
    }

    /// Partielle: mémorisée (jamais persistée) et diffusée
    fn handle_partial(&mut self, event: StreamCandleEvent) {
        let ot = event.candle.open_time;
        match &mut self.pending_partial {
            Some(pending) if pending.candle.open_time == ot => {
                pending.candle = event.candle.clone();
            }
            _ => {
                self.pending_partial = Some(PendingPartial {
                    candle: event.candle.clone(),
                    first_seen_ms: event.received_at_ms,
                });
            }
        }
        self.hub.publish(
            &self.symbol,
            &self.timeframe,
            PushPayload::PartialUpdate {
                candle: event.candle,
            },
        );
    }

    /// Arrivée tardive (ot <= pointeur)
    fn handle_late_fill(&mut self, candle: &Candle) {
        self.metrics.late_fills_total.fetch_add(1, Ordering::Relaxed);

        let report = match self.persist_report(candle) {
            Some(r) => r,
            None => return,
        };

        // Contenu divergent: correction diffusée; doublon identique: silence
        if report.updated > 0 {
            self.hub.publish(
                &self.symbol,
                &self.timeframe,
                PushPayload::Repair {
                    open_time: candle.open_time,
                    candle: candle.clone(),
                },
            );
        }

        // Absorption par un segment ouvert couvrant ot
        let seg = match self
            .gaps
            .find_open_containing(&self.symbol, &self.timeframe, candle.open_time)
        {
            Ok(Some(seg)) => seg,
            Ok(None) => return,
            Err(e) => {
                eprintln!("⚠️ Lecture des segments impossible: {}", e);
                return;
            }
        };

        match self
            .gaps
            .absorb_open_time(seg.id, candle.open_time, self.interval_ms)
        {
            Ok(AbsorbOutcome::Recovered) => {
                let mttr_ms = (now_ms() - seg.detected_at).max(0);
                self.metrics.gap_mttr.record(mttr_ms as u64);
                self.metrics.gaps_repaired_total.fetch_add(1, Ordering::Relaxed);
                if let Ok(open) = self.gaps.count_open() {
                    self.metrics.open_gap_count.store(open, Ordering::Relaxed);
                }
                self.hub.publish(
                    &self.symbol,
                    &self.timeframe,
                    PushPayload::GapRepaired {
                        from_open_time: seg.from_open_time,
                        to_open_time: seg.to_open_time,
                        recovered_bars: seg.missing_bars,
                        mttr_ms,
                    },
                );
                println!(
                    "✅ Gap refermé par arrivée tardive pour {}/{} à {}",
                    self.symbol,
                    self.timeframe,
                    format_timestamp_ms(candle.open_time)
                );
            }
            Ok(_) => {}
            Err(e) => eprintln!("⚠️ Absorption impossible sur le segment {}: {}", seg.id, e),
        }
    }

    /// Lève un segment de gap [from, to] et le diffuse
    fn raise_gap(&mut self, from: i64, to: i64) {
        let missing_bars = (to - from) / self.interval_ms + 1;
        println!(
            "🕳️ Gap détecté sur {}/{}: [{} .. {}] ({} bougies)",
            self.symbol,
            self.timeframe,
            format_timestamp_ms(from),
            format_timestamp_ms(to),
            missing_bars
        );

        let new_seg = NewGapSegment {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            from_open_time: from,
            to_open_time: to,
            detected_at: now_ms(),
        };
        match self.gaps.merge_or_insert(&new_seg, self.interval_ms) {
            Ok(outcome) => {
                self.metrics.gaps_detected_total.fetch_add(1, Ordering::Relaxed);
                if let MergeOutcome::Merged { .. } = outcome {
                    self.metrics.gaps_merged_total.fetch_add(1, Ordering::Relaxed);
                }
                if let Ok(open) = self.gaps.count_open() {
                    self.metrics.open_gap_count.store(open, Ordering::Relaxed);
                }
            }
            Err(e) => eprintln!("⚠️ Enregistrement du gap impossible: {}", e),
        }

        self.hub.publish(
            &self.symbol,
            &self.timeframe,
            PushPayload::GapDetected {
                from_open_time: from,
                to_open_time: to,
                missing_bars,
            },
        );
    }

    fn publish_append(&self, candle: Candle) {
        self.metrics
            .candles_ingested_total
            .fetch_add(1, Ordering::Relaxed);
        self.hub.publish(
            &self.symbol,
            &self.timeframe,
            PushPayload::Append {
                open_time: candle.open_time,
                candle,
            },
        );
    }

    /// Persiste une bougie, avec retry local sur indisponibilité
    ///
    /// RETOUR: true si la bougie est en base à la sortie
    fn persist(&mut self, candle: &Candle) -> bool {
        self.persist_report(candle).is_some()
    }

    fn persist_report(&mut self, candle: &Candle) -> Option<crate::store::UpsertReport> {
        let batch = [candle.clone()];
        let mut attempt = 0u32;
        loop {
            match self.store.upsert_candles(&self.symbol, &self.timeframe, &batch) {
                Ok(report) => return Some(report),
                Err(StoreError::Unavailable(msg)) if attempt < PERSIST_RETRY_MAX => {
                    attempt += 1;
                    eprintln!(
                        "⚠️ Store indisponible ({}), tentative {}/{}",
                        msg, attempt, PERSIST_RETRY_MAX
                    );
                    std::thread::sleep(std::time::Duration::from_millis(200 * attempt as u64));
                }
                Err(e) => {
                    eprintln!(
                        "❌ Persistance impossible pour {}/{} à {}: {}",
                        self.symbol,
                        self.timeframe,
                        format_timestamp_ms(candle.open_time),
                        e
                    );
                    return None;
                }
            }
        }
    }
}
