/// Module du hub de diffusion
///
/// ARCHITECTURE:
/// Le hub publie des HubEvent sur un canal broadcast; chaque connexion
/// (WS ou SSE) possède son propre récepteur, filtre par (symbol, timeframe),
/// fait transiter les événements par une SubscriberQueue bornée et attribue
/// seq/epoch juste avant l'écriture. Un seul émetteur par abonné: l'ordre
/// total par connexion est garanti par construction.
use crate::events::{HubEvent, PushPayload};
use crate::metrics::Metrics;
use crate::utils::now_ms;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Capacité du canal broadcast interne (indépendante de la file par abonné)
const BROADCAST_CAPACITY: usize = 2_048;

/// Hub de diffusion des événements de continuité
pub struct PushHub {
    tx: broadcast::Sender<HubEvent>,
    epoch_counter: AtomicU64,
    metrics: Arc<Metrics>,
}

impl PushHub {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        PushHub {
            tx,
            epoch_counter: AtomicU64::new(0),
            metrics,
        }
    }

    /// Publie un événement pour un couple (symbol, timeframe)
    ///
    /// L'absence d'abonné n'est pas une erreur: l'événement est compté puis
    /// abandonné par le canal.
    pub fn publish(&self, symbol: &str, timeframe: &str, payload: PushPayload) {
        self.metrics.count_push_event(payload.kind());
        let _ = self.tx.send(HubEvent {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            payload,
        });
    }

    /// Nouveau récepteur pour une connexion entrante
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Jeton d'epoch opaque et monotone par acceptation de connexion
    pub fn next_epoch(&self) -> String {
        let n = self.epoch_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", now_ms(), n)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Verdict d'un enqueue dans la file bornée d'un abonné
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Ajouté en queue
    Queued,
    /// Partielle remplacée par la plus récente pour le même open_time
    Coalesced,
    /// Partielle abandonnée (file saturée, aucun remplacement possible)
    DroppedPartial,
    /// Heartbeat sauté (file saturée)
    DroppedHeartbeat,
    /// Saturation sur un événement non abandonnable: l'abonné doit être
    /// fermé avec un événement error terminal
    Overflow,
}

/// File de sortie bornée d'un abonné
///
/// POLITIQUE (par type d'événement):
/// - append, repair, gap_detected, gap_repaired, partial_close, snapshot,
///   error: jamais abandonnés; la saturation est un Overflow terminal
/// - partial_update: coalescé par remplacement (même open_time), abandonné
///   en dernier recours
/// - heartbeat: sauté sous pression
pub struct SubscriberQueue {
    capacity: usize,
    coalesce_partials: bool,
    items: VecDeque<PushPayload>,
}

impl SubscriberQueue {
    pub fn new(capacity: usize, coalesce_partials: bool) -> Self {
        SubscriberQueue {
            capacity: capacity.max(1),
            coalesce_partials,
            items: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, payload: PushPayload) -> EnqueueOutcome {
        // Remplacement d'une partielle déjà en file pour le même open_time
        if self.coalesce_partials {
            if let Some(open_time) = payload.partial_open_time() {
                if let Some(pos) = self
                    .items
                    .iter()
                    .rposition(|p| p.partial_open_time() == Some(open_time))
                {
                    self.items[pos] = payload;
                    return EnqueueOutcome::Coalesced;
                }
            }
        }

        if self.items.len() < self.capacity {
            self.items.push_back(payload);
            return EnqueueOutcome::Queued;
        }

        match payload {
            PushPayload::Heartbeat => EnqueueOutcome::DroppedHeartbeat,
            PushPayload::PartialUpdate { .. } => EnqueueOutcome::DroppedPartial,
            _ => EnqueueOutcome::Overflow,
        }
    }

    pub fn pop(&mut self) -> Option<PushPayload> {
        self.items.pop_front()
    }
}

/// Applique le verdict d'enqueue aux compteurs du hub
pub fn record_enqueue_outcome(metrics: &Metrics, outcome: EnqueueOutcome) {
    match outcome {
        EnqueueOutcome::Queued => {}
        EnqueueOutcome::Coalesced => {
            metrics.push_coalesced_total.fetch_add(1, Ordering::Relaxed);
        }
        EnqueueOutcome::DroppedPartial | EnqueueOutcome::DroppedHeartbeat => {
            metrics.push_dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        EnqueueOutcome::Overflow => {
            metrics
                .push_subscriber_overflows_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;

    fn partial(open_time: i64, close: f64) -> PushPayload {
        PushPayload::PartialUpdate {
            candle: Candle {
                open_time,
                open: 1.0,
                high: close + 1.0,
                low: 0.5,
                close,
                volume: 1.0,
                close_time: open_time + 59_999,
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
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 1.0,
                close_time: open_time + 59_999,
                trade_count: 1,
                is_closed: true,
            },
        }
    }

    #[test]
    fn test_coalescence_des_partielles() {
        let mut q = SubscriberQueue::new(8, true);

        assert_eq!(q.push(partial(1_000, 1.0)), EnqueueOutcome::Queued);
        // 99 mises à jour suivantes pour le même open_time: remplacées
        for i in 0..99 {
            assert_eq!(
                q.push(partial(1_000, 2.0 + i as f64)),
                EnqueueOutcome::Coalesced
            );
        }
        assert_eq!(q.len(), 1);

        // Seule la plus récente est délivrée
        match q.pop().unwrap() {
            PushPayload::PartialUpdate { candle } => assert_eq!(candle.close, 100.0),
            other => panic!("attendu partielle, obtenu {:?}", other.kind()),
        }
    }

    #[test]
    fn test_append_jamais_coalesce_et_overflow_terminal() {
        let mut q = SubscriberQueue::new(3, true);
        assert_eq!(q.push(append(0)), EnqueueOutcome::Queued);
        assert_eq!(q.push(append(60_000)), EnqueueOutcome::Queued);
        assert_eq!(q.push(append(120_000)), EnqueueOutcome::Queued);
        // File pleine: un append de plus est une saturation terminale
        assert_eq!(q.push(append(180_000)), EnqueueOutcome::Overflow);
        // Les trois en file restent intacts
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_heartbeat_saute_sous_pression() {
        let mut q = SubscriberQueue::new(1, true);
        assert_eq!(q.push(append(0)), EnqueueOutcome::Queued);
        assert_eq!(q.push(PushPayload::Heartbeat), EnqueueOutcome::DroppedHeartbeat);
    }

    #[test]
    fn test_partielle_abandonnee_en_dernier_recours() {
        // File saturée par des appends, partielle d'un open_time inédit
        let mut q = SubscriberQueue::new(2, true);
        q.push(append(0));
        q.push(append(60_000));
        assert_eq!(q.push(partial(120_000, 1.0)), EnqueueOutcome::DroppedPartial);
    }

    #[test]
    fn test_sans_coalescence_la_file_se_remplit() {
        let mut q = SubscriberQueue::new(4, false);
        for i in 0..4 {
            assert_eq!(q.push(partial(1_000, i as f64)), EnqueueOutcome::Queued);
        }
        assert_eq!(q.push(partial(1_000, 9.0)), EnqueueOutcome::DroppedPartial);
    }
}
