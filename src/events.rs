/// Module des événements de diffusion
///
/// DESIGN:
/// Union fermée des variantes du protocole push. L'encodeur d'enveloppe est
/// total sur l'ensemble des variantes: tout événement publiable possède une
/// représentation JSON `{type, seq, epoch, server_time, channel, data}`.
use crate::models::Candle;
use serde::Serialize;

/// Charge utile d'un événement push
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushPayload {
    /// Queue finalisée envoyée à l'acceptation d'une connexion
    Snapshot {
        candles: Vec<Candle>,
        partial: Option<Candle>,
    },
    /// Bougie finalisée contiguë (open_time strictement croissant)
    Append { open_time: i64, candle: Candle },
    /// Bougie partielle (jamais persistée)
    PartialUpdate { candle: Candle },
    /// Clôture d'une partielle, avec la latence depuis la première partielle
    PartialClose {
        open_time: i64,
        candle: Candle,
        latency_ms: i64,
    },
    /// Correction d'une bougie antérieure déjà persistée
    Repair { open_time: i64, candle: Candle },
    GapDetected {
        from_open_time: i64,
        to_open_time: i64,
        missing_bars: i64,
    },
    GapRepaired {
        from_open_time: i64,
        to_open_time: i64,
        recovered_bars: i64,
        mttr_ms: i64,
    },
    Heartbeat,
    Error {
        code: String,
        reason: String,
        request_id: String,
    },
}

impl PushPayload {
    /// Étiquette de la variante (compteurs par type)
    pub fn kind(&self) -> &'static str {
        match self {
            PushPayload::Snapshot { .. } => "snapshot",
            PushPayload::Append { .. } => "append",
            PushPayload::PartialUpdate { .. } => "partial_update",
            PushPayload::PartialClose { .. } => "partial_close",
            PushPayload::Repair { .. } => "repair",
            PushPayload::GapDetected { .. } => "gap_detected",
            PushPayload::GapRepaired { .. } => "gap_repaired",
            PushPayload::Heartbeat => "heartbeat",
            PushPayload::Error { .. } => "error",
        }
    }

    /// open_time de coalescence pour les partielles
    pub fn partial_open_time(&self) -> Option<i64> {
        match self {
            PushPayload::PartialUpdate { candle } => Some(candle.open_time),
            _ => None,
        }
    }
}

/// Enveloppe du protocole push
///
/// Au sein d'un epoch, seq est strictement croissant et sans trou pour une
/// connexion donnée. L'epoch est un jeton opaque, monotone par acceptation.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub seq: i64,
    pub epoch: String,
    pub server_time: i64,
    pub channel: String,
    #[serde(flatten)]
    pub payload: PushPayload,
}

/// Événement interne du hub, avant enveloppement par connexion
#[derive(Debug, Clone)]
pub struct HubEvent {
    pub symbol: String,
    pub timeframe: String,
    pub payload: PushPayload,
}

/// Séquenceur par connexion: attribue seq juste avant l'écriture
///
/// SUBTILITÉ RUST: la structure n'est pas partagée; chaque connexion possède
/// son séquenceur, ce qui garantit l'absence de trous sans synchronisation.
#[derive(Debug)]
pub struct EpochSequencer {
    epoch: String,
    next_seq: i64,
}

impl EpochSequencer {
    pub fn new(epoch: String) -> Self {
        EpochSequencer { epoch, next_seq: 0 }
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Enveloppe un payload avec le prochain seq (0 pour le snapshot initial)
    pub fn envelope(
        &mut self,
        channel: &str,
        server_time: i64,
        payload: PushPayload,
    ) -> Envelope {
        let seq = self.next_seq;
        self.next_seq += 1;
        Envelope {
            seq,
            epoch: self.epoch.clone(),
            server_time,
            channel: channel.to_string(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle() -> Candle {
        Candle {
            open_time: 1_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            close_time: 60_999,
            trade_count: 3,
            is_closed: true,
        }
    }

    #[test]
    fn test_encodeur_total_sur_les_variantes() {
        let variants: Vec<PushPayload> = vec![
            PushPayload::Snapshot {
                candles: vec![candle()],
                partial: None,
            },
            PushPayload::Append {
                open_time: 1_000,
                candle: candle(),
            },
            PushPayload::PartialUpdate { candle: candle() },
            PushPayload::PartialClose {
                open_time: 1_000,
                candle: candle(),
                latency_ms: 42,
            },
            PushPayload::Repair {
                open_time: 1_000,
                candle: candle(),
            },
            PushPayload::GapDetected {
                from_open_time: 0,
                to_open_time: 1_000,
                missing_bars: 1,
            },
            PushPayload::GapRepaired {
                from_open_time: 0,
                to_open_time: 1_000,
                recovered_bars: 1,
                mttr_ms: 500,
            },
            PushPayload::Heartbeat,
            PushPayload::Error {
                code: "server_shutdown".to_string(),
                reason: "arrêt".to_string(),
                request_id: "r-1".to_string(),
            },
        ];

        let mut seq = EpochSequencer::new("e-1".to_string());
        for payload in variants {
            let kind = payload.kind();
            let env = seq.envelope("ohlcv:XRPUSDT:1m", 123, payload);
            let json = serde_json::to_value(&env).unwrap();
            assert_eq!(json["type"], kind);
            assert_eq!(json["epoch"], "e-1");
            assert!(json["seq"].is_i64());
        }
    }

    #[test]
    fn test_seq_sans_trou() {
        let mut seq = EpochSequencer::new("e-2".to_string());
        for expected in 0..5 {
            let env = seq.envelope("c", 0, PushPayload::Heartbeat);
            assert_eq!(env.seq, expected);
        }
    }
}
