/// Module des structures de données du moteur de continuité
///
/// ARCHITECTURE:
/// Trois familles: les bougies (clé canonique open_time au sein d'un couple
/// symbol/timeframe), les segments de gaps (plages contiguës de bougies
/// manquantes) et les runs de backfill (lignes d'audit, jamais mutées par
/// les consommateurs).
use serde::{Deserialize, Serialize};

/// Une bougie OHLCV
///
/// Le couple (symbol, timeframe) est porté par le contexte d'appel, comme
/// pour les requêtes SQL. `is_closed = false` désigne une bougie partielle,
/// transitoire, jamais persistée comme finale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub trade_count: i64,
    pub is_closed: bool,
}

impl Candle {
    /// Vérifie les invariants OHLC
    ///
    /// RETOUR: false si la bougie est incohérente (elle sera rejetée et
    /// comptée dans les métriques, jamais persistée)
    pub fn is_coherent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.low <= self.high
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
    }

    /// Compare le contenu (hors is_closed) pour la détection de réparations
    pub fn same_content(&self, other: &Candle) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.close_time == other.close_time
            && self.trade_count == other.trade_count
    }
}

/// États d'un segment de gap
///
/// `merged` est terminal et référence le segment survivant via merged_into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapState {
    Open,
    InProgress,
    Recovered,
    Merged,
}

impl GapState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapState::Open => "open",
            GapState::InProgress => "in_progress",
            GapState::Recovered => "recovered",
            GapState::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<GapState> {
        match s {
            "open" => Some(GapState::Open),
            "in_progress" => Some(GapState::InProgress),
            "recovered" => Some(GapState::Recovered),
            "merged" => Some(GapState::Merged),
            _ => None,
        }
    }
}

/// Plage contiguë de open_time manquants, bornes incluses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapSegment {
    pub id: i64,
    pub symbol: String,
    pub timeframe: String,
    pub from_open_time: i64,
    pub to_open_time: i64,
    pub missing_bars: i64,
    pub state: GapState,
    pub detected_at: i64,
    pub retry_count: i64,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub merged_into: Option<i64>,
}

impl GapSegment {
    /// Nombre de bougies attendues dans la plage [from, to]
    pub fn expected_bars(&self, interval_ms: i64) -> i64 {
        (self.to_open_time - self.from_open_time) / interval_ms + 1
    }
}

/// Statut d'un run de backfill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Pending,
    Running,
    Success,
    Partial,
    Error,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Running => "running",
            BackfillStatus::Success => "success",
            BackfillStatus::Partial => "partial",
            BackfillStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<BackfillStatus> {
        match s {
            "pending" => Some(BackfillStatus::Pending),
            "running" => Some(BackfillStatus::Running),
            "success" => Some(BackfillStatus::Success),
            "partial" => Some(BackfillStatus::Partial),
            "error" => Some(BackfillStatus::Error),
            _ => None,
        }
    }
}

/// Ligne d'audit d'un run de backfill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRun {
    pub id: i64,
    pub symbol: String,
    pub timeframe: String,
    pub from_open_time: i64,
    pub to_open_time: i64,
    pub expected_bars: i64,
    pub loaded_bars: i64,
    pub status: BackfillStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Correction appliquée à une bougie déjà persistée
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub open_time: i64,
    pub candle: Candle,
    pub repaired_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 1_000,
            open,
            high,
            low,
            close,
            volume: 10.0,
            close_time: 1_059_999,
            trade_count: 5,
            is_closed: true,
        }
    }

    #[test]
    fn test_coherence_ohlc() {
        assert!(candle(100.0, 105.0, 95.0, 102.0).is_coherent());
        // high sous le low
        assert!(!candle(100.0, 90.0, 95.0, 102.0).is_coherent());
        // volume négatif
        let mut c = candle(100.0, 105.0, 95.0, 102.0);
        c.volume = -1.0;
        assert!(!c.is_coherent());
    }

    #[test]
    fn test_same_content_ignore_is_closed() {
        let a = candle(100.0, 105.0, 95.0, 102.0);
        let mut b = a.clone();
        b.is_closed = false;
        assert!(a.same_content(&b));
        b.close = 103.0;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_gap_states_round_trip() {
        for s in [
            GapState::Open,
            GapState::InProgress,
            GapState::Recovered,
            GapState::Merged,
        ] {
            assert_eq!(GapState::parse(s.as_str()), Some(s));
        }
        assert_eq!(GapState::parse("autre"), None);
    }
}
