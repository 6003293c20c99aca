/// Module utilitaire pour les fonctions partagées
use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Formate un timestamp en millisecondes en format lisible
///
/// EXEMPLE:
/// 1700000000000 → "2023-11-14 22:13:20 UTC"
pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    if let Some(datetime_utc) = DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        datetime_utc.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        "Invalid timestamp".to_string()
    }
}

/// Récupère le timestamp actuel en millisecondes
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convertit un timeframe en intervalle en millisecondes
///
/// DESIGN: Fonction helper pour éviter la duplication de code
pub fn timeframe_to_interval(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 60_000,
        "3m" => 180_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "2h" => 7_200_000,
        "4h" => 14_400_000,
        "6h" => 21_600_000,
        "8h" => 28_800_000,
        "12h" => 43_200_000,
        "1d" => 86_400_000,
        "3d" => 259_200_000,
        "1w" => 604_800_000,
        "1M" => 2_592_000_000,
        _ => 300_000, // Par défaut: 5m
    }
}

/// Aligne un timestamp sur le début de sa bougie (multiple inférieur de l'intervalle)
pub fn align_open_time(timestamp_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return timestamp_ms;
    }
    (timestamp_ms / interval_ms) * interval_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_to_interval() {
        assert_eq!(timeframe_to_interval("1m"), 60_000);
        assert_eq!(timeframe_to_interval("1h"), 3_600_000);
        assert_eq!(timeframe_to_interval("inconnu"), 300_000);
    }

    #[test]
    fn test_align_open_time() {
        assert_eq!(
            align_open_time(1_700_000_123_456, 60_000),
            1_700_000_100_000
        );
        assert_eq!(
            align_open_time(1_700_000_100_000, 60_000),
            1_700_000_100_000
        );
    }
}
