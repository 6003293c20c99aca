/// Module de configuration du moteur
///
/// DESIGN:
/// Une seule valeur immuable construite au démarrage (variables
/// d'environnement puis surcharges CLI). Pas de rechargement à chaud: les
/// composants reçoivent la config par valeur ou via Arc.
use crate::utils::timeframe_to_interval;

/// Configuration complète du moteur de continuité
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Couple actif du flux temps réel
    pub symbol: String,
    pub timeframe: String,
    /// Pas de la série en millisecondes (dérivé du timeframe)
    pub interval_ms: i64,

    /// Fichier SQLite canonique
    pub db_file: String,

    /// Serveur HTTP
    pub bind_addr: String,
    pub http_port: u16,

    /// Workers de backfill
    pub backfill_concurrency: usize,
    pub backfill_page_size: usize,
    pub backfill_max_pages: usize,
    pub backfill_retry_max: u32,
    pub backfill_retry_backoff_ms: i64,

    /// Orchestrateur de gaps
    pub orchestrator_poll_interval_ms: u64,

    /// Scanner de continuité
    pub scanner_horizon_days: i64,
    pub scanner_schedule_ms: u64,

    /// Hub de diffusion
    pub push_heartbeat_ms: u64,
    pub push_subscriber_queue_size: usize,
    pub push_partial_coalesce: bool,

    /// API delta
    pub delta_limit_max: usize,
    /// Plafond du endpoint /ohlcv/recent
    pub recent_limit_max: usize,

    /// Clé du verrou consultatif de leadership de l'orchestrateur
    pub store_lock_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            symbol: "XRPUSDT".to_string(),
            timeframe: "1m".to_string(),
            interval_ms: 60_000,
            db_file: "candlesticks.db".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            http_port: 8080,
            backfill_concurrency: 2,
            backfill_page_size: 1000,
            backfill_max_pages: 400,
            backfill_retry_max: 3,
            backfill_retry_backoff_ms: 2_000,
            orchestrator_poll_interval_ms: 5_000,
            scanner_horizon_days: 30,
            scanner_schedule_ms: 3_600_000,
            push_heartbeat_ms: 15_000,
            push_subscriber_queue_size: 64,
            push_partial_coalesce: true,
            delta_limit_max: 1_000,
            recent_limit_max: 2_000,
            store_lock_key: "gap_orchestrator".to_string(),
        }
    }
}

impl EngineConfig {
    /// Construit la config depuis l'environnement
    ///
    /// Chaque clé a une valeur par défaut raisonnable; les variables absentes
    /// ou mal formées retombent sur le défaut.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();

        if let Ok(v) = std::env::var("SYMBOL") {
            cfg.symbol = v.to_uppercase();
        }
        if let Ok(v) = std::env::var("TIMEFRAME") {
            cfg.timeframe = v;
        }
        cfg.interval_ms = timeframe_to_interval(&cfg.timeframe);

        if let Ok(v) = std::env::var("DB_FILE") {
            cfg.db_file = v;
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            cfg.bind_addr = v;
        }
        set_parsed(&mut cfg.http_port, "PORT");

        set_parsed(&mut cfg.backfill_concurrency, "BACKFILL_CONCURRENCY");
        set_parsed(&mut cfg.backfill_page_size, "BACKFILL_PAGE_SIZE");
        set_parsed(&mut cfg.backfill_max_pages, "BACKFILL_MAX_PAGES");
        set_parsed(&mut cfg.backfill_retry_max, "BACKFILL_RETRY_MAX");
        set_parsed(&mut cfg.backfill_retry_backoff_ms, "BACKFILL_RETRY_BACKOFF_MS");

        set_parsed(
            &mut cfg.orchestrator_poll_interval_ms,
            "ORCHESTRATOR_POLL_INTERVAL_MS",
        );

        set_parsed(&mut cfg.scanner_horizon_days, "SCANNER_HORIZON_DAYS");
        set_parsed(&mut cfg.scanner_schedule_ms, "SCANNER_SCHEDULE_MS");

        set_parsed(&mut cfg.push_heartbeat_ms, "PUSH_HEARTBEAT_MS");
        set_parsed(
            &mut cfg.push_subscriber_queue_size,
            "PUSH_SUBSCRIBER_QUEUE_SIZE",
        );
        if let Ok(v) = std::env::var("PUSH_PARTIAL_COALESCE") {
            cfg.push_partial_coalesce = v != "0" && v.to_lowercase() != "false";
        }

        set_parsed(&mut cfg.delta_limit_max, "DELTA_LIMIT_MAX");
        set_parsed(&mut cfg.recent_limit_max, "RECENT_LIMIT_MAX");

        if let Ok(v) = std::env::var("STORE_LOCK_KEY") {
            cfg.store_lock_key = v;
        }

        cfg
    }

    /// Fixe le couple actif et recalcule le pas
    pub fn with_stream_key(mut self, symbol: &str, timeframe: &str) -> Self {
        self.symbol = symbol.to_uppercase();
        self.timeframe = timeframe.to_string();
        self.interval_ms = timeframe_to_interval(timeframe);
        self
    }
}

/// Parse une variable d'environnement vers un champ si elle est valide
fn set_parsed<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(parsed) = raw.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_coherents() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.interval_ms, timeframe_to_interval(&cfg.timeframe));
        assert!(cfg.backfill_concurrency >= 1);
        assert!(cfg.push_subscriber_queue_size >= 8);
    }

    #[test]
    fn test_with_stream_key() {
        let cfg = EngineConfig::default().with_stream_key("btcusdt", "5m");
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval_ms, 300_000);
    }
}
