/// Module du store canonique des bougies
///
/// ARCHITECTURE:
/// CanonicalStore est le seul écrivain des lignes de bougies et des runs de
/// backfill. L'upsert est idempotent sur la clé (provider, symbol,
/// timeframe, open_time): contenu identique → aucun effet, contenu divergent
/// → correction enregistrée dans candle_repairs et remontée à l'appelant qui
/// doit la diffuser en `repair`.
use crate::database::DatabaseManager;
use crate::errors::StoreError;
use crate::models::{BackfillRun, BackfillStatus, Candle, RepairRecord};
use crate::utils::now_ms;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

pub const PROVIDER: &str = "binance";

/// Résultat d'un upsert par lot
///
/// RETOUR: nombre d'insertions, de mises à jour (contenu divergent) et de
/// no-ops. Les bougies de `repairs` doivent être diffusées en `repair`;
/// `inserted_candles` liste les lignes nouvellement matérialisées (utile au
/// backfill pour diffuser les barres comblées).
#[derive(Debug, Default, Clone)]
pub struct UpsertReport {
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub repairs: Vec<Candle>,
    pub inserted_candles: Vec<Candle>,
}

/// Bornes et volumétrie d'une série stockée
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreMeta {
    pub earliest_open_time: Option<i64>,
    pub latest_open_time: Option<i64>,
    pub count: i64,
}

/// Store canonique adossé à SQLite
///
/// Chaque composant ouvre son propre CanonicalStore sur le même fichier;
/// la concurrence est arbitrée par WAL et busy_timeout.
pub struct CanonicalStore {
    conn: Connection,
}

impl CanonicalStore {
    pub fn new(db_file: &str) -> Result<Self, StoreError> {
        let db = DatabaseManager::new(db_file)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(CanonicalStore {
            conn: db.into_connection(),
        })
    }

    /// Upsert idempotent d'un lot de bougies finalisées
    ///
    /// ALGORITHME:
    /// 1. Transaction unique pour tout le lot
    /// 2. Pour chaque bougie: SELECT de la ligne existante par clé
    ///    - absente → INSERT
    ///    - contenu identique → no-op
    ///    - contenu divergent → UPDATE + ligne d'audit dans candle_repairs
    /// 3. Les bougies partielles ou incohérentes sont ignorées (jamais
    ///    persistées comme finales)
    pub fn upsert_candles(
        &mut self,
        symbol: &str,
        timeframe: &str,
        batch: &[Candle],
    ) -> Result<UpsertReport, StoreError> {
        let mut report = UpsertReport::default();
        let repaired_at = now_ms();

        let tx = self
            .conn
            .transaction()
            .map_err(StoreError::from_sqlite)?;
        {
            let mut select = tx
                .prepare(
                    "SELECT open, high, low, close, volume, close_time, trade_count
                     FROM candlesticks
                     WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3 AND open_time = ?4",
                )
                .map_err(StoreError::from_sqlite)?;

            let mut insert = tx
                .prepare(
                    "INSERT INTO candlesticks (
                        provider, symbol, timeframe, open_time, open, high, low, close,
                        volume, close_time, trade_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(StoreError::from_sqlite)?;

            let mut update = tx
                .prepare(
                    "UPDATE candlesticks
                     SET open = ?5, high = ?6, low = ?7, close = ?8, volume = ?9,
                         close_time = ?10, trade_count = ?11
                     WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3 AND open_time = ?4",
                )
                .map_err(StoreError::from_sqlite)?;

            let mut audit = tx
                .prepare(
                    "INSERT INTO candle_repairs (
                        provider, symbol, timeframe, open_time, open, high, low, close,
                        volume, close_time, trade_count, repaired_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )
                .map_err(StoreError::from_sqlite)?;

            for candle in batch {
                if !candle.is_closed || !candle.is_coherent() {
                    continue;
                }

                let existing = select
                    .query_row(
                        params![PROVIDER, symbol, timeframe, candle.open_time],
                        |row| {
                            Ok(Candle {
                                open_time: candle.open_time,
                                open: row.get(0)?,
                                high: row.get(1)?,
                                low: row.get(2)?,
                                close: row.get(3)?,
                                volume: row.get(4)?,
                                close_time: row.get(5)?,
                                trade_count: row.get(6)?,
                                is_closed: true,
                            })
                        },
                    )
                    .optional()
                    .map_err(StoreError::from_sqlite)?;

                match existing {
                    None => {
                        insert
                            .execute(params![
                                PROVIDER,
                                symbol,
                                timeframe,
                                candle.open_time,
                                candle.open,
                                candle.high,
                                candle.low,
                                candle.close,
                                candle.volume,
                                candle.close_time,
                                candle.trade_count,
                            ])
                            .map_err(StoreError::from_sqlite)?;
                        report.inserted += 1;
                        report.inserted_candles.push(candle.clone());
                    }
                    Some(row) if row.same_content(candle) => {
                        report.unchanged += 1;
                    }
                    Some(_) => {
                        update
                            .execute(params![
                                PROVIDER,
                                symbol,
                                timeframe,
                                candle.open_time,
                                candle.open,
                                candle.high,
                                candle.low,
                                candle.close,
                                candle.volume,
                                candle.close_time,
                                candle.trade_count,
                            ])
                            .map_err(StoreError::from_sqlite)?;
                        audit
                            .execute(params![
                                PROVIDER,
                                symbol,
                                timeframe,
                                candle.open_time,
                                candle.open,
                                candle.high,
                                candle.low,
                                candle.close,
                                candle.volume,
                                candle.close_time,
                                candle.trade_count,
                                repaired_at,
                            ])
                            .map_err(StoreError::from_sqlite)?;
                        report.updated += 1;
                        report.repairs.push(candle.clone());
                    }
                }
            }
        }
        tx.commit().map_err(StoreError::from_sqlite)?;

        Ok(report)
    }

    /// Bougies dans [from, to] inclus, ordre ascendant
    pub fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT open_time, open, high, low, close, volume, close_time, trade_count
                 FROM candlesticks
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                       AND open_time >= ?4 AND open_time <= ?5
                 ORDER BY open_time ASC
                 LIMIT ?6",
            )
            .map_err(StoreError::from_sqlite)?;

        let candles = stmt
            .query_map(
                params![PROVIDER, symbol, timeframe, from, to, limit as i64],
                Self::row_to_candle,
            )
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;

        Ok(candles)
    }

    /// Bougies strictement après `after`, ordre ascendant (lecture delta)
    pub fn get_range_after(
        &self,
        symbol: &str,
        timeframe: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT open_time, open, high, low, close, volume, close_time, trade_count
                 FROM candlesticks
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3 AND open_time > ?4
                 ORDER BY open_time ASC
                 LIMIT ?5",
            )
            .map_err(StoreError::from_sqlite)?;

        let candles = stmt
            .query_map(
                params![PROVIDER, symbol, timeframe, after, limit as i64],
                Self::row_to_candle,
            )
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;

        Ok(candles)
    }

    /// Les `limit` dernières bougies, rendues en ordre ascendant
    /// (queue finalisée pour les snapshots)
    pub fn get_tail(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT open_time, open, high, low, close, volume, close_time, trade_count
                 FROM candlesticks
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                 ORDER BY open_time DESC
                 LIMIT ?4",
            )
            .map_err(StoreError::from_sqlite)?;

        let mut candles = stmt
            .query_map(
                params![PROVIDER, symbol, timeframe, limit as i64],
                Self::row_to_candle,
            )
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;

        candles.reverse();
        Ok(candles)
    }

    /// Page de curseur pour /ohlcv/history
    ///
    /// `before` et `after` sont mutuellement exclusifs (validé par l'API).
    pub fn get_page(
        &self,
        symbol: &str,
        timeframe: &str,
        before: Option<i64>,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        match (before, after) {
            (Some(b), None) => {
                let mut stmt = self
                    .conn
                    .prepare(
                        "SELECT open_time, open, high, low, close, volume, close_time, trade_count
                         FROM candlesticks
                         WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                               AND open_time < ?4
                         ORDER BY open_time DESC
                         LIMIT ?5",
                    )
                    .map_err(StoreError::from_sqlite)?;
                let mut candles = stmt
                    .query_map(
                        params![PROVIDER, symbol, timeframe, b, limit as i64],
                        Self::row_to_candle,
                    )
                    .map_err(StoreError::from_sqlite)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from_sqlite)?;
                candles.reverse();
                Ok(candles)
            }
            (None, Some(a)) => self.get_range_after(symbol, timeframe, a, limit),
            _ => self.get_tail(symbol, timeframe, limit),
        }
    }

    /// Plus grand open_time finalisé, ou None si la série est vide
    pub fn get_last_closed(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Option<i64>, StoreError> {
        self.conn
            .query_row(
                "SELECT MAX(open_time) FROM candlesticks
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3",
                params![PROVIDER, symbol, timeframe],
                |row| row.get(0),
            )
            .map_err(StoreError::from_sqlite)
    }

    /// Compte exact dans [from, to] inclus (calculs de complétude)
    pub fn count_range(
        &self,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
    ) -> Result<i64, StoreError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM candlesticks
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                       AND open_time >= ?4 AND open_time <= ?5",
                params![PROVIDER, symbol, timeframe, from, to],
                |row| row.get(0),
            )
            .map_err(StoreError::from_sqlite)
    }

    /// Bornes et volumétrie de la série
    pub fn get_meta(&self, symbol: &str, timeframe: &str) -> Result<StoreMeta, StoreError> {
        self.conn
            .query_row(
                "SELECT MIN(open_time), MAX(open_time), COUNT(*) FROM candlesticks
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3",
                params![PROVIDER, symbol, timeframe],
                |row| {
                    Ok(StoreMeta {
                        earliest_open_time: row.get(0)?,
                        latest_open_time: row.get(1)?,
                        count: row.get(2)?,
                    })
                },
            )
            .map_err(StoreError::from_sqlite)
    }

    /// Corrections dont l'open_time est strictement après `min_open_time`
    pub fn load_repairs_since(
        &self,
        symbol: &str,
        timeframe: &str,
        min_open_time: i64,
        limit: usize,
    ) -> Result<Vec<RepairRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT open_time, open, high, low, close, volume, close_time, trade_count,
                        repaired_at
                 FROM candle_repairs
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3 AND open_time > ?4
                 ORDER BY repaired_at ASC
                 LIMIT ?5",
            )
            .map_err(StoreError::from_sqlite)?;

        let repairs = stmt
            .query_map(
                params![PROVIDER, symbol, timeframe, min_open_time, limit as i64],
                |row| {
                    Ok(RepairRecord {
                        open_time: row.get(0)?,
                        candle: Candle {
                            open_time: row.get(0)?,
                            open: row.get(1)?,
                            high: row.get(2)?,
                            low: row.get(3)?,
                            close: row.get(4)?,
                            volume: row.get(5)?,
                            close_time: row.get(6)?,
                            trade_count: row.get(7)?,
                            is_closed: true,
                        },
                        repaired_at: row.get(8)?,
                    })
                },
            )
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;

        Ok(repairs)
    }

    // ------------------------------------------------------------------
    // Verrous consultatifs nommés
    // ------------------------------------------------------------------

    /// Tente de prendre le verrou nommé `key` pour `owner` avec un bail
    ///
    /// ALGORITHME:
    /// 1. Purge du bail expiré
    /// 2. INSERT, ou ré-armement du bail si on est déjà propriétaire
    /// 3. Lecture du propriétaire effectif
    ///
    /// RETOUR: true si `owner` détient le verrou à la sortie
    pub fn try_acquire_lock(
        &mut self,
        key: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from_sqlite)?;

        tx.execute(
            "DELETE FROM advisory_locks WHERE lock_key = ?1 AND expires_at < ?2",
            params![key, now],
        )
        .map_err(StoreError::from_sqlite)?;

        tx.execute(
            "INSERT INTO advisory_locks (lock_key, owner, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(lock_key) DO UPDATE SET expires_at = excluded.expires_at
             WHERE advisory_locks.owner = excluded.owner",
            params![key, owner, now + ttl_ms],
        )
        .map_err(StoreError::from_sqlite)?;

        let holder: String = tx
            .query_row(
                "SELECT owner FROM advisory_locks WHERE lock_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(StoreError::from_sqlite)?;

        tx.commit().map_err(StoreError::from_sqlite)?;
        Ok(holder == owner)
    }

    /// Ré-arme le bail du verrou si on en est toujours propriétaire
    pub fn renew_lock(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        let changes = self
            .conn
            .execute(
                "UPDATE advisory_locks SET expires_at = ?3
                 WHERE lock_key = ?1 AND owner = ?2",
                params![key, owner, now_ms() + ttl_ms],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(changes > 0)
    }

    /// Libère le verrou si on en est propriétaire
    pub fn release_lock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM advisory_locks WHERE lock_key = ?1 AND owner = ?2",
                params![key, owner],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit des runs de backfill
    // ------------------------------------------------------------------

    /// Crée une ligne d'audit en `pending`
    pub fn create_backfill_run(
        &self,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
        expected_bars: i64,
    ) -> Result<i64, StoreError> {
        self.conn
            .execute(
                "INSERT INTO backfill_runs (
                    provider, symbol, timeframe, from_open_time, to_open_time,
                    expected_bars, status, started_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![PROVIDER, symbol, timeframe, from, to, expected_bars, now_ms()],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Passe un run en `running` et incrémente attempts
    pub fn mark_run_running(&self, run_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE backfill_runs
                 SET status = 'running', attempts = attempts + 1
                 WHERE id = ?1",
                params![run_id],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    /// Met à jour la progression d'un run en cours
    pub fn update_run_progress(&self, run_id: i64, loaded_bars: i64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE backfill_runs SET loaded_bars = ?2 WHERE id = ?1",
                params![run_id, loaded_bars],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    /// Clôt un run avec son statut final
    pub fn finish_run(
        &self,
        run_id: i64,
        status: BackfillStatus,
        loaded_bars: i64,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE backfill_runs
                 SET status = ?2, loaded_bars = ?3, last_error = ?4, finished_at = ?5
                 WHERE id = ?1",
                params![run_id, status.as_str(), loaded_bars, last_error, now_ms()],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    /// Dernier run (le plus récent) pour un couple
    pub fn latest_run(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Option<BackfillRun>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, symbol, timeframe, from_open_time, to_open_time, expected_bars,
                        loaded_bars, status, attempts, last_error, started_at, finished_at
                 FROM backfill_runs
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                 ORDER BY started_at DESC, id DESC
                 LIMIT 1",
                params![PROVIDER, symbol, timeframe],
                |row| {
                    let status: String = row.get(7)?;
                    Ok(BackfillRun {
                        id: row.get(0)?,
                        symbol: row.get(1)?,
                        timeframe: row.get(2)?,
                        from_open_time: row.get(3)?,
                        to_open_time: row.get(4)?,
                        expected_bars: row.get(5)?,
                        loaded_bars: row.get(6)?,
                        status: BackfillStatus::parse(&status).unwrap_or(BackfillStatus::Error),
                        attempts: row.get(8)?,
                        last_error: row.get(9)?,
                        started_at: row.get(10)?,
                        finished_at: row.get(11)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from_sqlite)
    }

    fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
        Ok(Candle {
            open_time: row.get(0)?,
            open: row.get(1)?,
            high: row.get(2)?,
            low: row.get(3)?,
            close: row.get(4)?,
            volume: row.get(5)?,
            close_time: row.get(6)?,
            trade_count: row.get(7)?,
            is_closed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "continuity_store_{}_{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path.to_string_lossy().into_owned()
    }

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 100.0,
            close_time: open_time + 59_999,
            trade_count: 10,
            is_closed: true,
        }
    }

    #[test]
    fn test_upsert_idempotent() {
        let db = temp_db("idempotent");
        let mut store = CanonicalStore::new(&db).unwrap();
        let batch: Vec<Candle> = (0..5).map(|i| candle(1_000 + i * 60_000, 100.0)).collect();

        let first = store.upsert_candles("XRPUSDT", "1m", &batch).unwrap();
        assert_eq!(first.inserted, 5);
        assert_eq!(first.updated, 0);

        let second = store.upsert_candles("XRPUSDT", "1m", &batch).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 5);
        assert!(second.repairs.is_empty());
    }

    #[test]
    fn test_round_trip_sans_changement() {
        let db = temp_db("roundtrip");
        let mut store = CanonicalStore::new(&db).unwrap();
        let batch: Vec<Candle> = (0..10).map(|i| candle(i * 60_000, 50.0 + i as f64)).collect();
        store.upsert_candles("XRPUSDT", "1m", &batch).unwrap();

        let relu = store.get_range("XRPUSDT", "1m", 0, i64::MAX, 100).unwrap();
        assert_eq!(relu.len(), 10);

        let report = store.upsert_candles("XRPUSDT", "1m", &relu).unwrap();
        assert_eq!(report.inserted + report.updated, 0);
        assert_eq!(report.unchanged, 10);
    }

    #[test]
    fn test_divergence_enregistre_reparation() {
        let db = temp_db("repair");
        let mut store = CanonicalStore::new(&db).unwrap();
        store
            .upsert_candles("XRPUSDT", "1m", &[candle(60_000, 100.0)])
            .unwrap();

        let corrected = candle(60_000, 101.5);
        let report = store
            .upsert_candles("XRPUSDT", "1m", &[corrected.clone()])
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.repairs.len(), 1);

        let repairs = store.load_repairs_since("XRPUSDT", "1m", 0, 10).unwrap();
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].open_time, 60_000);
        assert_eq!(repairs[0].candle.close, 101.5);
    }

    #[test]
    fn test_partielle_jamais_persistee() {
        let db = temp_db("partial");
        let mut store = CanonicalStore::new(&db).unwrap();
        let mut partial = candle(60_000, 100.0);
        partial.is_closed = false;

        let report = store.upsert_candles("XRPUSDT", "1m", &[partial]).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(store.count_range("XRPUSDT", "1m", 0, i64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_last_closed_et_count() {
        let db = temp_db("lastclosed");
        let mut store = CanonicalStore::new(&db).unwrap();
        assert_eq!(store.get_last_closed("XRPUSDT", "1m").unwrap(), None);

        let batch: Vec<Candle> = (1..=3).map(|i| candle(i * 60_000, 100.0)).collect();
        store.upsert_candles("XRPUSDT", "1m", &batch).unwrap();

        assert_eq!(store.get_last_closed("XRPUSDT", "1m").unwrap(), Some(180_000));
        assert_eq!(
            store.count_range("XRPUSDT", "1m", 60_000, 180_000).unwrap(),
            3
        );
    }

    #[test]
    fn test_verrou_au_plus_un_detenteur() {
        let db = temp_db("lock");
        let mut a = CanonicalStore::new(&db).unwrap();
        let mut b = CanonicalStore::new(&db).unwrap();

        let got_a = a.try_acquire_lock("gap_orchestrator", "proc-a", 60_000).unwrap();
        let got_b = b.try_acquire_lock("gap_orchestrator", "proc-b", 60_000).unwrap();
        assert!(got_a);
        assert!(!got_b);

        // Ré-armement par le propriétaire seulement
        assert!(a.renew_lock("gap_orchestrator", "proc-a", 60_000).unwrap());
        assert!(!b.renew_lock("gap_orchestrator", "proc-b", 60_000).unwrap());

        // Après libération, l'autre processus peut prendre le verrou
        a.release_lock("gap_orchestrator", "proc-a").unwrap();
        assert!(b.try_acquire_lock("gap_orchestrator", "proc-b", 60_000).unwrap());
    }

    #[test]
    fn test_audit_backfill_run() {
        let db = temp_db("runs");
        let store = CanonicalStore::new(&db).unwrap();
        let id = store
            .create_backfill_run("XRPUSDT", "1m", 0, 600_000, 11)
            .unwrap();
        store.mark_run_running(id).unwrap();
        store.finish_run(id, BackfillStatus::Success, 11, None).unwrap();

        let run = store.latest_run("XRPUSDT", "1m").unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.status, BackfillStatus::Success);
        assert_eq!(run.loaded_bars, 11);
        assert_eq!(run.attempts, 1);
        assert!(run.finished_at.is_some());
    }
}
