/// Module de gestion de la base de données SQLite
///
/// Ce module fournit une structure DatabaseManager pour encapsuler
/// toutes les opérations liées à la base de données
use anyhow::Result;
use rusqlite::{Connection, Result as SqlResult};
use std::path::Path;

/// Gestionnaire de la base de données SQLite
///
/// ARCHITECTURE:
/// Cette structure encapsule la connexion SQLite et fournit des méthodes
/// pour initialiser le schéma et gérer la connexion. Chaque tâche ouvre sa
/// propre connexion sur le même fichier; le mode WAL et le busy_timeout
/// permettent les écrivains concurrents.
pub struct DatabaseManager {
    conn: Connection,
}

impl DatabaseManager {
    /// Crée et initialise une nouvelle connexion à la base de données
    ///
    /// ALGORITHME:
    /// 1. Ouvre la connexion SQLite
    /// 2. Active WAL et le busy_timeout
    /// 3. Crée les tables si elles n'existent pas
    pub fn new(db_file: &str) -> Result<Self> {
        let path = Path::new(db_file);
        let conn = Connection::open(path)?;

        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;

        Ok(DatabaseManager { conn })
    }

    /// Pragmas de concurrence (plusieurs connexions sur le même fichier)
    fn apply_pragmas(conn: &Connection) -> SqlResult<()> {
        // WAL: lecteurs non bloqués par l'écrivain courant
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        // Deadline d'un statement isolé
        conn.execute_batch("PRAGMA busy_timeout=2000;")?;
        Ok(())
    }

    /// Initialise le schéma de la base de données
    ///
    /// DESIGN: Méthode privée, appelée uniquement depuis new()
    fn init_schema(conn: &Connection) -> SqlResult<()> {
        // Table principale des bougies finalisées
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candlesticks (
                provider TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                close_time INTEGER NOT NULL,
                trade_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(provider, symbol, timeframe, open_time)
            )",
            [],
        )?;

        // Segments de gaps (plages contiguës de bougies manquantes)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS gap_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                from_open_time INTEGER NOT NULL,
                to_open_time INTEGER NOT NULL,
                missing_bars INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'open',
                detected_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT,
                merged_into INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_gap_segments_key
             ON gap_segments (symbol, timeframe, detected_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_gap_segments_state
             ON gap_segments (state)",
            [],
        )?;

        // Audit des runs de backfill (jamais supprimés)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS backfill_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                from_open_time INTEGER NOT NULL,
                to_open_time INTEGER NOT NULL,
                expected_bars INTEGER NOT NULL,
                loaded_bars INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_backfill_runs_key
             ON backfill_runs (symbol, timeframe, started_at DESC)",
            [],
        )?;

        // Corrections appliquées à des bougies déjà persistées
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candle_repairs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                close_time INTEGER NOT NULL,
                trade_count INTEGER NOT NULL DEFAULT 0,
                repaired_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candle_repairs_key
             ON candle_repairs (symbol, timeframe, open_time)",
            [],
        )?;

        // Verrous consultatifs nommés (leadership de l'orchestrateur)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS advisory_locks (
                lock_key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Retourne une référence à la connexion SQLite
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Retourne une référence mutable à la connexion SQLite
    /// (nécessaire pour les transactions)
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Consomme le manager et rend la connexion
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}
