/// Module du dépôt des segments de gaps
///
/// ARCHITECTURE:
/// CRUD transactionnel sur gap_segments avec fusion sur chevauchement.
/// Les segments open/in_progress d'un même couple ne se chevauchent jamais
/// entre eux: tout nouvel overlap est absorbé par une fusion qui marque les
/// anciens `merged` et crée un segment union unique.
use crate::database::DatabaseManager;
use crate::errors::{GapRepoError, StoreError};
use crate::models::{GapSegment, GapState};
use crate::store::PROVIDER;
use crate::utils::now_ms;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

/// Nombre de tentatives sur conflit de sérialisation SQLite
const MERGE_RETRY_MAX: u32 = 3;

/// Demande d'insertion d'un segment (avant attribution d'id)
#[derive(Debug, Clone)]
pub struct NewGapSegment {
    pub symbol: String,
    pub timeframe: String,
    pub from_open_time: i64,
    pub to_open_time: i64,
    pub detected_at: i64,
}

/// Résultat d'un merge_or_insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Aucun chevauchement: segment inséré tel quel
    Inserted(i64),
    /// Plage déjà suivie à l'identique: aucun effet
    AlreadyTracked(i64),
    /// Fusion: id du segment union et ids absorbés
    Merged { id: i64, absorbed: Vec<i64> },
}

impl MergeOutcome {
    pub fn id(&self) -> i64 {
        match self {
            MergeOutcome::Inserted(id) => *id,
            MergeOutcome::AlreadyTracked(id) => *id,
            MergeOutcome::Merged { id, .. } => *id,
        }
    }
}

/// Résultat d'une absorption de open_time par un segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsorbOutcome {
    /// ot == from: la borne basse avance d'un intervalle
    Advanced,
    /// ot == to: la borne haute recule d'un intervalle
    Retracted,
    /// ot intérieur: le segment est scindé en deux
    Split { right_id: i64 },
    /// Le segment ne contenait que ot: il passe en recovered
    Recovered,
    /// ot hors de la plage du segment: aucun effet
    NotCovered,
}

pub struct GapRepository {
    conn: Connection,
}

impl GapRepository {
    pub fn new(db_file: &str) -> Result<Self, GapRepoError> {
        let db = DatabaseManager::new(db_file)
            .map_err(|e| GapRepoError::Store(StoreError::Unavailable(e.to_string())))?;
        Ok(GapRepository {
            conn: db.into_connection(),
        })
    }

    /// Insère un segment, ou fusionne avec les segments chevauchants
    ///
    /// ALGORITHME:
    /// 1. Transaction immédiate (verrouille les lignes du couple)
    /// 2. Sélection des segments open/in_progress chevauchant [from, to]
    /// 3. Aucun → insertion; plage identique unique → no-op
    /// 4. Sinon: plage union, missing_bars recomptés par comptage exact des
    ///    bougies présentes (repli: somme des missing_bars absorbés plus les
    ///    barres de la nouvelle plage hors chevauchement)
    /// 5. Les anciens passent `merged` avec merged_into → segment union
    ///
    /// Idempotent sur répétition de plage exacte. Réessayé avec jitter sur
    /// conflit de sérialisation.
    pub fn merge_or_insert(
        &mut self,
        new: &NewGapSegment,
        interval_ms: i64,
    ) -> Result<MergeOutcome, GapRepoError> {
        let mut attempt = 0u32;
        loop {
            match self.merge_or_insert_once(new, interval_ms) {
                Err(GapRepoError::Store(StoreError::Unavailable(_))) if attempt < MERGE_RETRY_MAX => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..100);
                    std::thread::sleep(std::time::Duration::from_millis(
                        50 * attempt as u64 + jitter,
                    ));
                }
                other => return other,
            }
        }
    }

    fn merge_or_insert_once(
        &mut self,
        new: &NewGapSegment,
        interval_ms: i64,
    ) -> Result<MergeOutcome, GapRepoError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from_sqlite)?;

        let overlapping: Vec<GapSegment> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, symbol, timeframe, from_open_time, to_open_time, missing_bars,
                            state, detected_at, retry_count, last_attempt_at, last_error,
                            merged_into
                     FROM gap_segments
                     WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                           AND state IN ('open', 'in_progress')
                           AND from_open_time <= ?4 AND to_open_time >= ?5
                     ORDER BY from_open_time ASC",
                )
                .map_err(StoreError::from_sqlite)?;
            stmt.query_map(
                params![
                    PROVIDER,
                    new.symbol,
                    new.timeframe,
                    new.to_open_time,
                    new.from_open_time
                ],
                row_to_segment,
            )
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?
        };

        // Plage exacte déjà suivie: répétition idempotente
        if overlapping.len() == 1
            && overlapping[0].from_open_time == new.from_open_time
            && overlapping[0].to_open_time == new.to_open_time
        {
            let id = overlapping[0].id;
            tx.commit().map_err(StoreError::from_sqlite)?;
            return Ok(MergeOutcome::AlreadyTracked(id));
        }

        if overlapping.is_empty() {
            let missing = (new.to_open_time - new.from_open_time) / interval_ms + 1;
            tx.execute(
                "INSERT INTO gap_segments (
                    provider, symbol, timeframe, from_open_time, to_open_time,
                    missing_bars, state, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
                params![
                    PROVIDER,
                    new.symbol,
                    new.timeframe,
                    new.from_open_time,
                    new.to_open_time,
                    missing,
                    new.detected_at
                ],
            )
            .map_err(StoreError::from_sqlite)?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(StoreError::from_sqlite)?;
            return Ok(MergeOutcome::Inserted(id));
        }

        // Plage union et détection la plus ancienne
        let union_from = overlapping
            .iter()
            .map(|s| s.from_open_time)
            .min()
            .unwrap_or(new.from_open_time)
            .min(new.from_open_time);
        let union_to = overlapping
            .iter()
            .map(|s| s.to_open_time)
            .max()
            .unwrap_or(new.to_open_time)
            .max(new.to_open_time);
        let detected_at = overlapping
            .iter()
            .map(|s| s.detected_at)
            .min()
            .unwrap_or(new.detected_at)
            .min(new.detected_at);

        let expected = (union_to - union_from) / interval_ms + 1;
        // Chemin exact: comptage des bougies réellement présentes
        let missing = match tx.query_row(
            "SELECT COUNT(*) FROM candlesticks
             WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                   AND open_time >= ?4 AND open_time <= ?5",
            params![PROVIDER, new.symbol, new.timeframe, union_from, union_to],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(present) => (expected - present).max(0),
            // Repli approché: somme des restants absorbés + barres nouvelles
            // hors chevauchement
            Err(_) => {
                let absorbed_sum: i64 = overlapping.iter().map(|s| s.missing_bars).sum();
                let new_expected = (new.to_open_time - new.from_open_time) / interval_ms + 1;
                let covered: i64 = overlapping
                    .iter()
                    .map(|s| {
                        let lo = s.from_open_time.max(new.from_open_time);
                        let hi = s.to_open_time.min(new.to_open_time);
                        if hi >= lo { (hi - lo) / interval_ms + 1 } else { 0 }
                    })
                    .sum();
                absorbed_sum + (new_expected - covered).max(0)
            }
        };

        tx.execute(
            "INSERT INTO gap_segments (
                provider, symbol, timeframe, from_open_time, to_open_time,
                missing_bars, state, detected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
            params![
                PROVIDER,
                new.symbol,
                new.timeframe,
                union_from,
                union_to,
                missing,
                detected_at
            ],
        )
        .map_err(StoreError::from_sqlite)?;
        let union_id = tx.last_insert_rowid();

        let mut absorbed = Vec::with_capacity(overlapping.len());
        for seg in &overlapping {
            tx.execute(
                "UPDATE gap_segments SET state = 'merged', merged_into = ?2 WHERE id = ?1",
                params![seg.id, union_id],
            )
            .map_err(StoreError::from_sqlite)?;
            absorbed.push(seg.id);
        }

        tx.commit().map_err(StoreError::from_sqlite)?;
        Ok(MergeOutcome::Merged {
            id: union_id,
            absorbed,
        })
    }

    /// Segments open/in_progress, priorisés missing_bars DESC, detected_at ASC
    pub fn load_open(&self, limit: usize) -> Result<Vec<GapSegment>, GapRepoError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, symbol, timeframe, from_open_time, to_open_time, missing_bars,
                        state, detected_at, retry_count, last_attempt_at, last_error, merged_into
                 FROM gap_segments
                 WHERE provider = ?1 AND state IN ('open', 'in_progress')
                 ORDER BY missing_bars DESC, detected_at ASC
                 LIMIT ?2",
            )
            .map_err(StoreError::from_sqlite)?;
        let segments = stmt
            .query_map(params![PROVIDER, limit as i64], row_to_segment)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(segments)
    }

    /// Segments non-merged d'un couple pour l'endpoint de statut
    pub fn list_status(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<GapSegment>, GapRepoError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, symbol, timeframe, from_open_time, to_open_time, missing_bars,
                        state, detected_at, retry_count, last_attempt_at, last_error, merged_into
                 FROM gap_segments
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                       AND state IN ('open', 'in_progress', 'recovered')
                 ORDER BY detected_at DESC
                 LIMIT ?4",
            )
            .map_err(StoreError::from_sqlite)?;
        let segments = stmt
            .query_map(params![PROVIDER, symbol, timeframe, limit as i64], row_to_segment)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(segments)
    }

    /// Segment open/in_progress couvrant un open_time donné
    pub fn find_open_containing(
        &self,
        symbol: &str,
        timeframe: &str,
        open_time: i64,
    ) -> Result<Option<GapSegment>, GapRepoError> {
        let seg = self
            .conn
            .query_row(
                "SELECT id, symbol, timeframe, from_open_time, to_open_time, missing_bars,
                        state, detected_at, retry_count, last_attempt_at, last_error, merged_into
                 FROM gap_segments
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3
                       AND state IN ('open', 'in_progress')
                       AND from_open_time <= ?4 AND to_open_time >= ?4
                 LIMIT 1",
                params![PROVIDER, symbol, timeframe, open_time],
                row_to_segment,
            )
            .optional()
            .map_err(StoreError::from_sqlite)?;
        Ok(seg)
    }

    /// Recharge un segment par id
    pub fn get(&self, id: i64) -> Result<GapSegment, GapRepoError> {
        self.conn
            .query_row(
                "SELECT id, symbol, timeframe, from_open_time, to_open_time, missing_bars,
                        state, detected_at, retry_count, last_attempt_at, last_error, merged_into
                 FROM gap_segments WHERE id = ?1",
                params![id],
                row_to_segment,
            )
            .optional()
            .map_err(StoreError::from_sqlite)?
            .ok_or(GapRepoError::NotFound(id))
    }

    /// open → in_progress (précondition vérifiée par la clause WHERE)
    pub fn mark_in_progress(&self, id: i64) -> Result<(), GapRepoError> {
        let changes = self
            .conn
            .execute(
                "UPDATE gap_segments SET state = 'in_progress', last_attempt_at = ?2
                 WHERE id = ?1 AND state = 'open'",
                params![id, now_ms()],
            )
            .map_err(StoreError::from_sqlite)?;
        if changes == 0 {
            let seg = self.get(id)?;
            return Err(GapRepoError::InvalidTransition {
                id,
                detail: format!("état courant {}, attendu open", seg.state.as_str()),
            });
        }
        Ok(())
    }

    /// in_progress → recovered
    pub fn mark_recovered(&self, id: i64) -> Result<(), GapRepoError> {
        let changes = self
            .conn
            .execute(
                "UPDATE gap_segments SET state = 'recovered', missing_bars = 0
                 WHERE id = ?1 AND state = 'in_progress'",
                params![id],
            )
            .map_err(StoreError::from_sqlite)?;
        if changes == 0 {
            let seg = self.get(id)?;
            return Err(GapRepoError::InvalidTransition {
                id,
                detail: format!("état courant {}, attendu in_progress", seg.state.as_str()),
            });
        }
        Ok(())
    }

    /// Incrémente le compteur d'échecs d'un segment resté incomplet
    pub fn increment_retry(&self, id: i64, error: Option<&str>) -> Result<(), GapRepoError> {
        let changes = self
            .conn
            .execute(
                "UPDATE gap_segments
                 SET retry_count = retry_count + 1, last_error = ?2, last_attempt_at = ?3
                 WHERE id = ?1",
                params![id, error, now_ms()],
            )
            .map_err(StoreError::from_sqlite)?;
        if changes == 0 {
            return Err(GapRepoError::NotFound(id));
        }
        Ok(())
    }

    /// Retire un open_time de la plage d'un segment (arrivée tardive)
    ///
    /// ALGORITHME:
    /// - ot == from: avancer from d'un intervalle
    /// - ot == to: reculer to d'un intervalle
    /// - intérieur: scinder en deux segments
    /// - seul élément: le segment passe recovered
    pub fn absorb_open_time(
        &mut self,
        id: i64,
        open_time: i64,
        interval_ms: i64,
    ) -> Result<AbsorbOutcome, GapRepoError> {
        let seg = self.get(id)?;
        if seg.state != GapState::Open && seg.state != GapState::InProgress {
            return Err(GapRepoError::InvalidTransition {
                id,
                detail: format!("absorption refusée en état {}", seg.state.as_str()),
            });
        }
        if open_time < seg.from_open_time || open_time > seg.to_open_time {
            return Ok(AbsorbOutcome::NotCovered);
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from_sqlite)?;

        let outcome = if seg.from_open_time == seg.to_open_time {
            tx.execute(
                "UPDATE gap_segments SET state = 'recovered', missing_bars = 0 WHERE id = ?1",
                params![id],
            )
            .map_err(StoreError::from_sqlite)?;
            AbsorbOutcome::Recovered
        } else if open_time == seg.from_open_time {
            tx.execute(
                "UPDATE gap_segments
                 SET from_open_time = ?2, missing_bars = missing_bars - 1
                 WHERE id = ?1",
                params![id, seg.from_open_time + interval_ms],
            )
            .map_err(StoreError::from_sqlite)?;
            AbsorbOutcome::Advanced
        } else if open_time == seg.to_open_time {
            tx.execute(
                "UPDATE gap_segments
                 SET to_open_time = ?2, missing_bars = missing_bars - 1
                 WHERE id = ?1",
                params![id, seg.to_open_time - interval_ms],
            )
            .map_err(StoreError::from_sqlite)?;
            AbsorbOutcome::Retracted
        } else {
            // Scission: [from, ot - i] garde l'id, [ot + i, to] devient un
            // nouveau segment avec la même détection
            let left_to = open_time - interval_ms;
            let right_from = open_time + interval_ms;
            let left_missing = (left_to - seg.from_open_time) / interval_ms + 1;
            let right_missing = (seg.to_open_time - right_from) / interval_ms + 1;

            tx.execute(
                "UPDATE gap_segments SET to_open_time = ?2, missing_bars = ?3 WHERE id = ?1",
                params![id, left_to, left_missing],
            )
            .map_err(StoreError::from_sqlite)?;
            tx.execute(
                "INSERT INTO gap_segments (
                    provider, symbol, timeframe, from_open_time, to_open_time,
                    missing_bars, state, detected_at, retry_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    PROVIDER,
                    seg.symbol,
                    seg.timeframe,
                    right_from,
                    seg.to_open_time,
                    right_missing,
                    seg.state.as_str(),
                    seg.detected_at,
                    seg.retry_count
                ],
            )
            .map_err(StoreError::from_sqlite)?;
            AbsorbOutcome::Split {
                right_id: tx.last_insert_rowid(),
            }
        };

        tx.commit().map_err(StoreError::from_sqlite)?;
        Ok(outcome)
    }

    /// Nombre de segments open/in_progress (jauge de monitoring)
    pub fn count_open(&self) -> Result<i64, GapRepoError> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM gap_segments
                 WHERE provider = ?1 AND state IN ('open', 'in_progress')",
                params![PROVIDER],
                |row| row.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(count)
    }
}

fn row_to_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<GapSegment> {
    let state: String = row.get(6)?;
    Ok(GapSegment {
        id: row.get(0)?,
        symbol: row.get(1)?,
        timeframe: row.get(2)?,
        from_open_time: row.get(3)?,
        to_open_time: row.get(4)?,
        missing_bars: row.get(5)?,
        state: GapState::parse(&state).unwrap_or(GapState::Open),
        detected_at: row.get(7)?,
        retry_count: row.get(8)?,
        last_attempt_at: row.get(9)?,
        last_error: row.get(10)?,
        merged_into: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const I: i64 = 60_000;

    fn temp_db(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "continuity_gaps_{}_{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path.to_string_lossy().into_owned()
    }

    fn seg(from: i64, to: i64) -> NewGapSegment {
        NewGapSegment {
            symbol: "XRPUSDT".to_string(),
            timeframe: "1m".to_string(),
            from_open_time: from,
            to_open_time: to,
            detected_at: 1_000,
        }
    }

    #[test]
    fn test_insertion_simple_et_idempotence() {
        let db = temp_db("insert");
        let mut repo = GapRepository::new(&db).unwrap();

        let first = repo.merge_or_insert(&seg(0, 4 * I), I).unwrap();
        let id = match first {
            MergeOutcome::Inserted(id) => id,
            other => panic!("attendu Inserted, obtenu {:?}", other),
        };
        assert_eq!(repo.get(id).unwrap().missing_bars, 5);

        // Répétition de la même plage: aucun nouveau segment
        let second = repo.merge_or_insert(&seg(0, 4 * I), I).unwrap();
        assert_eq!(second, MergeOutcome::AlreadyTracked(id));
    }

    #[test]
    fn test_fusion_union_des_plages() {
        let db = temp_db("merge");
        let mut repo = GapRepository::new(&db).unwrap();

        repo.merge_or_insert(&seg(0, 2 * I), I).unwrap();
        repo.merge_or_insert(&seg(5 * I, 7 * I), I).unwrap();
        let out = repo.merge_or_insert(&seg(I, 6 * I), I).unwrap();

        let (id, absorbed) = match out {
            MergeOutcome::Merged { id, absorbed } => (id, absorbed),
            other => panic!("attendu Merged, obtenu {:?}", other),
        };
        assert_eq!(absorbed.len(), 2);

        let union = repo.get(id).unwrap();
        assert_eq!(union.from_open_time, 0);
        assert_eq!(union.to_open_time, 7 * I);
        assert_eq!(union.missing_bars, 8);
        assert_eq!(union.state, GapState::Open);

        for old in absorbed {
            let merged = repo.get(old).unwrap();
            assert_eq!(merged.state, GapState::Merged);
            assert_eq!(merged.merged_into, Some(id));
        }
    }

    #[test]
    fn test_fusion_associative_sur_permutations() {
        let ranges = [(0, 2 * I), (2 * I, 5 * I), (4 * I, 8 * I)];
        let mut finals: Vec<(i64, i64, i64)> = Vec::new();

        for perm in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let db = temp_db(&format!("assoc_{}{}{}", perm[0], perm[1], perm[2]));
            let mut repo = GapRepository::new(&db).unwrap();
            let mut last = 0;
            for idx in perm {
                let (f, t) = ranges[idx];
                last = repo.merge_or_insert(&seg(f, t), I).unwrap().id();
            }
            let result = repo.get(last).unwrap();
            finals.push((result.from_open_time, result.to_open_time, result.missing_bars));
        }

        // Quelle que soit la permutation, le segment final couvre [0, 8]
        for f in &finals {
            assert_eq!(*f, (0, 8 * I, 9));
        }
    }

    #[test]
    fn test_transitions_etats() {
        let db = temp_db("transitions");
        let mut repo = GapRepository::new(&db).unwrap();
        let id = repo.merge_or_insert(&seg(0, 2 * I), I).unwrap().id();

        // recovered sans in_progress: refusé
        assert!(repo.mark_recovered(id).is_err());

        repo.mark_in_progress(id).unwrap();
        // double in_progress: refusé
        assert!(repo.mark_in_progress(id).is_err());

        repo.mark_recovered(id).unwrap();
        assert_eq!(repo.get(id).unwrap().state, GapState::Recovered);
    }

    #[test]
    fn test_absorption_bornes_et_scission() {
        let db = temp_db("absorb");
        let mut repo = GapRepository::new(&db).unwrap();
        let id = repo.merge_or_insert(&seg(0, 4 * I), I).unwrap().id();

        assert_eq!(repo.absorb_open_time(id, 0, I).unwrap(), AbsorbOutcome::Advanced);
        assert_eq!(
            repo.absorb_open_time(id, 4 * I, I).unwrap(),
            AbsorbOutcome::Retracted
        );
        let seg_now = repo.get(id).unwrap();
        assert_eq!(seg_now.from_open_time, I);
        assert_eq!(seg_now.to_open_time, 3 * I);
        assert_eq!(seg_now.missing_bars, 3);

        // Absorption intérieure: scission [1,1] et [3,3]
        let out = repo.absorb_open_time(id, 2 * I, I).unwrap();
        let right_id = match out {
            AbsorbOutcome::Split { right_id } => right_id,
            other => panic!("attendu Split, obtenu {:?}", other),
        };
        let left = repo.get(id).unwrap();
        let right = repo.get(right_id).unwrap();
        assert_eq!((left.from_open_time, left.to_open_time, left.missing_bars), (I, I, 1));
        assert_eq!(
            (right.from_open_time, right.to_open_time, right.missing_bars),
            (3 * I, 3 * I, 1)
        );

        // Dernier élément absorbé: recovered
        assert_eq!(repo.absorb_open_time(id, I, I).unwrap(), AbsorbOutcome::Recovered);
        assert_eq!(repo.get(id).unwrap().state, GapState::Recovered);

        // Hors plage: no-op
        assert_eq!(
            repo.absorb_open_time(right_id, 10 * I, I).unwrap(),
            AbsorbOutcome::NotCovered
        );
    }

    #[test]
    fn test_priorite_chargement() {
        let db = temp_db("priority");
        let mut repo = GapRepository::new(&db).unwrap();

        repo.merge_or_insert(&seg(0, I), I).unwrap(); // 2 barres
        repo.merge_or_insert(&seg(10 * I, 20 * I), I).unwrap(); // 11 barres
        repo.merge_or_insert(&seg(30 * I, 33 * I), I).unwrap(); // 4 barres

        let open = repo.load_open(10).unwrap();
        assert_eq!(open.len(), 3);
        assert_eq!(open[0].missing_bars, 11);
        assert_eq!(open[1].missing_bars, 4);
        assert_eq!(open[2].missing_bars, 2);
    }
}
