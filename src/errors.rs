/// Module des erreurs typées du moteur
///
/// ARCHITECTURE:
/// Chaque couche expose son propre enum d'erreur. Les erreurs transitoires
/// sont réessayées localement et ne remontent jamais aux consommateurs tant
/// que les tentatives ne sont pas épuisées.
use thiserror::Error;

/// Erreurs du store canonique
#[derive(Debug, Error)]
pub enum StoreError {
    /// Base indisponible (verrou, I/O). Réessayable.
    #[error("base de données indisponible: {0}")]
    Unavailable(String),

    /// Collision de clé avec contenu divergent quand l'écrasement est
    /// interdit. Fatal pour l'appelant, qui doit classifier.
    #[error("violation d'intégrité: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Classifie une erreur rusqlite selon la taxonomie du store
    pub fn from_sqlite(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::ConstraintViolation => StoreError::Integrity(e.to_string()),
                _ => StoreError::Unavailable(e.to_string()),
            },
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Erreurs de l'adaptateur upstream (flux + REST)
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Réseau ou parsing ponctuel. Réessayé avec backoff exponentiel.
    #[error("erreur transitoire upstream: {0}")]
    Transient(String),

    /// Le fournisseur demande un ralentissement (429 ou budget épuisé)
    #[error("rate limit upstream, réessayer dans {retry_after_ms} ms")]
    RateLimited { retry_after_ms: i64 },

    /// Échecs de décodage répétés: le flux est mis en quarantaine
    #[error("adaptateur upstream en panne permanente: {0}")]
    Fatal(String),
}

/// Erreurs du dépôt de segments de gaps
#[derive(Debug, Error)]
pub enum GapRepoError {
    #[error("segment {0} introuvable")]
    NotFound(i64),

    /// Transition d'état refusée (ex: recovered sans passer par in_progress)
    #[error("transition invalide pour le segment {id}: {detail}")]
    InvalidTransition { id: i64, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Erreur d'un worker de backfill
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gaps(#[from] GapRepoError),

    /// Arrêt coopératif demandé entre deux pages
    #[error("backfill interrompu par le signal d'arrêt")]
    Cancelled,
}
