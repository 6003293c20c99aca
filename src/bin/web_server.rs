/// Serveur du moteur de continuité OHLCV
///
/// ARCHITECTURE:
/// Racine de composition: le serveur assemble le consommateur de flux,
/// l'orchestrateur de gaps, le scanner périodique et le hub de diffusion,
/// puis expose la surface de lecture:
///   - GET /ohlcv/recent, /ohlcv/meta, /ohlcv/history, /ohlcv/delta
///   - GET /ohlcv/gaps/status
///   - POST /ohlcv/backfill/year, GET /ohlcv/backfill/year/status
///   - WS /ws/ohlcv et SSE /stream/signals (enveloppe seq/epoch)
///   - GET /health, GET /metrics
use actix::{Actor, ActorContext, AsyncContext, Handler, Message, StreamHandler};
use actix_cors::Cors;
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, post, web};
use actix_web_actors::ws;
use futures_util::StreamExt;
use moka::future::Cache;
use rust_candles_continuity::backfill::{BackfillOptions, run_horizon_backfill};
use rust_candles_continuity::config::EngineConfig;
use rust_candles_continuity::consumer::StreamConsumer;
use rust_candles_continuity::database::DatabaseManager;
use rust_candles_continuity::delta::compute_delta;
use rust_candles_continuity::events::{EpochSequencer, PushPayload};
use rust_candles_continuity::gap_repository::GapRepository;
use rust_candles_continuity::hub::{
    EnqueueOutcome, PushHub, SubscriberQueue, record_enqueue_outcome,
};
use rust_candles_continuity::metrics::Metrics;
use rust_candles_continuity::models::{BackfillStatus, Candle};
use rust_candles_continuity::orchestrator::GapOrchestrator;
use rust_candles_continuity::scanner;
use rust_candles_continuity::store::CanonicalStore;
use rust_candles_continuity::upstream::{self, HistorySource, UpstreamAdapter};
use rust_candles_continuity::utils::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Cadence des pings de transport et timeout client (protocole WS)
const WS_PING_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(20);

/// Taille de la queue finalisée envoyée dans les snapshots
const SNAPSHOT_TAIL: usize = 200;

/// Clé de cache pour les requêtes de bougies récentes
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    symbol: String,
    timeframe: String,
    limit: usize,
}

/// Cache mémoire des dernières partielles, alimenté par le hub
type PartialCache = Arc<RwLock<HashMap<(String, String), Candle>>>;

/// État partagé de l'application
struct AppState {
    config: Arc<EngineConfig>,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
    adapter: Arc<UpstreamAdapter>,
    partials: PartialCache,
    candles_cache: Cache<CacheKey, Arc<Vec<Candle>>>,
    request_counter: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl AppState {
    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}-{}", now_ms(), n)
    }
}

/// Enveloppe d'erreur uniforme `{error, code, request_id}`
fn error_json(
    status: actix_web::http::StatusCode,
    code: &str,
    message: &str,
    request_id: &str,
) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({
        "error": message,
        "code": code,
        "request_id": request_id,
    }))
}

/// Timeframes acceptés par la surface HTTP
const KNOWN_TIMEFRAMES: [&str; 15] = [
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// Valide le couple (symbol, interval) d'une requête
///
/// RETOUR: intervalle en ms, ou une réponse d'erreur prête à renvoyer
fn validate_key(
    symbol: &str,
    timeframe: &str,
    request_id: &str,
) -> Result<i64, HttpResponse> {
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(error_json(
            actix_web::http::StatusCode::BAD_REQUEST,
            "invalid_symbol",
            "symbol invalide",
            request_id,
        ));
    }
    if !KNOWN_TIMEFRAMES.contains(&timeframe) {
        return Err(error_json(
            actix_web::http::StatusCode::NOT_FOUND,
            "unknown_interval",
            "interval inconnu",
            request_id,
        ));
    }
    Ok(rust_candles_continuity::utils::timeframe_to_interval(
        timeframe,
    ))
}

// ============================================================================
// ENDPOINTS REST
// ============================================================================

#[derive(Debug, Deserialize)]
struct RecentQuery {
    symbol: String,
    interval: String,
    limit: Option<usize>,
    include_open: Option<bool>,
}

#[derive(Debug, Serialize)]
struct RecentResponse {
    candles: Vec<Candle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partial: Option<Candle>,
}

/// GET /ohlcv/recent - Queue finalisée, partielle en option
#[get("/ohlcv/recent")]
async fn get_recent(data: web::Data<AppState>, query: web::Query<RecentQuery>) -> impl Responder {
    let request_id = data.next_request_id();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return resp;
    }
    let limit = query.limit.unwrap_or(500).min(data.config.recent_limit_max);
    let include_open = query.include_open.unwrap_or(false);

    let cache_key = CacheKey {
        symbol: symbol.clone(),
        timeframe: timeframe.clone(),
        limit,
    };

    let candles = if let Some(hit) = data.candles_cache.get(&cache_key).await {
        hit
    } else {
        let db_file = data.config.db_file.clone();
        let symbol_cl = symbol.clone();
        let timeframe_cl = timeframe.clone();
        let result = web::block(move || {
            let store = CanonicalStore::new(&db_file)?;
            store.get_tail(&symbol_cl, &timeframe_cl, limit)
        })
        .await;

        match result {
            Ok(Ok(candles)) => {
                let arc = Arc::new(candles);
                data.candles_cache.insert(cache_key, arc.clone()).await;
                arc
            }
            Ok(Err(e)) => {
                return error_json(
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    &e.to_string(),
                    &request_id,
                );
            }
            Err(e) => {
                return error_json(
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "blocking_error",
                    &e.to_string(),
                    &request_id,
                );
            }
        }
    };

    let partial = if include_open {
        data.partials
            .read()
            .ok()
            .and_then(|m| m.get(&(symbol.clone(), timeframe.clone())).cloned())
    } else {
        None
    };

    HttpResponse::Ok().json(RecentResponse {
        candles: candles.as_ref().clone(),
        partial,
    })
}

#[derive(Debug, Deserialize)]
struct MetaQuery {
    symbol: String,
    interval: String,
    sample_for_gap: Option<bool>,
}

/// GET /ohlcv/meta - Bornes, volumétrie et complétude d'une série
#[get("/ohlcv/meta")]
async fn get_meta(data: web::Data<AppState>, query: web::Query<MetaQuery>) -> impl Responder {
    let request_id = data.next_request_id();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    let interval_ms = match validate_key(&symbol, &timeframe, &request_id) {
        Ok(i) => i,
        Err(resp) => return resp,
    };
    let sample_for_gap = query.sample_for_gap.unwrap_or(false);

    let db_file = data.config.db_file.clone();
    let result = web::block(move || {
        let store = CanonicalStore::new(&db_file)?;
        let meta = store.get_meta(&symbol, &timeframe)?;

        let mut completeness_ratio = None;
        let mut largest_gap_bars = None;
        if sample_for_gap {
            if let (Some(earliest), Some(latest)) =
                (meta.earliest_open_time, meta.latest_open_time)
            {
                let expected = (latest - earliest) / interval_ms + 1;
                if expected > 0 {
                    completeness_ratio = Some(meta.count as f64 / expected as f64);
                }
            }
            let gaps = GapRepository::new(&db_file)
                .map_err(|e| rust_candles_continuity::errors::StoreError::Unavailable(e.to_string()))?;
            if let Ok(segments) = gaps.list_status(&symbol, &timeframe, 500) {
                largest_gap_bars = segments
                    .iter()
                    .filter(|s| {
                        s.state != rust_candles_continuity::models::GapState::Recovered
                    })
                    .map(|s| s.missing_bars)
                    .max();
            }
        }

        Ok::<_, rust_candles_continuity::errors::StoreError>(serde_json::json!({
            "earliest_open_time": meta.earliest_open_time,
            "latest_open_time": meta.latest_open_time,
            "count": meta.count,
            "completeness_ratio": completeness_ratio,
            "largest_gap_bars": largest_gap_bars,
        }))
    })
    .await;

    match result {
        Ok(Ok(body)) => HttpResponse::Ok().json(body),
        Ok(Err(e)) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
            &request_id,
        ),
        Err(e) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "blocking_error",
            &e.to_string(),
            &request_id,
        ),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    symbol: String,
    interval: String,
    limit: Option<usize>,
    before_open_time: Option<i64>,
    after_open_time: Option<i64>,
}

/// GET /ohlcv/history - Pagination par curseur (before/after exclusifs)
#[get("/ohlcv/history")]
async fn get_history(
    data: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let request_id = data.next_request_id();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return resp;
    }
    if query.before_open_time.is_some() && query.after_open_time.is_some() {
        return error_json(
            actix_web::http::StatusCode::BAD_REQUEST,
            "conflicting_cursors",
            "before_open_time et after_open_time sont mutuellement exclusifs",
            &request_id,
        );
    }
    let limit = query.limit.unwrap_or(500).min(data.config.recent_limit_max);
    let before = query.before_open_time;
    let after = query.after_open_time;

    let db_file = data.config.db_file.clone();
    let result = web::block(move || {
        let store = CanonicalStore::new(&db_file)?;
        store.get_page(&symbol, &timeframe, before, after, limit)
    })
    .await;

    match result {
        Ok(Ok(candles)) => HttpResponse::Ok().json(serde_json::json!({ "candles": candles })),
        Ok(Err(e)) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
            &request_id,
        ),
        Err(e) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "blocking_error",
            &e.to_string(),
            &request_id,
        ),
    }
}

#[derive(Debug, Deserialize)]
struct DeltaQuery {
    symbol: String,
    interval: String,
    since: i64,
    limit: Option<usize>,
}

/// GET /ohlcv/delta - Rattrapage incrémental après un filigrane
#[get("/ohlcv/delta")]
async fn get_delta(data: web::Data<AppState>, query: web::Query<DeltaQuery>) -> impl Responder {
    let request_id = data.next_request_id();
    let started = Instant::now();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    let interval_ms = match validate_key(&symbol, &timeframe, &request_id) {
        Ok(i) => i,
        Err(resp) => return resp,
    };
    let since = query.since;
    let limit = query.limit.unwrap_or(500).min(data.config.delta_limit_max);

    data.metrics
        .delta_requests_total
        .fetch_add(1, Ordering::Relaxed);

    let db_file = data.config.db_file.clone();
    let result = web::block(move || {
        let store = CanonicalStore::new(&db_file)?;
        compute_delta(&store, &symbol, &timeframe, since, limit, interval_ms)
    })
    .await;

    data.metrics
        .delta_latency
        .record(started.elapsed().as_millis() as u64);

    match result {
        Ok(Ok(delta)) => {
            if delta.truncated {
                data.metrics
                    .delta_truncated_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            HttpResponse::Ok().json(delta)
        }
        Ok(Err(e)) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
            &request_id,
        ),
        Err(e) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "blocking_error",
            &e.to_string(),
            &request_id,
        ),
    }
}

#[derive(Debug, Deserialize)]
struct GapsQuery {
    symbol: String,
    interval: String,
}

/// GET /ohlcv/gaps/status - Segments open/in_progress/recovered d'un couple
#[get("/ohlcv/gaps/status")]
async fn get_gaps_status(
    data: web::Data<AppState>,
    query: web::Query<GapsQuery>,
) -> impl Responder {
    let request_id = data.next_request_id();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return resp;
    }

    let db_file = data.config.db_file.clone();
    let result = web::block(move || {
        let gaps = GapRepository::new(&db_file)?;
        gaps.list_status(&symbol, &timeframe, 200)
    })
    .await;

    match result {
        Ok(Ok(segments)) => HttpResponse::Ok().json(serde_json::json!({ "segments": segments })),
        Ok(Err(e)) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "gap_repo_error",
            &e.to_string(),
            &request_id,
        ),
        Err(e) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "blocking_error",
            &e.to_string(),
            &request_id,
        ),
    }
}

#[derive(Debug, Deserialize)]
struct BackfillQuery {
    symbol: String,
    interval: String,
}

/// POST /ohlcv/backfill/year - Démarre un run de backfill d'horizon (admin)
#[post("/ohlcv/backfill/year")]
async fn post_backfill_year(
    data: web::Data<AppState>,
    query: web::Query<BackfillQuery>,
) -> impl Responder {
    let request_id = data.next_request_id();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return resp;
    }

    // Un seul run actif par couple
    let db_file = data.config.db_file.clone();
    let symbol_check = symbol.clone();
    let timeframe_check = timeframe.clone();
    let latest = web::block(move || {
        let store = CanonicalStore::new(&db_file)?;
        store.latest_run(&symbol_check, &timeframe_check)
    })
    .await;
    if let Ok(Ok(Some(run))) = &latest {
        if run.status == BackfillStatus::Running || run.status == BackfillStatus::Pending {
            return error_json(
                actix_web::http::StatusCode::CONFLICT,
                "backfill_already_running",
                "un run de backfill est déjà actif pour ce couple",
                &request_id,
            );
        }
    }

    let options = BackfillOptions::new(
        symbol.clone(),
        timeframe.clone(),
        data.config.db_file.clone(),
    )
    .with_paging(
        data.config.backfill_page_size,
        data.config.backfill_max_pages,
    );
    let adapter = Arc::clone(&data.adapter);
    let hub = Arc::clone(&data.hub);
    let metrics = Arc::clone(&data.metrics);
    let shutdown = Arc::clone(&data.shutdown);

    tokio::task::spawn_blocking(move || {
        let source: &dyn HistorySource = adapter.as_ref();
        if let Err(e) = run_horizon_backfill(source, &options, hub, metrics, &shutdown) {
            eprintln!("❌ Backfill d'horizon en échec pour {}: {}", options.symbol, e);
        }
    });

    HttpResponse::Accepted().json(serde_json::json!({
        "status": "started",
        "symbol": symbol,
        "interval": timeframe,
        "request_id": request_id,
    }))
}

/// GET /ohlcv/backfill/year/status - Progression du run le plus récent
#[get("/ohlcv/backfill/year/status")]
async fn get_backfill_status(
    data: web::Data<AppState>,
    query: web::Query<BackfillQuery>,
) -> impl Responder {
    let request_id = data.next_request_id();
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return resp;
    }

    let db_file = data.config.db_file.clone();
    let result = web::block(move || {
        let store = CanonicalStore::new(&db_file)?;
        store.latest_run(&symbol, &timeframe)
    })
    .await;

    match result {
        Ok(Ok(Some(run))) => HttpResponse::Ok().json(run),
        Ok(Ok(None)) => error_json(
            actix_web::http::StatusCode::NOT_FOUND,
            "no_backfill_run",
            "aucun run de backfill pour ce couple",
            &request_id,
        ),
        Ok(Err(e)) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
            &request_id,
        ),
        Err(e) => error_json(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "blocking_error",
            &e.to_string(),
            &request_id,
        ),
    }
}

/// GET /health - Health check
#[get("/health")]
async fn health(data: web::Data<AppState>) -> impl Responder {
    let snapshot = data.metrics.snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": data.hub.subscriber_count(),
        "gauges": snapshot.gauges,
    }))
}

/// GET /metrics - Snapshot complet des compteurs/jauges/histogrammes
#[get("/metrics")]
async fn metrics_endpoint(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.metrics.snapshot())
}

// ============================================================================
// MODULE WEBSOCKET - Diffusion avec enveloppe seq/epoch
// ============================================================================

#[derive(Debug, Deserialize)]
struct PushQuery {
    symbol: String,
    interval: String,
    include_open: Option<bool>,
}

/// Message Actix: un événement du hub à mettre en file pour ce client
#[derive(Message)]
#[rtype(result = "()")]
struct Enqueue(PushPayload);

/// Session WebSocket d'un abonné
///
/// Un seul émetteur par abonné: la session attribue seq juste avant
/// l'écriture, l'ordre total par connexion est donc garanti.
struct WsSession {
    symbol: String,
    timeframe: String,
    include_open: bool,
    channel: String,
    hb: Instant,
    last_sent: Instant,
    sequencer: EpochSequencer,
    queue: SubscriberQueue,
    snapshot: Option<PushPayload>,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
    heartbeat_ms: u64,
    shutdown: Arc<AtomicBool>,
}

impl WsSession {
    #[allow(clippy::too_many_arguments)]
    fn new(
        symbol: String,
        timeframe: String,
        include_open: bool,
        epoch: String,
        snapshot: PushPayload,
        queue_size: usize,
        coalesce: bool,
        hub: Arc<PushHub>,
        metrics: Arc<Metrics>,
        heartbeat_ms: u64,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let channel = format!("ohlcv:{}:{}", symbol, timeframe);
        WsSession {
            symbol,
            timeframe,
            include_open,
            channel,
            hb: Instant::now(),
            last_sent: Instant::now(),
            sequencer: EpochSequencer::new(epoch),
            queue: SubscriberQueue::new(queue_size, coalesce),
            snapshot: Some(snapshot),
            hub,
            metrics,
            heartbeat_ms,
            shutdown,
        }
    }

    /// Vide la file en attribuant seq à chaque écriture
    fn flush(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        while let Some(payload) = self.queue.pop() {
            let envelope = self.sequencer.envelope(&self.channel, now_ms(), payload);
            if let Ok(json) = serde_json::to_string(&envelope) {
                ctx.text(json);
                self.last_sent = Instant::now();
            }
        }
    }

    /// Ferme la session sur saturation terminale de la file
    fn close_on_overflow(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let envelope = self.sequencer.envelope(
            &self.channel,
            now_ms(),
            PushPayload::Error {
                code: "subscriber_overflow".to_string(),
                reason: "file de sortie saturée".to_string(),
                request_id: String::new(),
            },
        );
        if let Ok(json) = serde_json::to_string(&envelope) {
            ctx.text(json);
        }
        ctx.close(None);
        ctx.stop();
    }

    /// Pings de transport et heartbeat applicatif
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(WS_PING_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                println!("⚠️ Timeout heartbeat client, déconnexion");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });

        let heartbeat = Duration::from_millis(self.heartbeat_ms.max(1_000));
        ctx.run_interval(heartbeat, move |act, ctx| {
            // Sauté si un événement réel vient de partir
            if act.last_sent.elapsed() < heartbeat / 2 {
                return;
            }
            act.metrics.count_push_event("heartbeat");
            let outcome = act.queue.push(PushPayload::Heartbeat);
            record_enqueue_outcome(&act.metrics, outcome);
            act.flush(ctx);
        });
    }

    /// Pompe du canal broadcast du hub vers la boîte de la session
    fn start_broadcast_listener(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let mut rx = self.hub.subscribe();
        let addr = ctx.address();
        let symbol = self.symbol.clone();
        let timeframe = self.timeframe.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.symbol == symbol && event.timeframe == timeframe {
                            if addr.try_send(Enqueue(event.payload)).is_err() {
                                break; // session terminée
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("⚠️ Broadcast en retard, {} événements perdus", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        println!(
            "🔌 Abonné WS connecté sur {} (epoch {})",
            self.channel,
            self.sequencer.epoch()
        );

        // Snapshot en premier (seq = 0)
        if let Some(snapshot) = self.snapshot.take() {
            self.metrics.count_push_event("snapshot");
            let envelope = self.sequencer.envelope(&self.channel, now_ms(), snapshot);
            if let Ok(json) = serde_json::to_string(&envelope) {
                ctx.text(json);
                self.last_sent = Instant::now();
            }
        }

        self.start_heartbeat(ctx);
        self.start_broadcast_listener(ctx);
    }

    fn stopping(&mut self, ctx: &mut Self::Context) -> actix::Running {
        // Arrêt du serveur: erreur terminale avant fermeture
        if self.shutdown.load(Ordering::Relaxed) {
            let envelope = self.sequencer.envelope(
                &self.channel,
                now_ms(),
                PushPayload::Error {
                    code: "server_shutdown".to_string(),
                    reason: "arrêt ordonné du serveur".to_string(),
                    request_id: String::new(),
                },
            );
            if let Ok(json) = serde_json::to_string(&envelope) {
                ctx.text(json);
            }
        }
        actix::Running::Stop
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        println!("🔌 Abonné WS déconnecté de {}", self.channel);
    }
}

impl Handler<Enqueue> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Enqueue, ctx: &mut Self::Context) {
        // Le filtrage (symbol, timeframe) est fait par la pompe; reste le
        // filtre include_open de l'abonné
        if !self.include_open
            && matches!(
                msg.0,
                PushPayload::PartialUpdate { .. } | PushPayload::PartialClose { .. }
            )
        {
            return;
        }
        let outcome = self.queue.push(msg.0);
        record_enqueue_outcome(&self.metrics, outcome);
        match outcome {
            EnqueueOutcome::Overflow => self.close_on_overflow(ctx),
            _ => self.flush(ctx),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(_)) => {
                // Protocole descendant uniquement; le texte client rafraîchit
                // le heartbeat sans autre effet
                self.hb = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(_) => ctx.stop(),
            _ => {}
        }
    }
}

/// Construit le snapshot initial d'une connexion
async fn build_snapshot(
    data: &web::Data<AppState>,
    symbol: &str,
    timeframe: &str,
    include_open: bool,
) -> Result<PushPayload, String> {
    let db_file = data.config.db_file.clone();
    let symbol_cl = symbol.to_string();
    let timeframe_cl = timeframe.to_string();
    let candles = web::block(move || {
        let store = CanonicalStore::new(&db_file)?;
        store.get_tail(&symbol_cl, &timeframe_cl, SNAPSHOT_TAIL)
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())?;

    let partial = if include_open {
        data.partials
            .read()
            .ok()
            .and_then(|m| m.get(&(symbol.to_string(), timeframe.to_string())).cloned())
    } else {
        None
    };

    Ok(PushPayload::Snapshot { candles, partial })
}

/// Endpoint WebSocket /ws/ohlcv
async fn ws_ohlcv(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    query: web::Query<PushQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    let request_id = data.next_request_id();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return Ok(resp);
    }
    let include_open = query.include_open.unwrap_or(false);

    let snapshot = build_snapshot(&data, &symbol, &timeframe, include_open)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    let session = WsSession::new(
        symbol,
        timeframe,
        include_open,
        data.hub.next_epoch(),
        snapshot,
        data.config.push_subscriber_queue_size,
        data.config.push_partial_coalesce,
        Arc::clone(&data.hub),
        Arc::clone(&data.metrics),
        data.config.push_heartbeat_ms,
        Arc::clone(&data.shutdown),
    );
    ws::start(session, &req, stream)
}

// ============================================================================
// MODULE SSE - Même enveloppe, transport text/event-stream
// ============================================================================

/// Endpoint SSE /stream/signals
async fn sse_signals(
    data: web::Data<AppState>,
    query: web::Query<PushQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let symbol = query.symbol.to_uppercase();
    let timeframe = query.interval.clone();
    let request_id = data.next_request_id();
    if let Err(resp) = validate_key(&symbol, &timeframe, &request_id) {
        return Ok(resp);
    }
    let include_open = query.include_open.unwrap_or(false);

    let snapshot = build_snapshot(&data, &symbol, &timeframe, include_open)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    let epoch = data.hub.next_epoch();
    let channel = format!("ohlcv:{}:{}", symbol, timeframe);
    let queue_size = data.config.push_subscriber_queue_size;
    let coalesce = data.config.push_partial_coalesce;
    let heartbeat_ms = data.config.push_heartbeat_ms.max(1_000);
    let hub = Arc::clone(&data.hub);
    let metrics = Arc::clone(&data.metrics);
    let shutdown = Arc::clone(&data.shutdown);

    let (mut tx, rx) = futures_channel::mpsc::channel::<web::Bytes>(queue_size);

    tokio::spawn(async move {
        use futures_util::SinkExt;

        let mut sequencer = EpochSequencer::new(epoch);
        let mut queue = SubscriberQueue::new(queue_size, coalesce);
        let mut rx_hub = hub.subscribe();
        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
        heartbeat.tick().await; // le premier tick est immédiat
        let mut last_sent = Instant::now();

        // Snapshot en premier (seq = 0)
        metrics.count_push_event("snapshot");
        let envelope = sequencer.envelope(&channel, now_ms(), snapshot);
        if let Ok(json) = serde_json::to_string(&envelope) {
            if tx.send(web::Bytes::from(format!("data: {}\n\n", json))).await.is_err() {
                return;
            }
        }

        'session: loop {
            // Drainage de la file vers le client
            while let Some(payload) = queue.pop() {
                let envelope = sequencer.envelope(&channel, now_ms(), payload);
                if let Ok(json) = serde_json::to_string(&envelope) {
                    if tx.send(web::Bytes::from(format!("data: {}\n\n", json))).await.is_err() {
                        break 'session;
                    }
                    last_sent = Instant::now();
                }
            }

            tokio::select! {
                received = rx_hub.recv() => {
                    match received {
                        Ok(event) => {
                            if event.symbol != symbol || event.timeframe != timeframe {
                                continue;
                            }
                            if !include_open
                                && matches!(
                                    event.payload,
                                    PushPayload::PartialUpdate { .. }
                                        | PushPayload::PartialClose { .. }
                                )
                            {
                                continue;
                            }
                            let outcome = queue.push(event.payload);
                            record_enqueue_outcome(&metrics, outcome);
                            if outcome == EnqueueOutcome::Overflow {
                                let envelope = sequencer.envelope(
                                    &channel,
                                    now_ms(),
                                    PushPayload::Error {
                                        code: "subscriber_overflow".to_string(),
                                        reason: "file de sortie saturée".to_string(),
                                        request_id: String::new(),
                                    },
                                );
                                if let Ok(json) = serde_json::to_string(&envelope) {
                                    let _ = tx
                                        .send(web::Bytes::from(format!("data: {}\n\n", json)))
                                        .await;
                                }
                                break 'session;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            eprintln!("⚠️ SSE en retard, {} événements perdus", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break 'session,
                    }
                }
                _ = heartbeat.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        let envelope = sequencer.envelope(
                            &channel,
                            now_ms(),
                            PushPayload::Error {
                                code: "server_shutdown".to_string(),
                                reason: "arrêt ordonné du serveur".to_string(),
                                request_id: String::new(),
                            },
                        );
                        if let Ok(json) = serde_json::to_string(&envelope) {
                            let _ = tx
                                .send(web::Bytes::from(format!("data: {}\n\n", json)))
                                .await;
                        }
                        break 'session;
                    }
                    // Sauté si un événement réel vient de partir
                    if last_sent.elapsed() >= Duration::from_millis(heartbeat_ms) / 2 {
                        metrics.count_push_event("heartbeat");
                        let outcome = queue.push(PushPayload::Heartbeat);
                        record_enqueue_outcome(&metrics, outcome);
                    }
                }
            }
        }
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(rx.map(Ok::<_, actix_web::Error>)))
}

// ============================================================================
// DÉMARRAGE
// ============================================================================

/// Alimente le cache des partielles depuis le hub
fn start_partial_cache(hub: &PushHub, partials: PartialCache) {
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let key = (event.symbol.clone(), event.timeframe.clone());
                    match event.payload {
                        PushPayload::PartialUpdate { candle } => {
                            if let Ok(mut map) = partials.write() {
                                map.insert(key, candle);
                            }
                        }
                        PushPayload::PartialClose { .. } | PushPayload::Append { .. } => {
                            if let Ok(mut map) = partials.write() {
                                map.remove(&key);
                            }
                        }
                        _ => {}
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = Arc::new(EngineConfig::from_env());

    println!(
        "🚀 Démarrage du moteur de continuité sur http://{}:{}",
        config.bind_addr, config.http_port
    );
    println!("📊 Base de données: {}", config.db_file);
    println!("📈 Couple actif: {}/{}", config.symbol, config.timeframe);

    // Schéma initialisé avant tout composant
    DatabaseManager::new(&config.db_file)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(PushHub::new(Arc::clone(&metrics)));
    let shutdown = Arc::new(AtomicBool::new(false));
    let adapter = Arc::new(UpstreamAdapter::new(
        Arc::clone(&metrics),
        config.backfill_retry_max,
        config.backfill_retry_backoff_ms as u64,
    ));

    // Cache des partielles alimenté par le hub
    let partials: PartialCache = Arc::new(RwLock::new(HashMap::new()));
    start_partial_cache(&hub, Arc::clone(&partials));

    // Consommateur de flux temps réel (boucle bloquante dédiée)
    let stream_rx = upstream::subscribe_stream(
        config.symbol.clone(),
        config.timeframe.clone(),
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    );
    {
        let store = CanonicalStore::new(&config.db_file)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let gaps = GapRepository::new(&config.db_file)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let consumer = StreamConsumer::new(
            &config.symbol,
            &config.timeframe,
            config.interval_ms,
            store,
            gaps,
            Arc::clone(&hub),
            Arc::clone(&metrics),
        );
        let shutdown_cl = Arc::clone(&shutdown);
        tokio::task::spawn_blocking(move || consumer.run_blocking(stream_rx, shutdown_cl));
    }

    // Orchestrateur de gaps (leadership par verrou consultatif)
    {
        let orchestrator = GapOrchestrator::new(
            &config.db_file,
            &config.store_lock_key,
            config.orchestrator_poll_interval_ms,
            config.backfill_concurrency,
            config.backfill_page_size,
            config.backfill_max_pages,
            config.backfill_retry_max,
            config.backfill_retry_backoff_ms,
            Arc::clone(&hub),
            Arc::clone(&metrics),
        );
        let source: Arc<dyn HistorySource> = Arc::clone(&adapter) as Arc<dyn HistorySource>;
        let shutdown_cl = Arc::clone(&shutdown);
        tokio::spawn(orchestrator.run(source, shutdown_cl));
    }

    // Scanner périodique de continuité
    tokio::spawn(scanner::run_periodic(
        config.db_file.clone(),
        config.symbol.clone(),
        config.timeframe.clone(),
        config.interval_ms,
        config.scanner_horizon_days,
        config.scanner_schedule_ms,
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    ));

    // Cache des réponses /ohlcv/recent
    let candles_cache: Cache<CacheKey, Arc<Vec<Candle>>> = Cache::builder()
        .max_capacity(1_000)
        .time_to_live(Duration::from_secs(10))
        .build();

    let app_state = web::Data::new(AppState {
        config: Arc::clone(&config),
        hub: Arc::clone(&hub),
        metrics: Arc::clone(&metrics),
        adapter,
        partials,
        candles_cache,
        request_counter: AtomicU64::new(0),
        shutdown: Arc::clone(&shutdown),
    });

    let bind = (config.bind_addr.clone(), config.http_port);
    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .app_data(app_state.clone())
            .service(health)
            .service(metrics_endpoint)
            .service(get_recent)
            .service(get_meta)
            .service(get_history)
            .service(get_delta)
            .service(get_gaps_status)
            .service(post_backfill_year)
            .service(get_backfill_status)
            .route("/ws/ohlcv", web::get().to(ws_ohlcv))
            .route("/stream/signals", web::get().to(sse_signals))
    })
    .bind(bind)?
    .run();

    let result = server.await;

    // Arrêt ordonné: les tâches drainent puis les abonnés reçoivent l'erreur
    // terminale server_shutdown
    shutdown.store(true, Ordering::Relaxed);
    println!("🛑 Arrêt du moteur de continuité");
    result
}
