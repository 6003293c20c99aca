/// Module de l'adaptateur upstream (Binance)
///
/// Architecture:
/// - Une task tokio par flux WebSocket kline, avec reconnexion automatique;
///   chaque (re)connexion injecte un marqueur Reconnected pour que le
///   consommateur resynchronise son pointeur de continuité
/// - L'historique REST est paginé par get_klines, protégé par un token
///   bucket à permis pondérés
/// - Sémantique at-least-once: des doublons sont possibles entre
///   reconnexions, absorbés en aval par l'upsert idempotent
use crate::errors::AdapterError;
use crate::metrics::Metrics;
use crate::models::Candle;
use crate::utils::now_ms;
use binance::api::*;
use binance::market::*;
use binance::model::KlineSummaries;
use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

/// Échecs de décodage consécutifs avant mise en quarantaine du flux
const DECODE_FAILURES_FATAL: u32 = 10;

/// Pause avant reconnexion du WebSocket
const RECONNECT_DELAY_SECS: u64 = 5;

/// Message émis par le flux vers le consommateur
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// Bougie (partielle ou finalisée) normalisée
    Candle(StreamCandleEvent),
    /// Le flux vient de (re)connecter: resynchronisation requise
    Reconnected,
    /// Panne permanente du décodage: le couple est en quarantaine
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct StreamCandleEvent {
    pub candle: Candle,
    pub received_at_ms: i64,
}

/// Message Binance Kline
#[derive(Debug, Deserialize)]
struct BinanceKlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    #[allow(dead_code)]
    symbol: String,
    #[serde(rename = "k")]
    kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
struct BinanceKline {
    #[serde(rename = "t")]
    start_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trade_count: i64,
    #[serde(rename = "x")]
    is_closed: bool,
}

impl BinanceKline {
    fn normalize(&self) -> Candle {
        Candle {
            open_time: self.start_time,
            open: self.open.parse().unwrap_or(0.0),
            high: self.high.parse().unwrap_or(0.0),
            low: self.low.parse().unwrap_or(0.0),
            close: self.close.parse().unwrap_or(0.0),
            volume: self.volume.parse().unwrap_or(0.0),
            close_time: self.close_time,
            trade_count: self.trade_count,
            is_closed: self.is_closed,
        }
    }
}

/// Ouvre le flux kline d'un couple et retourne le canal de réception
///
/// La task vit jusqu'au signal d'arrêt ou à une panne fatale de décodage.
pub fn subscribe_stream(
    symbol: String,
    timeframe: String,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
) -> mpsc::Receiver<StreamMessage> {
    let (tx, rx) = mpsc::channel(1_024);

    tokio::spawn(async move {
        let stream_name = format!("{}@kline_{}", symbol.to_lowercase(), timeframe);
        let url = format!("wss://stream.binance.com:9443/ws/{}", stream_name);
        let mut consecutive_decode_failures = 0u32;
        let mut first_connection = true;

        'reconnect: loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            println!("📡 Connexion à {}", url);

            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    println!("✅ Connecté à {}", stream_name);
                    if !first_connection {
                        metrics.reconnects_total.fetch_add(1, Ordering::Relaxed);
                    }
                    first_connection = false;

                    // Le consommateur repasse en RESYNCING
                    if tx.send(StreamMessage::Reconnected).await.is_err() {
                        return;
                    }

                    let (mut _write, mut read) = ws_stream.split();

                    while let Some(msg) = read.next().await {
                        if shutdown.load(Ordering::Relaxed) {
                            break 'reconnect;
                        }
                        match msg {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<BinanceKlineEvent>(&text) {
                                    Ok(event) if event.event_type == "kline" => {
                                        consecutive_decode_failures = 0;
                                        let candle = event.kline.normalize();
                                        metrics
                                            .stream_messages_total
                                            .fetch_add(1, Ordering::Relaxed);

                                        if !candle.is_coherent() {
                                            metrics
                                                .rejected_candles_total
                                                .fetch_add(1, Ordering::Relaxed);
                                            continue;
                                        }

                                        let out = StreamMessage::Candle(StreamCandleEvent {
                                            candle,
                                            received_at_ms: now_ms(),
                                        });
                                        if tx.send(out).await.is_err() {
                                            return;
                                        }
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        metrics
                                            .decode_failures_total
                                            .fetch_add(1, Ordering::Relaxed);
                                        consecutive_decode_failures += 1;
                                        if consecutive_decode_failures >= DECODE_FAILURES_FATAL {
                                            eprintln!(
                                                "❌ Décodage en panne permanente pour {}: {}",
                                                stream_name, e
                                            );
                                            let _ = tx
                                                .send(StreamMessage::Fatal(format!(
                                                    "{} échecs de décodage consécutifs",
                                                    consecutive_decode_failures
                                                )))
                                                .await;
                                            return;
                                        }
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => {
                                println!("🔌 Connexion fermée pour {}", stream_name);
                                break;
                            }
                            Err(e) => {
                                eprintln!("❌ Erreur WebSocket pour {}: {}", stream_name, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    eprintln!("❌ Échec de connexion à {}: {}", stream_name, e);
                }
            }

            println!(
                "⏰ Reconnexion à {} dans {}s...",
                stream_name, RECONNECT_DELAY_SECS
            );
            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    });

    rx
}

/// Token bucket des appels REST
///
/// ALGORITHME:
/// Remplissage continu à refill_per_sec jusqu'à capacity. acquire_permit
/// attend coopérativement (pas de spin) jusqu'à la deadline; une pénalité
/// (429) gèle le bucket jusqu'à son échéance.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    frozen_until: Option<Instant>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        TokenBucket {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                frozen_until: None,
            }),
        }
    }

    /// Attend un permis de coût `cost`, au plus jusqu'à `deadline`
    pub fn acquire_permit(&self, cost: f64, deadline: Duration) -> Result<(), AdapterError> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                let now = Instant::now();

                if let Some(until) = state.frozen_until {
                    if now < until {
                        Some(until - now)
                    } else {
                        state.frozen_until = None;
                        None
                    }
                } else {
                    None
                }
                .or_else(|| {
                    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                    state.tokens =
                        (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                    state.last_refill = now;

                    if state.tokens >= cost {
                        state.tokens -= cost;
                        None // permis accordé
                    } else {
                        let missing = cost - state.tokens;
                        Some(Duration::from_secs_f64(missing / self.refill_per_sec))
                    }
                })
            };

            let wait = match wait {
                None => return Ok(()),
                Some(w) => w,
            };

            if started.elapsed() + wait > deadline {
                return Err(AdapterError::RateLimited {
                    retry_after_ms: wait.as_millis() as i64,
                });
            }
            std::thread::sleep(wait.min(Duration::from_millis(200)));
        }
    }

    /// Gèle le bucket suite à un 429 du fournisseur
    pub fn penalize(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let until = Instant::now() + duration;
        state.frozen_until = Some(match state.frozen_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

/// Source d'historique paginé (couture de test du worker de backfill)
pub trait HistorySource: Send + Sync {
    /// Bougies finalisées de [from, to], ordre ascendant, au plus page_size
    fn fetch_history(
        &self,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
        page_size: usize,
    ) -> Result<Vec<Candle>, AdapterError>;
}

/// Adaptateur REST Binance avec retry et rate limit
pub struct UpstreamAdapter {
    market: Market,
    limiter: TokenBucket,
    metrics: Arc<Metrics>,
    retry_max: u32,
    backoff_ms: u64,
}

impl UpstreamAdapter {
    pub fn new(metrics: Arc<Metrics>, retry_max: u32, backoff_ms: u64) -> Self {
        let market: Market = Binance::new(None, None);
        // Budget Binance: 1200 unités de poids par minute
        UpstreamAdapter {
            market,
            limiter: TokenBucket::new(1_200.0, 20.0),
            metrics,
            retry_max,
            backoff_ms,
        }
    }

    /// Poids d'une page get_klines selon sa taille
    fn page_weight(page_size: usize) -> f64 {
        match page_size {
            0..=100 => 1.0,
            101..=500 => 2.0,
            _ => 5.0,
        }
    }

    fn fetch_page(
        &self,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
        page_size: usize,
    ) -> Result<Vec<Candle>, AdapterError> {
        let klines_data = self
            .market
            .get_klines(
                symbol,
                timeframe,
                Some(page_size as u16),
                Some(from as u64),
                Some(to as u64),
            )
            .map_err(|e| {
                let msg = format!("{:?}", e);
                if msg.contains("429") || msg.contains("Too Many Requests") {
                    AdapterError::RateLimited {
                        retry_after_ms: 30_000,
                    }
                } else {
                    AdapterError::Transient(format!("erreur API Binance: {}", msg))
                }
            })?;

        let KlineSummaries::AllKlineSummaries(klines) = klines_data;

        let mut candles = Vec::with_capacity(klines.len());
        for kline in klines {
            let candle = Candle {
                open_time: kline.open_time,
                open: kline.open.parse().unwrap_or(0.0),
                high: kline.high.parse().unwrap_or(0.0),
                low: kline.low.parse().unwrap_or(0.0),
                close: kline.close.parse().unwrap_or(0.0),
                volume: kline.volume.parse().unwrap_or(0.0),
                close_time: kline.close_time,
                trade_count: kline.number_of_trades,
                is_closed: true,
            };
            if candle.is_coherent() {
                candles.push(candle);
            } else {
                self.metrics
                    .rejected_candles_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(candles)
    }
}

impl HistorySource for UpstreamAdapter {
    /// Page d'historique avec permis pondéré et retry exponentiel
    ///
    /// Sur 429, l'attente double avec jitter jusqu'à un plafond et le bucket
    /// est gelé pour les autres appelants.
    fn fetch_history(
        &self,
        symbol: &str,
        timeframe: &str,
        from: i64,
        to: i64,
        page_size: usize,
    ) -> Result<Vec<Candle>, AdapterError> {
        self.limiter
            .acquire_permit(Self::page_weight(page_size), Duration::from_secs(60))?;

        let mut attempt = 0u32;
        let mut backoff = self.backoff_ms;
        loop {
            match self.fetch_page(symbol, timeframe, from, to, page_size) {
                Ok(candles) => return Ok(candles),
                Err(AdapterError::RateLimited { retry_after_ms }) if attempt < self.retry_max => {
                    let jitter = rand::thread_rng().gen_range(0..250);
                    let wait = (retry_after_ms as u64).max(backoff) + jitter;
                    self.limiter.penalize(Duration::from_millis(wait));
                    eprintln!(
                        "⚠️ Rate limit upstream pour {}/{}, pause {} ms",
                        symbol, timeframe, wait
                    );
                    std::thread::sleep(Duration::from_millis(wait));
                    backoff = (backoff * 2).min(120_000);
                    attempt += 1;
                }
                Err(AdapterError::Transient(msg)) if attempt < self.retry_max => {
                    let jitter = rand::thread_rng().gen_range(0..250);
                    eprintln!(
                        "⚠️ Erreur transitoire upstream ({}), retry dans {} ms",
                        msg, backoff
                    );
                    std::thread::sleep(Duration::from_millis(backoff + jitter));
                    backoff = (backoff * 2).min(120_000);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_accorde_sous_capacite() {
        let bucket = TokenBucket::new(10.0, 1.0);
        for _ in 0..10 {
            bucket
                .acquire_permit(1.0, Duration::from_millis(10))
                .unwrap();
        }
    }

    #[test]
    fn test_token_bucket_deadline_depassee() {
        let bucket = TokenBucket::new(2.0, 0.5);
        bucket.acquire_permit(2.0, Duration::from_millis(10)).unwrap();
        // Bucket vide, recharge trop lente pour la deadline
        let err = bucket.acquire_permit(2.0, Duration::from_millis(50));
        assert!(matches!(err, Err(AdapterError::RateLimited { .. })));
    }

    #[test]
    fn test_token_bucket_penalite_gele() {
        let bucket = TokenBucket::new(10.0, 10.0);
        bucket.penalize(Duration::from_secs(30));
        let err = bucket.acquire_permit(1.0, Duration::from_millis(20));
        assert!(matches!(err, Err(AdapterError::RateLimited { .. })));
    }

    #[test]
    fn test_poids_des_pages() {
        assert_eq!(UpstreamAdapter::page_weight(50), 1.0);
        assert_eq!(UpstreamAdapter::page_weight(500), 2.0);
        assert_eq!(UpstreamAdapter::page_weight(1_000), 5.0);
    }

    #[test]
    fn test_normalisation_kline() {
        let raw = r#"{"e":"kline","s":"XRPUSDT","k":{"t":1700000000000,"T":1700000059999,
            "o":"0.61","h":"0.63","l":"0.60","c":"0.62","v":"12345.5","n":42,"x":true}}"#;
        let event: BinanceKlineEvent = serde_json::from_str(raw).unwrap();
        let candle = event.kline.normalize();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.close_time, 1_700_000_059_999);
        assert_eq!(candle.trade_count, 42);
        assert!(candle.is_closed);
        assert!(candle.is_coherent());
    }
}
