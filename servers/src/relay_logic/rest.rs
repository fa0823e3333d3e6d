use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    Json,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use lib_common::core::ttl_cache::hash_key;
use lib_common::indicators::{self, IndicatorKind};
use lib_common::markets::Candle;
use lib_common::markets::kraken::PROVIDER;
use serde_json::{Value, json};

use crate::relay_logic::error::AppError;
use crate::relay_logic::model::{ComputeRequest, NormalizeQuery, NormalizeResponse};
use crate::relay_logic::state::AppState;

pub const SECRET_HEADER: &str = "x-relay-secret";
pub const DEFAULT_COUNT: usize = 200;
pub const MAX_COUNT: usize = 720;

/// Peer address of the connection. The first `x-forwarded-for` hop is only
/// used when the relay is configured to sit behind a trusted proxy.
fn client_identity(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Per-identity request budget in front of every REST route.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    let identity = client_identity(&request, state.settings.trust_forwarded_for);
    if let Err(e) = state.rate_limiter.check(&identity) {
        state.metrics.record_rate_limited();
        log::warn!("Rate limited {} on {}", identity, request.uri().path());
        return Err(AppError::RateLimitExceeded {
            message: e.to_string(),
            retry_after_secs: e.retry_after.as_secs(),
        });
    }
    Ok(next.run(request).await)
}

fn require_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.settings.shared_secret.as_deref() else {
        return Ok(());
    };
    match headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        Some(given) if given == expected => Ok(()),
        Some(_) => Err(AppError::Unauthorized("invalid shared secret".into())),
        None => Err(AppError::Unauthorized(format!("missing {} header", SECRET_HEADER))),
    }
}

fn parse_indicators(names: &[String]) -> Result<Vec<IndicatorKind>, AppError> {
    if names.is_empty() {
        return Ok(IndicatorKind::DEFAULT_SET.to_vec());
    }
    let mut kinds = names
        .iter()
        .map(|name| name.parse::<IndicatorKind>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    kinds.sort();
    kinds.dedup();
    Ok(kinds)
}

/// Candles for `(canonical, interval, count)` through the history cache.
async fn history_candles(
    state: &AppState,
    canonical: &str,
    interval: u32,
    count: usize,
) -> Result<Arc<Vec<Candle>>, AppError> {
    let key = format!("{}|{}|{}", canonical, interval, count);
    if let Some(candles) = state.history_cache.get(&key) {
        log::debug!("History cache hit for {}", key);
        return Ok(candles);
    }
    let candles = state
        .history
        .fetch_candles(canonical, interval, count)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    let candles = Arc::new(candles);
    state.history_cache.insert(key, Arc::clone(&candles));
    Ok(candles)
}

pub async fn compute_indicators(
    State(state): State<AppState>,
    Json(request): Json<ComputeRequest>,
) -> Result<Json<Value>, AppError> {
    let kinds = parse_indicators(&request.indicators)?;

    let supplied = request.candles.filter(|c| !c.is_empty());
    let (cache_input, canonical, interval, count) = match &supplied {
        Some(candles) => (json!({ "candles": candles, "indicators": kinds }), None, None, candles.len()),
        None => {
            let symbol = request
                .symbol
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| AppError::BadRequest("symbol or candles required".into()))?;
            let canonical = state.resolver.resolve(symbol).await;
            let interval = request.interval.filter(|i| *i > 0).unwrap_or(state.settings.default_interval);
            let count = request.count.unwrap_or(DEFAULT_COUNT).clamp(1, MAX_COUNT);
            let input = json!({
                "canonical": canonical,
                "interval": interval,
                "count": count,
                "indicators": kinds,
            });
            (input, Some(canonical), Some(interval), count)
        }
    };

    let key = hash_key(&cache_input).map_err(|e| AppError::Internal(anyhow!(e)))?;
    if let Some(mut cached) = state.compute_cache.get(&key) {
        state.metrics.record_compute_cache_hit();
        cached["cached"] = Value::Bool(true);
        return Ok(Json(cached));
    }

    let (candles, source) = match (supplied, &canonical, interval) {
        (Some(candles), _, _) => (Arc::new(candles), "request"),
        (None, Some(canonical), Some(interval)) => (history_candles(&state, canonical, interval, count).await?, "history"),
        _ => return Err(AppError::Internal(anyhow!("compute request lost its symbol"))),
    };

    let report = indicators::compute(&candles, &kinds);
    let body = json!({
        "ok": true,
        "indicators": report.indicators,
        "last": report.last,
        "candles": candles.len(),
        "canonicalSymbol": canonical,
        "interval": interval,
        "source": source,
        "cached": false,
    });
    state.compute_cache.insert(key, body.clone());
    Ok(Json(body))
}

pub async fn normalize_symbol(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<NormalizeQuery>,
) -> Result<Json<NormalizeResponse>, AppError> {
    if !provider.eq_ignore_ascii_case(PROVIDER) {
        return Err(AppError::BadRequest(format!("unsupported provider {:?}", provider)));
    }
    let input = query
        .symbol
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("symbol query parameter required".into()))?;
    let canonical = state.resolver.resolve(&input).await;
    Ok(Json(NormalizeResponse { input, canonical }))
}

pub async fn refresh_symbols(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, AppError> {
    require_secret(&state, &headers)?;
    let pairs = state
        .resolver
        .refresh()
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    log::info!("Symbol catalog refreshed on request ({} pairs)", pairs);
    Ok(Json(json!({ "ok": true, "pairs": pairs })))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let upstream = state.upstream_status();
    Json(json!({
        "ok": true,
        "upstreamConnected": upstream.connected,
        "upstreamState": upstream.state,
        "circuitOpen": upstream.circuit_open,
        "consumers": state.metrics.connected_consumers(),
        "broadcastEnabled": state.bus.has_transport(),
        "symbolsLoaded": state.resolver.pair_count(),
    }))
}

pub async fn debug_subscriptions(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, AppError> {
    require_secret(&state, &headers)?;
    Ok(Json(json!({
        "registry": state.registry.snapshot(),
        "upstream": state.upstream_status(),
        "historyCacheEntries": state.history_cache.len(),
        "computeCacheEntries": state.compute_cache.len(),
        "rateLimitedIdentities": state.rate_limiter.tracked_identities(),
    })))
}
