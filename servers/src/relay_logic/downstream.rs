use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use futures_util::{Sink, SinkExt, StreamExt};
use lib_common::core::RelayMetrics;
use lib_common::core::dispatcher::RelayFrame;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use crate::relay_logic::rest;
use crate::relay_logic::state::AppState;

/// WebSocket endpoint plus the rate-limited REST surface.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/compute/indicators", post(rest::compute_indicators))
        .route("/normalize/refresh", post(rest::refresh_symbols))
        .route("/normalize/{provider}", get(rest::normalize_symbol))
        .route("/metrics", get(rest::metrics))
        .route("/health", get(rest::health))
        .route("/debug/subscriptions", get(rest::debug_subscriptions))
        .route_layer(middleware::from_fn_with_state(state.clone(), rest::rate_limit));

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.settings.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Relay gateway listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.recv().await.ok();
        log::info!("Relay gateway shutting down.");
    })
    .await
    .context("Relay gateway failed")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Single writer for one consumer: relayed frames and control replies share
/// the sink. A failed write counts the frame and everything still queued
/// behind it as forward failures.
async fn write_frames<S>(
    mut sink: S,
    mut frames: mpsc::UnboundedReceiver<RelayFrame>,
    mut replies: mpsc::UnboundedReceiver<String>,
    metrics: Arc<RelayMetrics>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let (text, relayed) = tokio::select! {
            Some(frame) = frames.recv() => (frame.to_string(), true),
            Some(reply) = replies.recv() => (reply, false),
            else => break,
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            if relayed {
                metrics.record_forward_failure();
            }
            // Later pushes now fail at the dispatcher and are counted there.
            frames.close();
            let mut stranded = 0;
            while frames.try_recv().is_ok() {
                stranded += 1;
            }
            metrics.record_delivery(0, stranded);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (consumer, frames) = state.connect_consumer();
    let (sink, mut stream) = socket.split();
    let (reply_tx, replies) = mpsc::unbounded_channel::<String>();

    let mut writer = tokio::spawn(write_frames(sink, frames, replies, Arc::clone(&state.metrics)));

    loop {
        tokio::select! {
            _ = &mut writer => {
                log::debug!("Consumer {} writer finished", consumer);
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let ack = state.handle_control(consumer, text.as_str()).await;
                    if reply_tx.send(ack.to_json()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Consumer {} socket error: {}", consumer, e);
                    break;
                }
            },
        }
    }

    state.disconnect_consumer(consumer);
    writer.abort();
}
