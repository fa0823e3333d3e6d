use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use lib_common::core::upstream_manager::ReconnectDecision;
use lib_common::markets::kraken::feed::{self, SubscriptionSpec};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage};

use crate::relay_logic::state::{AppState, UpstreamCommand};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Closed,
    Errored(String),
}

/// Owns the single upstream connection for the lifetime of the process.
pub async fn run(
    state: AppState,
    mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let url = state.settings.upstream_ws_url.clone();

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        state.with_upstream(|m| m.begin_connect());
        log::info!("Connecting to upstream feed: {}", url);

        let connected = tokio::select! {
            _ = shutdown.recv() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((ws, _)) => {
                state.with_upstream(|m| m.on_connected());
                log::info!("Connected to upstream feed");

                let end = session(&state, ws, &mut commands, &mut shutdown).await;
                state.registry.clear_channels();
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Closed => {
                        log::warn!("Upstream connection closed");
                        state.with_upstream(|m| m.on_closed());
                    }
                    SessionEnd::Errored(reason) => {
                        log::warn!("Upstream connection failed: {}", reason);
                        state.with_upstream(|m| m.on_error(reason));
                    }
                }
            }
            Err(e) => {
                log::warn!("Failed to connect to upstream feed: {}", e);
                state.with_upstream(|m| m.on_error(e.to_string()));
            }
        }

        let decision = state.with_upstream(|m| m.schedule_reconnect(Instant::now()));
        let wait = match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                state.metrics.record_reconnect();
                log::info!("Reconnect attempt {} in {:?}", attempt + 1, delay);
                delay
            }
            ReconnectDecision::CircuitOpen { cooldown } => {
                state.metrics.record_circuit_trip();
                log::warn!("Too many reconnects, circuit open for {:?}", cooldown);
                cooldown
            }
        };

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sleep(wait) => {}
        }

        if matches!(decision, ReconnectDecision::CircuitOpen { .. }) {
            state.with_upstream(|m| m.close_circuit());
            log::info!("Circuit closed, resuming reconnects");
        }
    }

    log::info!("Upstream task stopped");
}

async fn send_text(ws: &mut UpstreamSocket, frame: String) -> Result<(), String> {
    log::debug!("Sending upstream: {}", frame);
    ws.send(WsMessage::Text(frame.into())).await.map_err(|e| e.to_string())
}

/// Drives one connected session until it drops or shutdown is requested.
async fn session(
    state: &AppState,
    mut ws: UpstreamSocket,
    commands: &mut mpsc::UnboundedReceiver<UpstreamCommand>,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    // Intent is re-read from the registry, queued commands are stale.
    while commands.try_recv().is_ok() {}

    // Pair -> interval as sent upstream on this connection.
    let mut live: HashMap<String, u32> = HashMap::new();
    let active = state.registry.active_pairs();
    let frames = state.resubscribe_frames();
    log::info!("Resubscribing {} pairs", frames.len());
    for (pair, frame) in frames {
        if let Err(e) = send_text(&mut ws, frame).await {
            return SessionEnd::Errored(e);
        }
        if let Some((_, interval)) = active.iter().find(|(p, _)| *p == pair) {
            live.insert(pair, *interval);
        }
    }

    state.touch_upstream();
    let idle_timeout = state.settings.idle_timeout;
    let mut watchdog = tokio::time::interval((idle_timeout / 4).max(Duration::from_millis(10)));
    let mut pinged = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Upstream shutting down...");
                let _ = ws.close(None).await;
                return SessionEnd::Shutdown;
            }
            Some(command) = commands.recv() => {
                let frame = match command {
                    UpstreamCommand::Subscribe { pair, interval } => {
                        // Dropped again before we got here.
                        if state.registry.refcount(&pair) == 0 || live.contains_key(&pair) {
                            continue;
                        }
                        let wire = state.resolver.wire_name(&pair);
                        live.insert(pair, interval);
                        feed::subscribe_frame(&[wire], &SubscriptionSpec::ohlc(interval))
                    }
                    UpstreamCommand::Unsubscribe { pair } => {
                        // Re-acquired before we got here.
                        if state.registry.refcount(&pair) > 0 {
                            continue;
                        }
                        let interval = live.remove(&pair).unwrap_or(state.settings.default_interval);
                        let wire = state.resolver.wire_name(&pair);
                        feed::unsubscribe_frame(&[wire], &SubscriptionSpec::ohlc(interval))
                    }
                    UpstreamCommand::Rejected { pair } => {
                        live.remove(&pair);
                        continue;
                    }
                };
                if let Err(e) = send_text(&mut ws, frame).await {
                    return SessionEnd::Errored(e);
                }
            }
            message = ws.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    log::trace!("Upstream: {}", text.as_str());
                    pinged = false;
                    state.route_upstream(text.as_str());
                }
                Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        pinged = false;
                        state.route_upstream(text);
                    }
                    Err(_) => log::warn!("Ignoring non UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    state.touch_upstream();
                    if let Err(e) = ws.send(WsMessage::Pong(payload)).await {
                        return SessionEnd::Errored(e.to_string());
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Errored(e.to_string()),
            },
            _ = watchdog.tick() => {
                if state.registry.active_pairs().is_empty() {
                    continue;
                }
                let silent = state.last_upstream_frame().elapsed();
                if silent >= idle_timeout {
                    return SessionEnd::Errored(format!("no upstream frames for {:?}", silent));
                }
                if silent >= idle_timeout / 2 && !pinged {
                    pinged = true;
                    if let Err(e) = send_text(&mut ws, feed::ping_frame()).await {
                        return SessionEnd::Errored(e);
                    }
                }
            }
        }
    }
}
