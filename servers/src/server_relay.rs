use std::sync::Arc;

use anyhow::Result;
use lib_common::connections::RedisTransport;
use lib_common::core::EventBus;
use lib_common::markets::kraken::{HistoryClient, KrakenCatalogSource, PROVIDER, SymbolResolver};
use lib_common::retrieve::ApiClient;
use tokio::signal;

mod relay_logic;
use relay_logic::{config, downstream, logger, state, upstream};

const BUS_CAPACITY: usize = 1024;

async fn build_bus(settings: &config::Settings) -> Arc<EventBus> {
    let bus = EventBus::new(PROVIDER, BUS_CAPACITY);
    let Some(url) = settings.broadcast_url.as_deref() else {
        log::info!("No broadcast URL configured, running single-process");
        return Arc::new(bus);
    };

    match RedisTransport::connect(url, settings.broadcast_channel.clone()).await {
        Ok(transport) => {
            log::info!("Cross-process broadcast on channel {}", transport.channel());
            let bus = Arc::new(bus.with_transport(Arc::new(transport)));
            if let Err(e) = bus.attach_remote().await {
                log::warn!("Could not subscribe to cross-process events: {}", e);
            }
            bus
        }
        Err(e) => {
            log::warn!("Broadcast transport unavailable, running single-process: {}", e);
            Arc::new(bus)
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => log::info!("Ctrl-C received, initiating shutdown."),
                    _ = term.recv() => log::info!("SIGTERM received, initiating shutdown."),
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = signal::ctrl_c().await;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = dotenvy::dotenv();

    let settings = config::load_config().resolve()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Starting server_relay on port {}", settings.port);

    let api = ApiClient::new(&settings.rest_api_url)?;
    let resolver = Arc::new(
        SymbolResolver::new(
            Arc::new(KrakenCatalogSource::new(api.clone())),
            settings.symbol_cache_path.clone(),
        )
        .with_fetch_timeout(settings.catalog_timeout),
    );
    let history = Arc::new(HistoryClient::new(api, settings.history_timeout));
    let bus = build_bus(&settings).await;

    let (app_state, commands) = state::AppState::new(settings, Arc::clone(&resolver), history, bus);

    // Warm the catalog in the background; resolution degrades to heuristics
    // until it lands.
    let warmup = Arc::clone(&resolver);
    tokio::spawn(async move {
        match warmup.ensure_loaded().await {
            Ok(()) => log::info!("Symbol catalog ready ({} pairs)", warmup.pair_count()),
            Err(e) => log::warn!("Symbol catalog not loaded yet: {}", e),
        }
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let forwarder_handle = app_state.spawn_normalized_forwarder(shutdown_tx.subscribe());
    let upstream_handle = tokio::spawn(upstream::run(
        app_state.clone(),
        commands,
        shutdown_tx.subscribe(),
    ));
    let mut downstream_handle = tokio::spawn(downstream::run(app_state.clone(), shutdown_tx.subscribe()));

    tokio::select! {
        _ = wait_for_signal() => {}
        result = &mut downstream_handle => {
            match result {
                Ok(Ok(())) => log::warn!("Relay gateway stopped unexpectedly"),
                Ok(Err(e)) => log::error!("Relay gateway failed: {:#}", e),
                Err(e) => log::error!("Relay gateway task panicked: {}", e),
            }
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    if !downstream_handle.is_finished() {
        if let Ok(Err(e)) = downstream_handle.await {
            log::error!("Relay gateway failed during shutdown: {:#}", e);
        }
    }
    let _ = tokio::join!(upstream_handle, forwarder_handle);

    log::info!("Shutdown complete.");
    Ok(())
}
