// HTTP Breakout Proxy - forward proxy with live capture inspection
//
// One listener serves two roles: forward-proxy traffic (plain or CONNECT,
// optionally TLS-intercepted with a locally minted CA) and the control
// plane (REST + SSE) that inspects what went through.
//
// Architecture:
// - Dispatcher (hyper + axum): routes CONNECT / absolute-form / control traffic
// - MITM engine: terminates client TLS with minted leaves, re-dials origins
// - Capture engine: records every proxied exchange into the bounded store
// - Event broker: fans capture mutations out to SSE subscribers
// - Persistence: periodic + shutdown JSON snapshots
// - Analysis sink: normalized observations feeding small aggregators

mod analysis;
mod api;
mod broker;
mod ca;
mod capture;
mod cli;
mod config;
mod filter;
mod proxy;
mod rules;
mod search;
mod storage;
mod store;

use analysis::AnalysisSink;
use anyhow::{Context, Result};
use broker::EventBroker;
use ca::CertificateAuthority;
use clap::Parser;
use config::Config;
use rules::ColorRuleStore;
use search::SearchHistoryStore;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use store::CaptureStore;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = Config::resolve(&cli)?;

    // Precedence: RUST_LOG env var > --verbose flag > default "info"
    let default_filter = if config.verbose {
        "breakout_proxy=debug"
    } else {
        "breakout_proxy=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("breakout-proxy {} starting", config::VERSION);
    ca::init_crypto();

    // CA initialization failures are fatal: without usable root material
    // the MITM half of the proxy cannot exist
    let ca = Arc::new(if config.mitm {
        CertificateAuthority::load_or_create(&config.ca_dir)
            .context("CA initialization failed")?
    } else {
        CertificateAuthority::ephemeral().context("CA initialization failed")?
    });

    // Shared state, dependency-injected everywhere; no globals
    let store = Arc::new(CaptureStore::new(config.capacity));
    let broker = Arc::new(EventBroker::new());
    let rules = Arc::new(ColorRuleStore::new());
    let searches = Arc::new(SearchHistoryStore::new());
    let sink = Arc::new(AnalysisSink::with_defaults());
    let paused = Arc::new(AtomicBool::new(false));

    // Seed from the snapshot; the in-memory state is authoritative from
    // here on, so load failures only cost history
    if let Some(path) = &config.persist_path {
        match storage::load_snapshot(path) {
            Ok(snapshot) => {
                if !snapshot.captures.is_empty() {
                    tracing::info!(
                        "Loaded {} captures from {}",
                        snapshot.captures.len(),
                        path.display()
                    );
                }
                sink.replay(&snapshot.captures);
                store.populate(snapshot.captures);
                if snapshot.color_rules.is_empty() {
                    rules.replace(ColorRuleStore::with_defaults().get_all());
                } else {
                    rules.replace(snapshot.color_rules);
                }
                searches.populate(snapshot.search_history);
            }
            Err(e) => {
                tracing::error!("Failed to load snapshot: {:#}", e);
                rules.replace(ColorRuleStore::with_defaults().get_all());
            }
        }
    } else {
        rules.replace(ColorRuleStore::with_defaults().get_all());
    }

    let engine = Arc::new(proxy::engine::ProxyEngine::new(
        store.clone(),
        broker.clone(),
        sink.clone(),
        config.max_body,
        paused.clone(),
    ));

    let app_state = api::AppState {
        store: store.clone(),
        broker: broker.clone(),
        rules: rules.clone(),
        searches: searches.clone(),
        sink: sink.clone(),
        paused,
    };
    let proxy_state = proxy::ProxyState {
        engine,
        ca,
        mitm_enabled: config.mitm,
    };

    // Bind failures are fatal and produce a non-zero exit
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    tracing::info!(
        "Listening on {} (MITM {})",
        config.listen_addr,
        if config.mitm { "on" } else { "off" }
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Autosave loop; also owns the final shutdown snapshot
    let autosave_handle = config.persist_path.clone().map(|path| {
        let handles = storage::PersistenceHandles {
            store: store.clone(),
            rules: rules.clone(),
            searches: searches.clone(),
        };
        tokio::spawn(storage::run_autosave(
            path,
            handles,
            std::time::Duration::from_secs(config.autosave_secs),
            shutdown_rx.clone(),
        ))
    });

    let server_handle = tokio::spawn(proxy::serve(
        listener,
        proxy_state,
        api::router(app_state),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    // Flipping the signal stops the accept loop and triggers exactly one
    // final snapshot before the autosave task exits
    let _ = shutdown_tx.send(true);
    if let Some(handle) = autosave_handle {
        let _ = handle.await;
    }
    match server_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("Server task panicked: {}", e),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
