// =============================================================================
// Exit Steward: Main Entry Point
// =============================================================================
//
// Boots the exit engine against the in-memory paper broker (demo mode):
// config, persisted rules, ownership registry, monitor task and control API.
// Ctrl+C stops the monitor, which saves the rule set on its way out.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exit_steward::api;
use exit_steward::app_state::EngineState;
use exit_steward::exit::journal::{DecisionJournal, DecisionSink};
use exit_steward::exit::monitor::{ExitMonitor, MonitorDeps};
use exit_steward::exit::store::RuleStore;
use exit_steward::providers::http_registry::HttpOwnershipRegistry;
use exit_steward::providers::local_registry::LocalOwnershipRegistry;
use exit_steward::providers::paper::PaperBroker;
use exit_steward::providers::{
    MarketConditionProvider, MarketDataProvider, OrderGateway, OwnershipRegistry,
};
use exit_steward::runtime_config::EngineConfig;

const DEFAULT_CONFIG_PATH: &str = "exit_engine_config.json";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3002";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("exit steward starting up");

    let config_path =
        std::env::var("EXIT_ENGINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(
            path = %config_path,
            error = %format!("{e:#}"),
            "failed to load config, using defaults"
        );
        EngineConfig::default()
    });

    if let Ok(path) = std::env::var("EXIT_ENGINE_RULES_PATH") {
        config.rules_path = path;
    }
    if let Ok(url) = std::env::var("EXIT_ENGINE_REGISTRY_URL") {
        if !url.trim().is_empty() {
            config.ownership.registry_url = Some(url);
        }
    }

    // ── 2. Persisted rules ───────────────────────────────────────────────
    let store = Arc::new(RuleStore::new());
    match store.load(&config.rules_path) {
        Ok(report) => {
            if let Some(moved) = &report.quarantined {
                warn!(quarantined = %moved.display(), "rules file was corrupt, starting empty");
            }
            info!(loaded = report.loaded, skipped = report.skipped.len(), "exit rules restored");
        }
        Err(e) => error!(error = %format!("{e:#}"), "failed to load exit rules, starting empty"),
    }

    // ── 3. Collaborators ─────────────────────────────────────────────────
    let paper = Arc::new(PaperBroker::new());

    let registry: Arc<dyn OwnershipRegistry> = match &config.ownership.registry_url {
        Some(url) => {
            info!(url = %url, "using HTTP ownership registry");
            Arc::new(
                HttpOwnershipRegistry::new(url.clone(), config.external_timeout())
                    .context("ownership registry client")?,
            )
        }
        None => {
            info!("using in-process ownership registry");
            Arc::new(LocalOwnershipRegistry::new())
        }
    };

    let journal = Arc::new(DecisionJournal::new());

    let deps = MonitorDeps {
        market: Arc::clone(&paper) as Arc<dyn MarketDataProvider>,
        gateway: Arc::clone(&paper) as Arc<dyn OrderGateway>,
        registry,
        conditions: Some(Arc::clone(&paper) as Arc<dyn MarketConditionProvider>),
        journal: Arc::clone(&journal) as Arc<dyn DecisionSink>,
    };
    let monitor = Arc::new(ExitMonitor::new(config.clone(), Arc::clone(&store), deps));

    let state = Arc::new(EngineState::new(
        config,
        &monitor,
        journal,
        Some(paper),
        std::env::var("EXIT_ENGINE_ADMIN_TOKEN").ok(),
    ));
    if state.admin_token.is_none() {
        warn!(
            "EXIT_ENGINE_ADMIN_TOKEN is not set, authenticated endpoints will refuse all requests"
        );
    }

    // ── 4. Monitor task ──────────────────────────────────────────────────
    let monitor_handle = tokio::spawn(Arc::clone(&monitor).run());

    // ── 5. Control API ───────────────────────────────────────────────────
    let bind_addr =
        std::env::var("EXIT_ENGINE_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(Arc::clone(&state));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    state.control.stop();
    if let Err(e) = monitor_handle.await {
        error!(error = %e, "monitor task ended abnormally");
        if let Err(e) = state.store.save(&state.config.rules_path) {
            error!(error = %format!("{e:#}"), "failed to save exit rules on shutdown");
        }
    }

    info!("exit steward shut down complete");
    Ok(())
}
