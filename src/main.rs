use std::sync::Arc;
use std::time::Duration;

use outflow::config::{EngineConfig, ServerConfig};
use outflow::guard::PhaseRotationGuard;
use outflow::inbound::ReplyBounceReconciler;
use outflow::inbound::classifier::RuleBasedClassifier;
use outflow::reminders::ReminderService;
use outflow::scheduler::SendScheduler;
use outflow::server;
use outflow::store::{LibSqlStore, Store};
use outflow::transport::{ImapMailboxReader, SmtpMailer};
use outflow::warmup::WarmupEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server_config = ServerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export OUTFLOW_TRIGGER_TOKEN=<shared secret for the scheduled trigger>");
        std::process::exit(1);
    });
    let engine_config = EngineConfig::from_env();

    eprintln!("📮 Outflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tick endpoint: http://0.0.0.0:{}/api/engine/tick", server_config.port);
    eprintln!(
        "   Budget: {}s (margin {}s)",
        engine_config.time_budget.as_secs(),
        engine_config.safety_margin.as_secs()
    );

    // ── Database ────────────────────────────────────────────────────
    let db_path =
        std::env::var("OUTFLOW_DB_PATH").unwrap_or_else(|_| "./data/outflow.db".to_string());

    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Engine ──────────────────────────────────────────────────────
    let transport = Arc::new(SmtpMailer::new());
    let mailbox = Arc::new(ImapMailboxReader::new());
    let classifier = Arc::new(RuleBasedClassifier::new());

    let scheduler = SendScheduler::new(store.clone(), transport.clone(), engine_config.clone());
    let warmup = WarmupEngine::new(
        store.clone(),
        transport.clone(),
        mailbox.clone(),
        engine_config.clone(),
    );
    let reconciler = ReplyBounceReconciler::new(
        store.clone(),
        mailbox,
        classifier,
        engine_config.clone(),
    );
    let reminders = ReminderService::new(store.clone(), transport.clone(), engine_config.clone());

    let guard = Arc::new(PhaseRotationGuard::new(
        store,
        transport,
        scheduler,
        warmup,
        reconciler,
        reminders,
        engine_config,
    ));

    // ── Optional internal ticker ────────────────────────────────────
    // Normally an external scheduler drives the tick endpoint; set
    // OUTFLOW_INTERNAL_TICK_SECS for self-contained deployments.
    if let Some(tick_secs) = std::env::var("OUTFLOW_INTERNAL_TICK_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    {
        let guard = guard.clone();
        eprintln!("   Internal ticker: every {tick_secs}s");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(tick_secs));
            loop {
                tick.tick().await;
                match guard.tick().await {
                    Ok(report) => tracing::info!(?report, "Internal tick finished"),
                    Err(e) => tracing::error!("Internal tick failed: {e}"),
                }
            }
        });
    }

    // ── Trigger server ──────────────────────────────────────────────
    let app = server::router(guard, &server_config);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server_config.port)).await?;
    tracing::info!(port = server_config.port, "Trigger server started");
    axum::serve(listener, app).await?;

    Ok(())
}
