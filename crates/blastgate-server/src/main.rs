//! blastgate server entry point.
//!
//! Loads the configuration, opens the database, restores device sessions
//! and serves the HTTP control surface until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! blastgate-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>        TOML configuration file [default: blastgate.toml]
//!   --bind <ADDR>          Override [server] bind_address
//!   --port <PORT>          Override [server] port
//!   --access-token <TOKEN> Override [server] access_token
//!   --webhook-url <URL>    Override [webhook] url
//!   --database <PATH>      Override [storage] database_path
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config() + CLI overrides
//!  └─ Database::open()
//!  └─ SessionRegistry ── Transport (in-process mock until a protocol adapter exists)
//!  └─ LifecycleManager ── StatusBridge ── WebhookNotifier | LogNotifier
//!  └─ BlastOrchestrator ── OutcomeAggregator
//!  └─ BlastTrigger        (Tokio interval task)
//!  └─ axum::serve(router) (until Ctrl+C)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use blastgate_server::application::aggregator::OutcomeAggregator;
use blastgate_server::application::lifecycle::LifecycleManager;
use blastgate_server::application::orchestrator::{BlastOrchestrator, DeviceSessions};
use blastgate_server::application::status_bridge::StatusBridge;
use blastgate_server::application::trigger::BlastTrigger;
use blastgate_server::infrastructure::http::{router, AppState};
use blastgate_server::infrastructure::notify::{LogNotifier, StatusNotifier, WebhookNotifier};
use blastgate_server::infrastructure::session::{SessionFiles, SessionRegistry};
use blastgate_server::infrastructure::storage::{load_config, AppConfig, Database};
use blastgate_server::infrastructure::transport::mock::MockTransport;

/// How long the in-process transport waits before "scanning" a pairing code.
const SIMULATED_SCAN_DELAY: Duration = Duration::from_secs(15);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Messaging device lifecycle manager and blast delivery server.
#[derive(Debug, Parser)]
#[command(name = "blastgate-server", version)]
struct Cli {
    /// TOML configuration file.  Missing file means defaults.
    #[arg(long, default_value = "blastgate.toml", env = "BLASTGATE_CONFIG")]
    config: PathBuf,

    /// IP address to bind the HTTP server to.
    #[arg(long)]
    bind: Option<String>,

    /// HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Shared secret clients pass as `access_token`.
    #[arg(long, env = "BLASTGATE_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Endpoint receiving device status notifications.
    #[arg(long, env = "BLASTGATE_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// SQLite database file.
    #[arg(long)]
    database: Option<PathBuf>,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(self, mut config: AppConfig) -> AppConfig {
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(token) = self.access_token {
            config.server.access_token = token;
        }
        if let Some(url) = self.webhook_url {
            config.webhook.url = Some(url);
        }
        if let Some(database) = self.database {
            config.storage.database_path = database;
        }
        config
    }
}

fn listen_addr(config: &AppConfig) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address: '{}:{}'",
                config.server.bind_address, config.server.port
            )
        })
}

fn notifier_for(config: &AppConfig) -> anyhow::Result<Arc<dyn StatusNotifier>> {
    match config.webhook.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => {
            let notifier =
                WebhookNotifier::new(url, Duration::from_secs(config.webhook.timeout_secs))
                    .context("could not build webhook client")?;
            info!("status notifications go to {url}");
            Ok(Arc::new(notifier))
        }
        None => {
            warn!("no webhook configured; status notifications are only logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_config = load_config(&cli.config)
        .with_context(|| format!("could not load {}", cli.config.display()))?;
    let config = cli.apply(file_config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    if config.server.access_token.trim().is_empty() {
        bail!("an access token is required ([server] access_token or --access-token)");
    }
    let addr = listen_addr(&config)?;

    // ── Storage and sessions ──────────────────────────────────────────────────
    let db = Database::open(&config.storage.database_path).with_context(|| {
        format!(
            "could not open database {}",
            config.storage.database_path.display()
        )
    })?;
    let transport = MockTransport::with_auto_pairing(Some(SIMULATED_SCAN_DELAY));
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(transport),
        SessionFiles::new(&config.storage.session_dir),
        config.reconnect.connect_timeout(),
    ));

    // ── Use cases ─────────────────────────────────────────────────────────────
    let bridge = StatusBridge::new(db.clone(), notifier_for(&config)?);
    let lifecycle = LifecycleManager::new(
        db.clone(),
        registry,
        bridge,
        config.reconnect.policy(),
    );
    let sessions: Arc<dyn DeviceSessions> = Arc::new(lifecycle.clone());
    let orchestrator = Arc::new(BlastOrchestrator::new(
        db.clone(),
        Arc::clone(&sessions),
        Arc::new(OutcomeAggregator::new(db.clone())),
        config.delivery.policy(),
    ));

    match lifecycle.restore_sessions().await {
        Ok(report) => info!("restored {} device sessions", report.restored),
        Err(e) => error!("session restore failed: {e}"),
    }

    let trigger = if config.scheduler.enabled {
        let trigger = Arc::new(BlastTrigger::new(
            db.clone(),
            sessions,
            Arc::clone(&orchestrator),
        ));
        Some(trigger.spawn(Duration::from_secs(config.scheduler.poll_interval_secs.max(1))))
    } else {
        info!("blast scheduler disabled");
        None
    };

    // ── HTTP ──────────────────────────────────────────────────────────────────
    let state = AppState::new(
        db,
        lifecycle.clone(),
        orchestrator,
        config.server.access_token.as_str(),
    )
    .with_qr_wait(Duration::from_secs(config.server.qr_wait_secs))
    .with_send_timeout(Duration::from_secs(config.delivery.send_timeout_secs))
    .with_default_delay(
        config.delivery.default_delay_min_secs,
        config.delivery.default_delay_max_secs,
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    info!("blastgate server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl+C, shutting down"),
                Err(e) => error!("failed to listen for Ctrl+C: {e}"),
            }
        })
        .await
        .context("HTTP server failed")?;

    if let Some(trigger) = trigger {
        trigger.abort();
    }
    lifecycle.shutdown().await;
    info!("blastgate server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
