//! Telegram gateway: pairs chats to backend users over the Bot API, routes
//! inbound text to agents, and pushes proactive digests.
//!
//! ```text
//! Bot API long-poll -> BotRuntime -> Router -> Dispatcher -> agent runtime
//! HTTP control plane (/pair, /status, /settings) for the web app
//! Cron ticks -> SweepRunner -> per-user checks -> digests via the bot
//! ```

mod api;
mod bot;
mod commands;
mod config;
mod http;
mod proactive;
mod registry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tbg_backend::{BackendApi, Dispatcher, HttpAgentRuntime, HttpBackend};
use tbg_security::{JwtVerifier, TokenCipher};
use tbg_session::{PairingTable, TelegramMappingStore};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{BotApi, HttpBotApi};
use crate::bot::BotRuntime;
use crate::config::TelegramGatewayConfig;
use crate::http::{ApiState, build_router};
use crate::proactive::SweepRunner;
use crate::registry::MappingRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = TelegramGatewayConfig::from_env()?;

    let cipher = TokenCipher::new(config.auth_secret.clone());
    let verifier = Arc::new(JwtVerifier::new(config.auth_secret.clone())?);
    let store = TelegramMappingStore::new(&config.sessions_dir, cipher)?;
    let registry = Arc::new(MappingRegistry::load(store)?);

    let client = Client::new();
    let backend: Arc<dyn BackendApi> = Arc::new(HttpBackend::new(
        client.clone(),
        config.backend_base_url.clone(),
        config.gateway_secret.clone(),
    ));
    let dispatcher = Dispatcher::new(Arc::new(HttpAgentRuntime::new(
        client.clone(),
        config.agent_runtime_url.clone(),
    )));
    let bot_api: Arc<dyn BotApi> = Arc::new(HttpBotApi::new(
        client,
        config.bot_token.clone(),
        std::env::var("TELEGRAM_API_BASE").ok(),
    ));

    let profile = bot_api.get_me().await.context("bot token check failed")?;
    info!(bot = %profile.username, "telegram bot authenticated");

    let pairing = Arc::new(Mutex::new(PairingTable::new()));
    let bot = Arc::new(BotRuntime::new(
        Arc::clone(&bot_api),
        Arc::clone(&registry),
        Arc::clone(&pairing),
        dispatcher,
        Arc::clone(&backend),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = tokio::spawn(Arc::clone(&bot).run(shutdown_rx.clone()));

    // Proactive schedules feed ticks into their own worker.
    let (tick_tx, mut tick_rx) = mpsc::channel(2);
    let mut scheduler = tbg_proactive::start_schedules(&config.schedules, tick_tx).await?;
    let sweeper = {
        let runner = SweepRunner {
            registry: Arc::clone(&registry),
            backend,
            api: bot_api,
        };
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    tick = tick_rx.recv() => match tick {
                        Some(tick) => runner.run_sweep(tick).await,
                        None => return,
                    },
                }
            }
        })
    };

    // Minute-grained upkeep: expired conversations and pairing codes.
    let upkeep = {
        let bot = Arc::clone(&bot);
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = interval.tick() => bot.sweep_expired(time::OffsetDateTime::now_utc()),
                }
            }
        })
    };

    let router = build_router(
        ApiState {
            registry,
            pairing,
            bot_username: profile.username,
        },
        verifier,
    );
    let listener = TcpListener::bind(config.addr).await?;
    info!("telegram gateway listening on {}", config.addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    // HTTP is down; stop polling, then the scheduler, then let in-flight
    // work finish inside the grace window.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, poller).await.is_err() {
        warn!("polling loop did not stop within the grace window");
    }
    scheduler.shutdown().await.ok();
    sweeper.abort();
    upkeep.abort();
    Ok(())
}
