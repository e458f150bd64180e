//! WhatsApp gateway: one bridge socket per user session, owner-only command
//! routing, and the login/QR control plane.
//!
//! ```text
//! bridge socket events -> session worker -> filters -> Router -> Dispatcher
//! HTTP control plane (/login, /sessions) for the web app
//! Morning cron -> BriefingRunner -> self-chat briefings
//! ```

mod briefing;
mod config;
mod http;
mod inbound;
mod outbound;
mod session;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tbg_backend::{BackendApi, Dispatcher, HttpAgentRuntime, HttpBackend};
use tbg_proactive::Tick;
use tbg_security::{JwtVerifier, TokenCipher};
use tbg_session::WhatsAppSessionStore;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::briefing::BriefingRunner;
use crate::config::WhatsAppGatewayConfig;
use crate::http::{ApiState, build_router};
use crate::session::SessionManager;
use crate::transport::BridgeTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = WhatsAppGatewayConfig::from_env()?;

    let cipher = TokenCipher::new(config.auth_secret.clone());
    let verifier = Arc::new(JwtVerifier::new(config.auth_secret.clone())?);
    let store = WhatsAppSessionStore::new(&config.sessions_dir, cipher)?;

    let client = Client::new();
    let backend: Arc<dyn BackendApi> = Arc::new(HttpBackend::new(
        client.clone(),
        config.backend_base_url.clone(),
        config.gateway_secret.clone(),
    ));
    let dispatcher = Dispatcher::new(Arc::new(HttpAgentRuntime::new(
        client,
        config.agent_runtime_url.clone(),
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = SessionManager::new(
        store,
        Arc::new(BridgeTransport::new(config.bridge_url.clone())),
        dispatcher,
        backend,
        config.max_sessions,
        config.private_responses,
        shutdown_rx.clone(),
    );
    manager.start_from_store().await?;

    // Minute-grained upkeep: expired conversations across sessions.
    let upkeep = {
        let manager = Arc::clone(&manager);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = interval.tick() => {
                        manager.sweep_conversations(time::OffsetDateTime::now_utc());
                    }
                }
            }
        })
    };

    // Morning cron drives the briefing sweep; the evening schedule belongs
    // to the Telegram digests and is ignored here.
    let (tick_tx, mut tick_rx) = mpsc::channel(2);
    let mut scheduler = tbg_proactive::start_schedules(&config.schedules, tick_tx).await?;
    let sweeper = {
        let runner = BriefingRunner {
            manager: Arc::clone(&manager),
        };
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    tick = tick_rx.recv() => match tick {
                        Some(Tick::Morning) => runner.run_morning().await,
                        Some(Tick::Evening) => {}
                        None => return,
                    },
                }
            }
        })
    };

    let router = build_router(
        ApiState {
            manager: Arc::clone(&manager),
        },
        verifier,
    );
    let listener = TcpListener::bind(config.addr).await?;
    info!("whatsapp gateway listening on {}", config.addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    // Workers finish the event they are on (in-flight agent calls included)
    // inside the grace window, then sockets are gone.
    manager.shutdown_all(Duration::from_secs(10)).await;
    scheduler.shutdown().await.ok();
    sweeper.abort();
    upkeep.abort();
    Ok(())
}
