use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tbg_proactive::ScheduleConfig;

#[derive(Debug, Clone)]
pub struct WhatsAppGatewayConfig {
    pub auth_secret: String,
    pub addr: SocketAddr,
    pub sessions_dir: PathBuf,
    pub max_sessions: usize,
    pub backend_base_url: String,
    pub agent_runtime_url: String,
    pub gateway_secret: String,
    /// Route agent replies to the owner's self-chat instead of the
    /// originating chat.
    pub private_responses: bool,
    /// WebSocket endpoint of the bridge daemon that speaks the actual
    /// Noise-protocol client.
    pub bridge_url: String,
    pub schedules: ScheduleConfig,
}

impl WhatsAppGatewayConfig {
    pub fn from_env() -> Result<Self> {
        let auth_secret = require("AUTH_SECRET")?;
        let backend_base_url = require("TODO_APP_BASE_URL")?;
        let gateway_secret = require("GATEWAY_SECRET")?;

        let port: u16 = match std::env::var("WHATSAPP_GATEWAY_PORT") {
            Ok(raw) => raw.parse().context("invalid WHATSAPP_GATEWAY_PORT")?,
            Err(_) => 4112,
        };
        let sessions_dir = std::env::var("WHATSAPP_SESSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./whatsapp-sessions"));
        let max_sessions: usize = match std::env::var("WHATSAPP_MAX_SESSIONS") {
            Ok(raw) => raw.parse().context("invalid WHATSAPP_MAX_SESSIONS")?,
            Err(_) => 10,
        };
        let private_responses = std::env::var("WHATSAPP_PRIVATE_RESPONSES")
            .map(|v| v == "true")
            .unwrap_or(false);
        let bridge_url = std::env::var("WHATSAPP_BRIDGE_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:4180".into());

        let agent_runtime_url =
            std::env::var("AGENT_RUNTIME_URL").unwrap_or_else(|_| backend_base_url.clone());

        let schedules = ScheduleConfig::from_parts(
            std::env::var("PROACTIVE_MORNING_CRON").ok(),
            std::env::var("PROACTIVE_EVENING_CRON").ok(),
            std::env::var("TZ").ok(),
        )?;

        Ok(Self {
            auth_secret,
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            sessions_dir,
            max_sessions,
            backend_base_url,
            agent_runtime_url,
            gateway_secret,
            private_responses,
            bridge_url,
            schedules,
        })
    }
}

fn require(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{key} must be set"),
    }
}
