use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tbg_proactive::ScheduleConfig;

#[derive(Debug, Clone)]
pub struct TelegramGatewayConfig {
    pub auth_secret: String,
    pub bot_token: String,
    pub addr: SocketAddr,
    pub sessions_dir: PathBuf,
    pub backend_base_url: String,
    pub agent_runtime_url: String,
    pub gateway_secret: String,
    pub schedules: ScheduleConfig,
}

impl TelegramGatewayConfig {
    pub fn from_env() -> Result<Self> {
        let auth_secret = require("AUTH_SECRET")?;
        let bot_token = require("TELEGRAM_BOT_TOKEN")?;
        let backend_base_url = require("TODO_APP_BASE_URL")?;
        let gateway_secret = require("GATEWAY_SECRET")?;

        let port: u16 = match std::env::var("TELEGRAM_GATEWAY_PORT") {
            Ok(raw) => raw.parse().context("invalid TELEGRAM_GATEWAY_PORT")?,
            Err(_) => 4113,
        };
        let sessions_dir = std::env::var("TELEGRAM_SESSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./telegram-sessions"));

        // The agent runtime normally lives behind the same base URL as the
        // backend; a separate deployment can override it.
        let agent_runtime_url =
            std::env::var("AGENT_RUNTIME_URL").unwrap_or_else(|_| backend_base_url.clone());

        let schedules = ScheduleConfig::from_parts(
            std::env::var("PROACTIVE_MORNING_CRON").ok(),
            std::env::var("PROACTIVE_EVENING_CRON").ok(),
            std::env::var("TZ").ok(),
        )?;

        Ok(Self {
            auth_secret,
            bot_token,
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            sessions_dir,
            backend_base_url,
            agent_runtime_url,
            gateway_secret,
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
