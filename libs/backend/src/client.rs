use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Header carrying the shared secret for privileged gateway endpoints.
pub const GATEWAY_SECRET_HEADER: &str = "X-Gateway-Secret";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A freshly rotated bearer token.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Project summary consumed by the staleness check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: String,
    /// RFC 3339 timestamp of the last recorded update.
    #[serde(default)]
    pub last_update: Option<String>,
}

/// One overdue action as aggregated by the morning-briefing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MorningBriefing {
    #[serde(default)]
    pub overdue_actions: Vec<ActionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub days_remaining: i64,
    /// Completion percentage, 0..=100.
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RiskSignal {
    pub severity: String,
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RiskSignal {
    pub fn is_high_or_critical(&self) -> bool {
        matches!(
            self.severity.to_ascii_lowercase().as_str(),
            "high" | "critical"
        )
    }
}

/// Contract for the todo-app backend. Kept as a trait so the proactive
/// checks and the dispatcher can run against mocks.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Rotates the token bound to a WhatsApp session. 401/4xx means the
    /// session is unrecoverable and needs re-pairing.
    async fn refresh_whatsapp_token(&self, session_id: &str) -> Result<RefreshedToken>;

    /// Rotates the token bound to a Telegram pairing.
    async fn refresh_telegram_token(&self, user_id: &str) -> Result<RefreshedToken>;

    async fn list_projects(&self, token: &str) -> Result<Vec<Project>>;
    async fn morning_briefing(&self, token: &str) -> Result<MorningBriefing>;
    async fn list_goals(&self, token: &str) -> Result<Vec<Goal>>;
    async fn active_sprint(&self, token: &str) -> Result<Option<Sprint>>;
    async fn sprint_risks(&self, token: &str, sprint_id: &str) -> Result<Vec<RiskSignal>>;
}

/// HTTP implementation against `TODO_APP_BASE_URL`.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: String,
    gateway_secret: String,
}

impl HttpBackend {
    pub fn new(http: Client, base_url: impl Into<String>, gateway_secret: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            gateway_secret: gateway_secret.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fixed retry ladder for transient failures; auth failures and client
    /// errors surface immediately.
    async fn with_retry<F, Fut, T>(mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let delays = [Duration::from_millis(250), Duration::from_secs(1)];
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < delays.len() && is_transient(&err) => {
                    sleep(delays[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let url = self.url(path);
        Self::with_retry(|| async {
            let res = self
                .http
                .get(&url)
                .bearer_auth(token)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .with_context(|| format!("backend GET {path}"))?;
            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(anyhow!("backend GET {path} {status}: {body}"));
            }
            res.json::<T>()
                .await
                .with_context(|| format!("decode backend GET {path}"))
        })
        .await
    }

    async fn refresh(&self, path: &str, body: serde_json::Value) -> Result<RefreshedToken> {
        let url = self.url(path);
        let res = self
            .http
            .post(&url)
            .header(GATEWAY_SECRET_HEADER, &self.gateway_secret)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("backend POST {path}"))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("token refresh {path} {status}: {body}"));
        }
        res.json::<RefreshedToken>()
            .await
            .context("decode refreshed token")
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<reqwest::Error>() {
        Some(req) => req.is_timeout() || req.is_connect(),
        None => {
            let text = err.to_string();
            text.contains(" 502") || text.contains(" 503") || text.contains(" 504")
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn refresh_whatsapp_token(&self, session_id: &str) -> Result<RefreshedToken> {
        self.refresh(
            "/api/whatsapp-gateway/refresh-token",
            serde_json::json!({ "sessionId": session_id }),
        )
        .await
    }

    async fn refresh_telegram_token(&self, user_id: &str) -> Result<RefreshedToken> {
        self.refresh(
            "/api/telegram-gateway/refresh-token",
            serde_json::json!({ "userId": user_id }),
        )
        .await
    }

    async fn list_projects(&self, token: &str) -> Result<Vec<Project>> {
        self.get_json("/api/projects", token).await
    }

    async fn morning_briefing(&self, token: &str) -> Result<MorningBriefing> {
        self.get_json("/api/briefing/morning", token).await
    }

    async fn list_goals(&self, token: &str) -> Result<Vec<Goal>> {
        self.get_json("/api/goals", token).await
    }

    async fn active_sprint(&self, token: &str) -> Result<Option<Sprint>> {
        self.get_json("/api/sprints/active", token).await
    }

    async fn sprint_risks(&self, token: &str, sprint_id: &str) -> Result<Vec<RiskSignal>> {
        self.get_json(&format!("/api/sprints/{sprint_id}/risks"), token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_severity_filter_is_case_insensitive() {
        let high = RiskSignal {
            severity: "HIGH".into(),
            title: "velocity drop".into(),
            detail: None,
        };
        let medium = RiskSignal {
            severity: "medium".into(),
            title: "scope creep".into(),
            detail: None,
        };
        assert!(high.is_high_or_critical());
        assert!(!medium.is_high_or_critical());
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let backend = HttpBackend::new(Client::new(), "https://todo.example/", "secret");
        assert_eq!(
            backend.url("/api/projects"),
            "https://todo.example/api/projects"
        );
    }

    #[test]
    fn refreshed_token_decodes_camel_case() {
        let parsed: RefreshedToken =
            serde_json::from_str(r#"{"token":"NEW","expiresAt":"2026-04-01T00:00:00Z"}"#).unwrap();
        assert_eq!(parsed.token, "NEW");
        assert_eq!(parsed.expires_at.as_deref(), Some("2026-04-01T00:00:00Z"));
    }
}
