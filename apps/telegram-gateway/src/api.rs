use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BotProfile {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TgUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub edited_message: Option<TgMessage>,
}

impl TgUpdate {
    /// Prefers the fresh message over an edit of an older one.
    pub fn message(&self) -> Option<&TgMessage> {
        self.message.as_ref().or(self.edited_message.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
    pub chat: TgChat,
    #[serde(default)]
    pub from: Option<TgUser>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TgReplyRef>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TgReplyRef {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(default)]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Bot API surface the gateway depends on. Trait-shaped so the poller and
/// the proactive sweep run against mocks in tests.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_me(&self) -> Result<BotProfile>;

    /// Clears a leftover webhook and optionally the pending update backlog.
    /// Called once at startup before long-polling begins.
    async fn drain_pending(&self) -> Result<()>;

    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<TgUpdate>>;

    /// Sends a message; returns the transport-assigned message id.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64>;

    async fn send_typing(&self, chat_id: i64) -> Result<()>;
}

/// Production implementation over `api.telegram.org`.
#[derive(Clone)]
pub struct HttpBotApi {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl HttpBotApi {
    pub fn new(client: Client, bot_token: impl Into<String>, api_base: Option<String>) -> Self {
        let api_base = api_base.unwrap_or_else(|| "https://api.telegram.org".into());
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Short fixed retry ladder for the non-polling calls.
    async fn with_retry<F, Fut, T>(mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let delays = [
            Duration::from_millis(250),
            Duration::from_secs(1),
            Duration::from_secs(4),
        ];
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(_err) if attempt < delays.len() => {
                    sleep(delays[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let res = self
            .client
            .post(self.url(method))
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("telegram {method} request"))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("telegram {method} {status}: {body}"));
        }
        let body: TelegramResponse<T> = res
            .json()
            .await
            .with_context(|| format!("decode telegram {method} response"))?;
        if body.ok {
            body.result
                .ok_or_else(|| anyhow!("telegram {method} returned no result"))
        } else {
            Err(anyhow!(
                "telegram {method} failed: {}",
                body.description.unwrap_or_else(|| "unknown error".into())
            ))
        }
    }
}

#[async_trait]
impl BotApi for HttpBotApi {
    async fn get_me(&self) -> Result<BotProfile> {
        Self::with_retry(|| async {
            self.call("getMe", serde_json::json!({}), Duration::from_secs(5))
                .await
        })
        .await
    }

    async fn drain_pending(&self) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "deleteWebhook",
                serde_json::json!({ "drop_pending_updates": true }),
                Duration::from_secs(5),
            )
            .await?;
        Ok(())
    }

    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<TgUpdate>> {
        self.call(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "edited_message"],
            }),
            Duration::from_secs(timeout_secs + 10),
        )
        .await
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        let message: TgMessage = Self::with_retry(|| async {
            self.call(
                "sendMessage",
                serde_json::json!({ "chat_id": chat_id, "text": text }),
                Duration::from_secs(10),
            )
            .await
        })
        .await?;
        Ok(message.message_id)
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
                Duration::from_secs(5),
            )
            .await?;
        Ok(())
    }
}
