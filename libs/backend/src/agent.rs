use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tbg_core::{AgentId, ChatTurn, RequestContext, Role};

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

/// One message in the list handed to the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub role: String,
    pub content: String,
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn from_turn(turn: &ChatTurn) -> Self {
        Self {
            role: match turn.role {
                Role::User => "user".into(),
                Role::Assistant => "assistant".into(),
            },
            content: turn.content.clone(),
        }
    }
}

/// The agent runtime's reply. Opaque beyond its text.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgentReply {
    pub text: String,
}

/// Opaque collaborator that turns a message list plus request context into a
/// reply. The gateway never looks inside.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn generate(
        &self,
        agent: AgentId,
        messages: &[AgentMessage],
        context: &RequestContext,
    ) -> Result<AgentReply>;
}

/// HTTP implementation against the agent runtime service.
#[derive(Clone)]
pub struct HttpAgentRuntime {
    http: Client,
    base_url: String,
}

impl HttpAgentRuntime {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    messages: &'a [AgentMessage],
    request_context: std::collections::BTreeMap<String, String>,
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn generate(
        &self,
        agent: AgentId,
        messages: &[AgentMessage],
        context: &RequestContext,
    ) -> Result<AgentReply> {
        let url = format!("{}/api/agents/{}/generate", self.base_url, agent.as_str());
        let body = GenerateRequest {
            messages,
            request_context: context.to_entries(),
        };
        let res = self
            .http
            .post(&url)
            .bearer_auth(&context.auth_token)
            .timeout(GENERATE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("agent {agent} generate request"))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("agent {agent} generate {status}: {body}"));
        }
        res.json::<AgentReply>()
            .await
            .with_context(|| format!("decode agent {agent} reply"))
    }
}
