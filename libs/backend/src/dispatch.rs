//! The dispatch pipeline: formatting directive, bounded history, one agent
//! call, and a single transparent token refresh on auth failure.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tbg_core::{AgentId, ChatTurn, GatewayError, Platform, RequestContext};
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentMessage, AgentRuntime};

/// WhatsApp renders a limited markdown dialect.
const WHATSAPP_DIRECTIVE: &str = "You are replying inside WhatsApp. Use plain text with *bold* and \
_italic_ only, no headings, no tables, no code fences. Keep paragraphs short and skimmable on a \
phone screen.";

/// Telegram clients render standard Markdown.
const TELEGRAM_DIRECTIVE: &str = "You are replying inside Telegram. Use standard Markdown: **bold**, \
_italic_, `code`, and bulleted lists are fine, but avoid tables and headings. Keep paragraphs \
short and skimmable on a phone screen.";

/// The formatting system directive prepended to every message list.
pub fn formatting_directive(platform: Platform) -> &'static str {
    match platform {
        Platform::WhatsApp => WHATSAPP_DIRECTIVE,
        Platform::Telegram => TELEGRAM_DIRECTIVE,
    }
}

/// Shown to the user when a dispatch fails past recovery.
pub const DISPATCH_APOLOGY: &str = "Sorry, something went wrong — please try again.";

/// Per-session handle the dispatcher uses to rotate tokens. Implementations
/// refresh against the backend and persist the re-encrypted token before
/// returning.
#[async_trait]
pub trait AuthHandle: Send + Sync {
    async fn refresh_token(&self) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The single allowed refresh attempt failed, or the retried call failed
    /// again; the user must re-authenticate.
    #[error("agent call unauthorized after refresh: {0}")]
    AuthExhausted(String),

    /// Non-auth agent failure; not retried.
    #[error("agent call failed: {0}")]
    Agent(String),
}

impl DispatchError {
    /// The single short user-visible message for any unrecoverable dispatch
    /// fault.
    pub fn user_message(&self) -> &'static str {
        DISPATCH_APOLOGY
    }
}

/// Everything needed to invoke one agent once.
pub struct DispatchRequest<'a> {
    pub platform: Platform,
    pub agent: AgentId,
    /// Bounded history, already ending with the current user turn.
    pub history: &'a [ChatTurn],
    pub context: RequestContext,
}

/// Stateless dispatcher over a shared agent runtime.
#[derive(Clone)]
pub struct Dispatcher {
    runtime: Arc<dyn AgentRuntime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// Builds the message list and calls the runtime. An auth-flavored error
    /// triggers exactly one token refresh through `auth` and one retry of the
    /// identical call; everything else surfaces immediately.
    pub async fn dispatch(
        &self,
        request: DispatchRequest<'_>,
        auth: &dyn AuthHandle,
    ) -> Result<String, DispatchError> {
        let mut messages =
            Vec::with_capacity(request.history.len() + 1);
        messages.push(AgentMessage::system(formatting_directive(request.platform)));
        messages.extend(request.history.iter().map(AgentMessage::from_turn));

        let mut context = request.context;
        match self
            .runtime
            .generate(request.agent, &messages, &context)
            .await
        {
            Ok(reply) => Ok(reply.text),
            Err(err) if GatewayError::is_auth_failure(&err.to_string()) => {
                info!(
                    agent = %request.agent,
                    user_id = %context.user_id,
                    "agent call unauthorized; attempting token refresh"
                );
                let token = auth.refresh_token().await.map_err(|refresh_err| {
                    warn!(
                        agent = %request.agent,
                        user_id = %context.user_id,
                        error = %refresh_err,
                        "token refresh failed"
                    );
                    DispatchError::AuthExhausted(refresh_err.to_string())
                })?;
                context.auth_token = token;
                self.runtime
                    .generate(request.agent, &messages, &context)
                    .await
                    .map(|reply| reply.text)
                    .map_err(|err| {
                        warn!(
                            agent = %request.agent,
                            user_id = %context.user_id,
                            error = %err,
                            "agent call failed after refresh"
                        );
                        DispatchError::AuthExhausted(err.to_string())
                    })
            }
            Err(err) => {
                warn!(
                    agent = %request.agent,
                    user_id = %context.user_id,
                    error = %err,
                    "agent call failed"
                );
                Err(DispatchError::Agent(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tbg_core::TransportKey;

    use crate::agent::AgentReply;

    struct ScriptedRuntime {
        calls: AtomicUsize,
        seen_tokens: Mutex<Vec<String>>,
        /// Error message for the first call; None means succeed immediately.
        first_error: Option<String>,
        fail_always: bool,
    }

    impl ScriptedRuntime {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen_tokens: Mutex::new(Vec::new()),
                first_error: None,
                fail_always: false,
            }
        }

        fn failing_once(message: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen_tokens: Mutex::new(Vec::new()),
                first_error: Some(message.into()),
                fail_always: false,
            }
        }

        fn failing_always(message: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen_tokens: Mutex::new(Vec::new()),
                first_error: Some(message.into()),
                fail_always: true,
            }
        }
    }

    #[async_trait]
    impl AgentRuntime for ScriptedRuntime {
        async fn generate(
            &self,
            _agent: AgentId,
            messages: &[AgentMessage],
            context: &RequestContext,
        ) -> Result<AgentReply> {
            assert_eq!(messages[0].role, "system");
            self.seen_tokens
                .lock()
                .unwrap()
                .push(context.auth_token.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.first_error {
                Some(message) if call == 0 || self.fail_always => Err(anyhow!("{message}")),
                _ => Ok(AgentReply {
                    text: "the reply".into(),
                }),
            }
        }
    }

    struct StaticAuth {
        refreshed: AtomicUsize,
        fail: bool,
    }

    impl StaticAuth {
        fn new() -> Self {
            Self {
                refreshed: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                refreshed: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl AuthHandle for StaticAuth {
        async fn refresh_token(&self) -> Result<String> {
            self.refreshed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("refresh endpoint returned 401"))
            } else {
                Ok("NEW".into())
            }
        }
    }

    fn request(history: &[ChatTurn]) -> DispatchRequest<'_> {
        DispatchRequest {
            platform: Platform::Telegram,
            agent: AgentId::Zoe,
            history,
            context: RequestContext {
                auth_token: "OLD".into(),
                user_id: "u1".into(),
                transport: TransportKey::Telegram {
                    telegram_chat_id: 555,
                },
                workspace_id: None,
            },
        }
    }

    #[tokio::test]
    async fn happy_path_returns_reply() {
        let runtime = Arc::new(ScriptedRuntime::succeeding());
        let dispatcher = Dispatcher::new(runtime.clone());
        let history = vec![ChatTurn::user("hello")];
        let text = dispatcher
            .dispatch(request(&history), &StaticAuth::new())
            .await
            .expect("reply");
        assert_eq!(text, "the reply");
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_error_refreshes_once_and_retries_with_new_token() {
        let runtime = Arc::new(ScriptedRuntime::failing_once("agent runtime said 401"));
        let dispatcher = Dispatcher::new(runtime.clone());
        let auth = StaticAuth::new();
        let history = vec![ChatTurn::user("hello")];
        let text = dispatcher
            .dispatch(request(&history), &auth)
            .await
            .expect("reply");
        assert_eq!(text, "the reply");
        assert_eq!(auth.refreshed.load(Ordering::SeqCst), 1);
        let tokens = runtime.seen_tokens.lock().unwrap().clone();
        assert_eq!(tokens, vec!["OLD".to_string(), "NEW".to_string()]);
    }

    #[tokio::test]
    async fn second_auth_failure_surfaces_apology() {
        let runtime = Arc::new(ScriptedRuntime::failing_always("Unauthorized"));
        let dispatcher = Dispatcher::new(runtime.clone());
        let auth = StaticAuth::new();
        let history = vec![ChatTurn::user("hello")];
        let err = dispatcher
            .dispatch(request(&history), &auth)
            .await
            .expect_err("should fail");
        assert!(matches!(err, DispatchError::AuthExhausted(_)));
        assert_eq!(err.user_message(), DISPATCH_APOLOGY);
        assert_eq!(auth.refreshed.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_auth_error_is_not_retried() {
        let runtime = Arc::new(ScriptedRuntime::failing_always("upstream exploded"));
        let dispatcher = Dispatcher::new(runtime.clone());
        let auth = StaticAuth::new();
        let history = vec![ChatTurn::user("hello")];
        let err = dispatcher
            .dispatch(request(&history), &auth)
            .await
            .expect_err("should fail");
        assert!(matches!(err, DispatchError::Agent(_)));
        assert_eq!(auth.refreshed.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_stops_after_one_attempt() {
        let runtime = Arc::new(ScriptedRuntime::failing_once("401 from runtime"));
        let dispatcher = Dispatcher::new(runtime.clone());
        let auth = StaticAuth::failing();
        let history = vec![ChatTurn::user("hello")];
        let err = dispatcher
            .dispatch(request(&history), &auth)
            .await
            .expect_err("should fail");
        assert!(matches!(err, DispatchError::AuthExhausted(_)));
        // The runtime was not retried with a stale token.
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn directives_differ_only_in_markdown_flavor() {
        let wa = formatting_directive(Platform::WhatsApp);
        let tg = formatting_directive(Platform::Telegram);
        assert_ne!(wa, tg);
        assert!(wa.contains("WhatsApp"));
        assert!(tg.contains("Telegram"));
    }
}
