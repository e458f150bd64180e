//! Long-polling loop and inbound message handling.
//!
//! One task owns the loop, so updates are processed strictly in arrival
//! order and the conversation table needs no cross-task coordination beyond
//! its mutex.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tbg_backend::{AuthHandle, BackendApi, DispatchRequest, Dispatcher};
use tbg_core::{
    AgentId, ConversationTable, Platform, ReconnectPolicy, RequestContext, RouteInput,
    TransportKey, chunk_text, resolve,
};
use tbg_session::{MappingRecord, PairingTable};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::api::{BotApi, TgMessage};
use crate::commands::{self, Command, parse_command};
use crate::registry::{MappingEntry, MappingRegistry};

const POLL_TIMEOUT_SECS: u64 = 30;
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Refreshes one mapping's token against the backend and writes it through
/// the registry so the rotation is persisted before the retry runs.
struct MappingAuth {
    backend: Arc<dyn BackendApi>,
    registry: Arc<MappingRegistry>,
    chat_id: i64,
    user_id: String,
}

#[async_trait]
impl AuthHandle for MappingAuth {
    async fn refresh_token(&self) -> Result<String> {
        let refreshed = self.backend.refresh_telegram_token(&self.user_id).await?;
        self.registry.install_token(self.chat_id, &refreshed.token)?;
        Ok(refreshed.token)
    }
}

pub struct BotRuntime {
    pub api: Arc<dyn BotApi>,
    pub registry: Arc<MappingRegistry>,
    pub pairing: Arc<Mutex<PairingTable>>,
    pub dispatcher: Dispatcher,
    pub backend: Arc<dyn BackendApi>,
    convos: Mutex<ConversationTable>,
}

impl BotRuntime {
    pub fn new(
        api: Arc<dyn BotApi>,
        registry: Arc<MappingRegistry>,
        pairing: Arc<Mutex<PairingTable>>,
        dispatcher: Dispatcher,
        backend: Arc<dyn BackendApi>,
    ) -> Self {
        Self {
            api,
            registry,
            pairing,
            dispatcher,
            backend,
            convos: Mutex::new(ConversationTable::new()),
        }
    }

    /// Runs until shutdown is signalled or the bot token turns out fatal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.api.drain_pending().await {
            warn!(error = %err, "could not drain pending updates; continuing");
        }

        let policy = ReconnectPolicy::default();
        let mut offset: i64 = 0;
        let mut attempt: u32 = 0;

        loop {
            let updates = tokio::select! {
                _ = shutdown.changed() => {
                    info!("telegram polling stopped");
                    return;
                }
                result = self.api.get_updates(offset, POLL_TIMEOUT_SECS) => result,
            };

            match updates {
                Ok(updates) => {
                    attempt = 0;
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(update.message()).await;
                    }
                }
                Err(err) => {
                    let text = err.to_string();
                    if text.contains("401") || text.to_ascii_lowercase().contains("unauthorized") {
                        error!(error = %err, "telegram bot token rejected; polling halted");
                        return;
                    }
                    attempt += 1;
                    let delay = match policy.delay(attempt) {
                        Some(delay) => delay,
                        None => {
                            // Out of attempts: keep limping along at the cap
                            // rather than going dark.
                            attempt = policy.max_attempts();
                            policy.delay(attempt).unwrap_or(Duration::from_secs(30))
                        }
                    };
                    warn!(error = %err, attempt, "telegram polling failed; backing off");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn handle_update(&self, message: Option<&TgMessage>) {
        let Some(message) = message else { return };
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat_id = message.chat.id;

        match parse_command(text) {
            Some(command) => self.handle_command(command, message).await,
            None => {
                // Plain text requires an existing pairing.
                let Some(mapping) = self.registry.get_by_chat(chat_id) else {
                    return;
                };
                self.handle_text(message, text, mapping).await;
            }
        }
    }

    async fn handle_command(&self, command: Command<'_>, message: &TgMessage) {
        let chat_id = message.chat.id;
        match command {
            Command::Start(code) => {
                let claimed = code.and_then(|code| {
                    self.pairing
                        .lock()
                        .unwrap()
                        .claim(code, OffsetDateTime::now_utc())
                });
                match claimed {
                    Some(pending) => {
                        let username = message
                            .from
                            .as_ref()
                            .and_then(|u| u.username.clone());
                        let now = OffsetDateTime::now_utc();
                        let record = MappingRecord {
                            telegram_chat_id: chat_id,
                            telegram_username: username,
                            user_id: pending.user_id.clone(),
                            encrypted_auth_token: None,
                            agent_id: pending.agent_id,
                            workspace_id: pending.workspace_id.clone(),
                            paired_at: now,
                            last_active: now,
                        };
                        match self.registry.pair(record, pending.auth_token.clone()) {
                            Ok(()) => {
                                info!(user_id = %pending.user_id, chat_id, "telegram chat paired");
                                self.reply(chat_id, &commands::welcome_message(pending.agent_id))
                                    .await;
                            }
                            Err(err) => {
                                error!(
                                    user_id = %pending.user_id,
                                    chat_id,
                                    error = %err,
                                    "failed to persist pairing"
                                );
                                self.reply(chat_id, commands::INVALID_CODE).await;
                            }
                        }
                    }
                    None => self.reply(chat_id, commands::INVALID_CODE).await,
                }
            }
            Command::Disconnect => {
                let unpaired = self
                    .registry
                    .get_by_chat(chat_id)
                    .map(|entry| entry.record.user_id);
                match unpaired {
                    Some(user_id) => match self.registry.unpair_by_user(&user_id) {
                        Ok(true) => {
                            self.convos
                                .lock()
                                .unwrap()
                                .drop_conversation(&chat_id.to_string());
                            self.reply(chat_id, commands::DISCONNECTED).await;
                        }
                        _ => self.reply(chat_id, commands::NOT_PAIRED).await,
                    },
                    None => self.reply(chat_id, commands::NOT_PAIRED).await,
                }
            }
            Command::Agent(name) => {
                let Some(mapping) = self.registry.get_by_chat(chat_id) else {
                    self.reply(chat_id, commands::NOT_PAIRED).await;
                    return;
                };
                match name.map(AgentId::from_alias) {
                    Some(Some(agent)) => {
                        if self
                            .registry
                            .set_agent(&mapping.record.user_id, agent)
                            .unwrap_or(false)
                        {
                            self.reply(chat_id, &commands::agent_changed_message(agent))
                                .await;
                        }
                    }
                    Some(None) => {
                        self.reply(
                            chat_id,
                            &commands::unknown_agent_message(name.unwrap_or_default()),
                        )
                        .await;
                    }
                    None => {
                        self.reply(
                            chat_id,
                            &format!(
                                "Your default agent is {}. Use /agent <name> to change it.",
                                mapping.record.agent_id
                            ),
                        )
                        .await;
                    }
                }
            }
            Command::Help => self.reply(chat_id, &commands::help_message()).await,
            Command::Unknown => {}
        }
    }

    async fn handle_text(&self, message: &TgMessage, text: &str, mapping: MappingEntry) {
        let chat_id = message.chat.id;
        let chat_key = chat_id.to_string();
        let now = OffsetDateTime::now_utc();
        self.registry.touch_last_active(chat_id, now);

        let reply_to_id = message
            .reply_to_message
            .as_ref()
            .map(|r| r.message_id.to_string());
        let quoted_text = message
            .reply_to_message
            .as_ref()
            .and_then(|r| r.text.clone());

        let route = {
            let mut convos = self.convos.lock().unwrap();
            let (active_agent, last_agent_message_id) = match convos.active(&chat_key, now) {
                Some(convo) => (Some(convo.agent), convo.last_agent_message_id.clone()),
                None => (None, None),
            };
            resolve(RouteInput {
                text,
                is_self_chat: false,
                reply_to_id: reply_to_id.as_deref(),
                quoted_text: quoted_text.as_deref(),
                active_agent,
                last_agent_message_id: last_agent_message_id.as_deref(),
                default_agent: Some(mapping.record.agent_id),
            })
        };
        let Some(route) = route else { return };

        let Some(token) = self.resolve_token(&mapping).await else {
            self.reply(chat_id, commands::NEEDS_REFRESH).await;
            return;
        };

        let history = {
            let mut convos = self.convos.lock().unwrap();
            convos.record_user_turn(&chat_key, route.agent, &route.text, now);
            convos.history(&chat_key)
        };

        if let Err(err) = self.api.send_typing(chat_id).await {
            warn!(chat_id, error = %err, "typing indicator failed");
        }

        let auth = MappingAuth {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            chat_id,
            user_id: mapping.record.user_id.clone(),
        };
        let request = DispatchRequest {
            platform: Platform::Telegram,
            agent: route.agent,
            history: &history,
            context: RequestContext {
                auth_token: token,
                user_id: mapping.record.user_id.clone(),
                transport: TransportKey::Telegram {
                    telegram_chat_id: chat_id,
                },
                workspace_id: mapping.record.workspace_id.clone(),
            },
        };

        match self.dispatcher.dispatch(request, &auth).await {
            Ok(response) => {
                let last_id = self.deliver(chat_id, &response).await;
                let mut convos = self.convos.lock().unwrap();
                convos.record_assistant_turn(
                    &chat_key,
                    &response,
                    last_id.map(|id| id.to_string()),
                    OffsetDateTime::now_utc(),
                );
            }
            Err(err) => {
                error!(
                    chat_id,
                    user_id = %mapping.record.user_id,
                    agent = %route.agent,
                    error = %err,
                    "dispatch failed"
                );
                self.reply(chat_id, err.user_message()).await;
            }
        }
    }

    /// The mapping's live token, refreshing once when the stored one was
    /// undecryptable or absent.
    async fn resolve_token(&self, mapping: &MappingEntry) -> Option<String> {
        if let Some(token) = &mapping.auth_token {
            return Some(token.clone());
        }
        match self
            .backend
            .refresh_telegram_token(&mapping.record.user_id)
            .await
        {
            Ok(refreshed) => {
                if let Err(err) = self
                    .registry
                    .install_token(mapping.record.telegram_chat_id, &refreshed.token)
                {
                    warn!(
                        user_id = %mapping.record.user_id,
                        error = %err,
                        "failed to persist refreshed token"
                    );
                }
                Some(refreshed.token)
            }
            Err(err) => {
                warn!(
                    user_id = %mapping.record.user_id,
                    error = %err,
                    "token refresh for repaired mapping failed"
                );
                None
            }
        }
    }

    /// Chunked delivery with the inter-chunk delay; returns the final
    /// chunk's message id.
    pub async fn deliver(&self, chat_id: i64, text: &str) -> Option<i64> {
        let chunks = chunk_text(text, Platform::Telegram.message_limit());
        let total = chunks.len();
        let mut last_id = None;
        for (index, chunk) in chunks.iter().enumerate() {
            match self.api.send_message(chat_id, chunk).await {
                Ok(id) => last_id = Some(id),
                Err(err) => {
                    error!(chat_id, chunk = index + 1, total, error = %err, "send failed");
                    return last_id;
                }
            }
            if index + 1 < total {
                sleep(INTER_CHUNK_DELAY).await;
            }
        }
        last_id
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.api.send_message(chat_id, text).await {
            warn!(chat_id, error = %err, "reply failed");
        }
    }

    /// Periodic upkeep shared with the pairing sweep timer.
    pub fn sweep_expired(&self, now: OffsetDateTime) {
        let dropped = self.convos.lock().unwrap().sweep(now);
        let expired = self.pairing.lock().unwrap().sweep(now);
        if dropped > 0 || expired > 0 {
            info!(conversations = dropped, codes = expired, "expired state swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BotProfile, TgChat, TgUpdate, TgUser};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tbg_backend::{AgentMessage, AgentReply, AgentRuntime, RefreshedToken};
    use tbg_security::TokenCipher;
    use tbg_session::TelegramMappingStore;

    #[derive(Default)]
    struct FakeBot {
        sent: Mutex<Vec<(i64, String)>>,
        next_id: AtomicI64,
    }

    #[async_trait]
    impl BotApi for FakeBot {
        async fn get_me(&self) -> Result<BotProfile> {
            Ok(BotProfile {
                id: 1,
                username: "mybot".into(),
            })
        }

        async fn drain_pending(&self) -> Result<()> {
            Ok(())
        }

        async fn get_updates(&self, _offset: i64, _timeout: u64) -> Result<Vec<TgUpdate>> {
            Ok(Vec::new())
        }

        async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        }

        async fn send_typing(&self, _chat_id: i64) -> Result<()> {
            Ok(())
        }
    }

    struct EchoRuntime;

    #[async_trait]
    impl AgentRuntime for EchoRuntime {
        async fn generate(
            &self,
            agent: AgentId,
            messages: &[AgentMessage],
            _context: &RequestContext,
        ) -> Result<AgentReply> {
            let last = messages.last().unwrap();
            Ok(AgentReply {
                text: format!("{agent}: {}", last.content),
            })
        }
    }

    struct NoBackend;

    #[async_trait]
    impl BackendApi for NoBackend {
        async fn refresh_whatsapp_token(&self, _s: &str) -> Result<RefreshedToken> {
            Err(anyhow!("unused"))
        }
        async fn refresh_telegram_token(&self, _u: &str) -> Result<RefreshedToken> {
            Err(anyhow!("unused"))
        }
        async fn list_projects(&self, _t: &str) -> Result<Vec<tbg_backend::Project>> {
            Ok(Vec::new())
        }
        async fn morning_briefing(&self, _t: &str) -> Result<tbg_backend::MorningBriefing> {
            Ok(Default::default())
        }
        async fn list_goals(&self, _t: &str) -> Result<Vec<tbg_backend::Goal>> {
            Ok(Vec::new())
        }
        async fn active_sprint(&self, _t: &str) -> Result<Option<tbg_backend::Sprint>> {
            Ok(None)
        }
        async fn sprint_risks(
            &self,
            _t: &str,
            _s: &str,
        ) -> Result<Vec<tbg_backend::RiskSignal>> {
            Ok(Vec::new())
        }
    }

    fn runtime(dir: &std::path::Path) -> (Arc<BotRuntime>, Arc<FakeBot>) {
        let store = TelegramMappingStore::new(dir, TokenCipher::new("secret")).unwrap();
        let registry = Arc::new(MappingRegistry::load(store).unwrap());
        let api = Arc::new(FakeBot::default());
        let bot = BotRuntime::new(
            api.clone(),
            registry,
            Arc::new(Mutex::new(PairingTable::new())),
            Dispatcher::new(Arc::new(EchoRuntime)),
            Arc::new(NoBackend),
        );
        (Arc::new(bot), api)
    }

    fn text_message(chat_id: i64, text: &str) -> TgMessage {
        TgMessage {
            message_id: 1,
            date: 0,
            text: Some(text.into()),
            chat: TgChat {
                id: chat_id,
                r#type: Some("private".into()),
            },
            from: Some(TgUser {
                id: 9,
                username: Some("tester".into()),
            }),
            reply_to_message: None,
        }
    }

    #[tokio::test]
    async fn start_with_valid_code_pairs_and_welcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        let code = {
            let mut pairing = bot.pairing.lock().unwrap();
            pairing
                .issue(
                    "u1",
                    "tok",
                    AgentId::Assistant,
                    None,
                    OffsetDateTime::now_utc(),
                )
                .code
        };

        let message = text_message(555, &format!("/start {code}"));
        bot.handle_update(Some(&message)).await;

        let entry = bot.registry.get_by_chat(555).expect("paired");
        assert_eq!(entry.record.user_id, "u1");
        assert_eq!(entry.auth_token.as_deref(), Some("tok"));
        let sent = api.sent.lock().unwrap();
        assert!(sent[0].1.contains("connected"));
    }

    #[tokio::test]
    async fn start_with_bad_code_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        let message = text_message(555, "/start WRONG1");
        bot.handle_update(Some(&message)).await;
        assert!(bot.registry.get_by_chat(555).is_none());
        assert_eq!(api.sent.lock().unwrap()[0].1, commands::INVALID_CODE);
    }

    #[tokio::test]
    async fn unpaired_plain_text_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        bot.handle_update(Some(&text_message(555, "hello"))).await;
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        bot.handle_update(Some(&text_message(555, "/frobnicate")))
            .await;
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn paired_text_dispatches_to_default_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        {
            let mut pairing = bot.pairing.lock().unwrap();
            let code = pairing
                .issue(
                    "u1",
                    "tok",
                    AgentId::Assistant,
                    None,
                    OffsetDateTime::now_utc(),
                )
                .code;
            drop(pairing);
            bot.handle_update(Some(&text_message(555, &format!("/start {code}"))))
                .await;
        }

        bot.handle_update(Some(&text_message(555, "hello"))).await;

        let sent = api.sent.lock().unwrap();
        let last = &sent.last().unwrap().1;
        assert_eq!(last, "assistant: hello");
    }

    #[tokio::test]
    async fn mention_overrides_default_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        {
            let mut pairing = bot.pairing.lock().unwrap();
            let code = pairing
                .issue(
                    "u1",
                    "tok",
                    AgentId::Assistant,
                    None,
                    OffsetDateTime::now_utc(),
                )
                .code;
            drop(pairing);
            bot.handle_update(Some(&text_message(555, &format!("/start {code}"))))
                .await;
        }

        bot.handle_update(Some(&text_message(555, "@pierre what about BTCUSDT?")))
            .await;

        let sent = api.sent.lock().unwrap();
        assert_eq!(sent.last().unwrap().1, "pierre: what about BTCUSDT?");
    }

    #[tokio::test]
    async fn disconnect_unpairs_and_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let (bot, api) = runtime(dir.path());
        {
            let mut pairing = bot.pairing.lock().unwrap();
            let code = pairing
                .issue(
                    "u1",
                    "tok",
                    AgentId::Assistant,
                    None,
                    OffsetDateTime::now_utc(),
                )
                .code;
            drop(pairing);
            bot.handle_update(Some(&text_message(555, &format!("/start {code}"))))
                .await;
        }

        bot.handle_update(Some(&text_message(555, "/disconnect")))
            .await;
        assert!(bot.registry.get_by_chat(555).is_none());
        assert_eq!(api.sent.lock().unwrap().last().unwrap().1, commands::DISCONNECTED);
    }
}
