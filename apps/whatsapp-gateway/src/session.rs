//! Live WhatsApp sessions: registry, lifecycle, and per-session workers.
//!
//! Each session owns one bridge socket and one worker task. The worker is
//! the only consumer of the socket's event stream, so inbound processing is
//! serialized per session; sessions run in parallel against each other.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tbg_backend::{AuthHandle, BackendApi, Dispatcher};
use tbg_core::{
    ConversationTable, GatewayError, MessageCache, ReconnectPolicy, SentMessageIndex,
};
use tbg_session::{LoadedSession, SessionRecord, WhatsAppSessionStore, generate_session_id};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::inbound;
use crate::transport::{SocketEvent, SocketOps, WhatsAppTransport};

/// Mutable per-session state guarded by one lock; never held across await.
#[derive(Debug)]
pub struct SessionMeta {
    pub record: SessionRecord,
    pub auth_token: Option<String>,
    pub needs_repair: bool,
    pub current_qr: Option<String>,
    pub connected: bool,
}

pub struct SessionHandle {
    pub session_id: String,
    pub user_id: String,
    pub meta: Mutex<SessionMeta>,
    pub convos: Mutex<ConversationTable>,
    pub sent_index: Mutex<SentMessageIndex>,
    pub message_cache: Mutex<MessageCache>,
    ops: Mutex<Option<Arc<dyn SocketOps>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub(crate) fn new(
        record: SessionRecord,
        auth_token: Option<String>,
        needs_repair: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            meta: Mutex::new(SessionMeta {
                record,
                auth_token,
                needs_repair,
                current_qr: None,
                connected: false,
            }),
            convos: Mutex::new(ConversationTable::new()),
            sent_index: Mutex::new(SentMessageIndex::default()),
            message_cache: Mutex::new(MessageCache::default()),
            ops: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// The owner's self-chat JID, once the phone number is known.
    pub fn self_jid(&self) -> Option<String> {
        let meta = self.meta.lock().unwrap();
        meta.record.phone_number.as_deref().map(jid_for_phone)
    }

    pub fn current_ops(&self) -> Option<Arc<dyn SocketOps>> {
        self.ops.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.meta.lock().unwrap().connected
    }
}

pub fn jid_for_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    format!("{digits}@s.whatsapp.net")
}

/// Rotates a session's token against the backend and persists before the
/// dispatcher retries.
pub struct SessionAuth {
    pub manager: Arc<SessionManager>,
    pub handle: Arc<SessionHandle>,
}

#[async_trait]
impl AuthHandle for SessionAuth {
    async fn refresh_token(&self) -> Result<String> {
        let refreshed = self
            .manager
            .backend
            .refresh_whatsapp_token(&self.handle.session_id)
            .await?;
        {
            let mut meta = self.handle.meta.lock().unwrap();
            meta.auth_token = Some(refreshed.token.clone());
            meta.needs_repair = false;
        }
        self.manager.persist_all()?;
        Ok(refreshed.token)
    }
}

pub struct SessionManager {
    pub store: WhatsAppSessionStore,
    pub transport: Arc<dyn WhatsAppTransport>,
    pub dispatcher: Dispatcher,
    pub backend: Arc<dyn BackendApi>,
    pub private_responses: bool,
    max_sessions: usize,
    sessions: DashMap<String, Arc<SessionHandle>>,
    session_by_user: DashMap<String, String>,
    /// Serializes create/destroy so the cap and the one-session-per-user
    /// invariant hold under concurrent logins.
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(
        store: WhatsAppSessionStore,
        transport: Arc<dyn WhatsAppTransport>,
        dispatcher: Dispatcher,
        backend: Arc<dyn BackendApi>,
        max_sessions: usize,
        private_responses: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            dispatcher,
            backend,
            private_responses,
            max_sessions,
            sessions: DashMap::new(),
            session_by_user: DashMap::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    /// Reconnects every persisted session on startup.
    pub async fn start_from_store(self: &Arc<Self>) -> Result<()> {
        let loaded = self.store.load_all()?;
        let count = loaded.len();
        for LoadedSession {
            record,
            auth_token,
            needs_repair,
        } in loaded
        {
            let handle = SessionHandle::new(record, auth_token, needs_repair);
            self.register(Arc::clone(&handle));
            self.spawn_worker(handle);
        }
        info!(sessions = count, "whatsapp sessions restored");
        Ok(())
    }

    pub(crate) fn register(&self, handle: Arc<SessionHandle>) {
        self.session_by_user
            .insert(handle.user_id.clone(), handle.session_id.clone());
        self.sessions.insert(handle.session_id.clone(), handle);
    }

    /// Creates (or idempotently returns) the user's session. The new worker
    /// connects immediately, which starts QR generation on the bridge.
    pub async fn create_session(
        self: &Arc<Self>,
        user_id: &str,
        auth_token: String,
    ) -> Result<Arc<SessionHandle>, GatewayError> {
        let _guard = self.lifecycle.lock().await;

        if let Some(existing) = self.session_by_user.get(user_id) {
            let session_id = existing.clone();
            drop(existing);
            if let Some(handle) = self.sessions.get(&session_id) {
                info!(user_id = %user_id, session_id = %session_id, "re-login onto existing session");
                return Ok(Arc::clone(handle.value()));
            }
        }

        if self.sessions.len() >= self.max_sessions {
            return Err(GatewayError::SessionLimit(self.max_sessions));
        }

        let session_id = generate_session_id();
        let credentials_path = self
            .store
            .prepare_credentials_dir(&session_id)
            .map_err(|err| GatewayError::Backend(err.to_string()))?;
        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            phone_number: None,
            credentials_path,
            encrypted_auth_token: None,
            created_at: OffsetDateTime::now_utc(),
            last_connected: None,
        };
        let handle = SessionHandle::new(record, Some(auth_token), false);
        self.register(Arc::clone(&handle));
        if let Err(err) = self.persist_all() {
            self.sessions.remove(&session_id);
            self.session_by_user.remove(user_id);
            return Err(GatewayError::Backend(err.to_string()));
        }
        self.spawn_worker(Arc::clone(&handle));
        info!(user_id = %user_id, session_id = %session_id, "session created");
        Ok(handle)
    }

    /// Destroys a session owned by `user_id`. Returns false when no such
    /// session exists (or it belongs to someone else).
    pub async fn destroy_session(self: &Arc<Self>, user_id: &str, session_id: &str) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;

        let Some(handle) = self.get_owned(user_id, session_id) else {
            return Ok(false);
        };
        if let Some(worker) = handle.worker.lock().unwrap().take() {
            worker.abort();
        }
        if let Some(ops) = handle.current_ops() {
            ops.close().await;
        }
        self.sessions.remove(session_id);
        self.session_by_user.remove(user_id);
        self.store
            .remove(session_id)
            .context("remove session state")?;
        info!(user_id = %user_id, session_id = %session_id, "session destroyed");
        Ok(true)
    }

    /// The session only when it exists and belongs to `user_id`; callers
    /// cannot tell foreign sessions from missing ones.
    pub fn get_owned(&self, user_id: &str, session_id: &str) -> Option<Arc<SessionHandle>> {
        let handle = self.sessions.get(session_id)?;
        if handle.user_id == user_id {
            Some(Arc::clone(handle.value()))
        } else {
            None
        }
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<SessionHandle>> {
        self.session_by_user
            .get(user_id)
            .and_then(|id| self.sessions.get(id.value()).map(|h| Arc::clone(h.value())))
            .into_iter()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// All live sessions, for the morning briefing sweep.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Full manifest rewrite with freshly re-encrypted live tokens.
    pub fn persist_all(&self) -> Result<()> {
        let metas: Vec<(SessionRecord, Option<String>)> = self
            .sessions
            .iter()
            .map(|entry| {
                let meta = entry.value().meta.lock().unwrap();
                (meta.record.clone(), meta.auth_token.clone())
            })
            .collect();
        self.store
            .persist(metas.iter().map(|(record, token)| (record, token.as_deref())))
    }

    fn spawn_worker(self: &Arc<Self>, handle: Arc<SessionHandle>) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let worker_handle = Arc::clone(&handle);
        let task = tokio::spawn(async move {
            run_session_worker(manager, worker_handle, shutdown).await;
        });
        *handle.worker.lock().unwrap() = Some(task);
    }

    /// Expires idle conversations across all sessions.
    pub fn sweep_conversations(&self, now: OffsetDateTime) {
        for entry in self.sessions.iter() {
            entry.value().convos.lock().unwrap().sweep(now);
        }
    }

    /// Graceful teardown: close sockets, give workers a bounded window to
    /// finish the event they are processing, persist once.
    pub async fn shutdown_all(&self, grace: std::time::Duration) {
        let mut workers = Vec::new();
        for entry in self.sessions.iter() {
            if let Some(ops) = entry.value().current_ops() {
                ops.close().await;
            }
            if let Some(worker) = entry.value().worker.lock().unwrap().take() {
                workers.push(worker);
            }
        }
        let deadline = tokio::time::Instant::now() + grace;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
            }
        }
        if let Err(err) = self.persist_all() {
            error!(error = %err, "final session persist failed");
        }
    }
}

/// Connect-and-consume loop for one session. Ends permanently on logout or
/// when the reconnect budget runs out.
async fn run_session_worker(
    manager: Arc<SessionManager>,
    handle: Arc<SessionHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = ReconnectPolicy::default();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }
        let credentials_dir = {
            let meta = handle.meta.lock().unwrap();
            meta.record.credentials_path.clone()
        };

        let connected = tokio::select! {
            _ = shutdown.changed() => return,
            result = manager.transport.connect(&handle.session_id, &credentials_dir) => result,
        };

        match connected {
            Ok(socket) => {
                let mut events = socket.events;
                let ops = socket.ops;
                *handle.ops.lock().unwrap() = Some(Arc::clone(&ops));

                loop {
                    let event = tokio::select! {
                        _ = shutdown.changed() => {
                            ops.close().await;
                            return;
                        }
                        event = events.recv() => event,
                    };
                    match event {
                        Some(SocketEvent::Qr { payload }) => {
                            handle.meta.lock().unwrap().current_qr = Some(payload);
                            info!(session_id = %handle.session_id, "qr code refreshed");
                        }
                        Some(SocketEvent::Open { phone_number }) => {
                            attempt = 0;
                            {
                                let mut meta = handle.meta.lock().unwrap();
                                meta.connected = true;
                                meta.current_qr = None;
                                meta.record.phone_number = Some(phone_number.clone());
                                meta.record.last_connected = Some(OffsetDateTime::now_utc());
                            }
                            if let Err(err) = manager.persist_all() {
                                warn!(session_id = %handle.session_id, error = %err, "persist after open failed");
                            }
                            let self_jid = jid_for_phone(&phone_number);
                            if let Err(err) =
                                ops.set_presence(&self_jid, crate::transport::Presence::Online).await
                            {
                                warn!(session_id = %handle.session_id, error = %err, "online presence failed");
                            }
                            info!(
                                session_id = %handle.session_id,
                                phone = %phone_number,
                                "session connected"
                            );
                        }
                        Some(SocketEvent::Message(message)) => {
                            inbound::process_inbound(&manager, &handle, &ops, message).await;
                        }
                        Some(SocketEvent::Closed { logged_out }) => {
                            {
                                let mut meta = handle.meta.lock().unwrap();
                                meta.connected = false;
                                if logged_out {
                                    meta.needs_repair = true;
                                    meta.current_qr = None;
                                }
                            }
                            *handle.ops.lock().unwrap() = None;
                            if logged_out {
                                warn!(
                                    session_id = %handle.session_id,
                                    "transport logged out; session needs re-pairing"
                                );
                                return;
                            }
                            break;
                        }
                        None => {
                            handle.meta.lock().unwrap().connected = false;
                            *handle.ops.lock().unwrap() = None;
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(session_id = %handle.session_id, error = %err, "bridge connect failed");
            }
        }

        attempt += 1;
        match policy.delay(attempt) {
            Some(delay) => {
                info!(
                    session_id = %handle.session_id,
                    attempt,
                    delay_s = delay.as_secs(),
                    "reconnecting"
                );
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = sleep(delay) => {}
                }
            }
            None => {
                error!(
                    session_id = %handle.session_id,
                    "reconnect attempts exhausted; session parked"
                );
                return;
            }
        }
    }
}
