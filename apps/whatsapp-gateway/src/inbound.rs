//! Inbound filter pipeline and agent dispatch for one session.
//!
//! Filters run in a fixed order and the first match drops the event. The
//! counter-intuitive owner-only rule is deliberate: only messages the
//! account owner sent themselves act as commands, which turns every chat
//! into a private command surface.

use std::sync::Arc;

use tbg_backend::DispatchRequest;
use tbg_core::{
    CachedMessage, Platform, RequestContext, RouteInput, TransportKey, carries_signature, resolve,
};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::outbound;
use crate::session::{SessionAuth, SessionHandle, SessionManager};
use crate::transport::{Presence, SocketOps, WireMessage};

const NEEDS_REFRESH: &str =
    "Your session needs a refresh. Please log in again from the app to reconnect.";

/// Remotes that are never command surfaces: status posts, broadcast lists,
/// and group chats.
fn is_filtered_remote(remote_jid: &str) -> bool {
    remote_jid.ends_with("@status")
        || remote_jid.ends_with("@broadcast")
        || remote_jid.ends_with("@g.us")
}

pub async fn process_inbound(
    manager: &Arc<SessionManager>,
    handle: &Arc<SessionHandle>,
    ops: &Arc<dyn SocketOps>,
    message: WireMessage,
) {
    if is_filtered_remote(&message.remote_jid) {
        return;
    }

    // Cached before the remaining filters so tools can look up any recent
    // exchange, including messages the router never sees.
    let timestamp = OffsetDateTime::from_unix_timestamp(message.timestamp)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    handle.message_cache.lock().unwrap().push(
        &message.remote_jid,
        CachedMessage {
            timestamp,
            from_me: message.from_me,
            text: message.text.clone(),
            message_id: message.message_id.clone(),
        },
    );

    if !message.from_me {
        return;
    }

    if handle
        .sent_index
        .lock()
        .unwrap()
        .contains(&message.message_id)
    {
        return;
    }

    if carries_signature(&message.text) {
        // Another replica sharing this account produced it.
        info!(
            session_id = %handle.session_id,
            remote = %message.remote_jid,
            "signed echo dropped"
        );
        return;
    }

    if message.text.trim().eq_ignore_ascii_case("bye") {
        if let Err(err) = ops
            .react(&message.remote_jid, &message.message_id, "👍")
            .await
        {
            warn!(session_id = %handle.session_id, error = %err, "bye reaction failed");
        }
        handle
            .convos
            .lock()
            .unwrap()
            .drop_conversation(&message.remote_jid);
        return;
    }

    dispatch_routed(manager, handle, ops, message).await;
}

async fn dispatch_routed(
    manager: &Arc<SessionManager>,
    handle: &Arc<SessionHandle>,
    ops: &Arc<dyn SocketOps>,
    message: WireMessage,
) {
    let now = OffsetDateTime::now_utc();
    let is_self_chat = handle.self_jid().as_deref() == Some(message.remote_jid.as_str());

    let route = {
        let mut convos = handle.convos.lock().unwrap();
        let (active_agent, last_agent_message_id) =
            match convos.active(&message.remote_jid, now) {
                Some(convo) => (Some(convo.agent), convo.last_agent_message_id.clone()),
                None => (None, None),
            };
        resolve(RouteInput {
            text: &message.text,
            is_self_chat,
            reply_to_id: message.reply_to_id.as_deref(),
            quoted_text: message.quoted_text.as_deref(),
            active_agent,
            last_agent_message_id: last_agent_message_id.as_deref(),
            default_agent: None,
        })
    };
    let Some(route) = route else { return };

    let token = {
        let meta = handle.meta.lock().unwrap();
        meta.auth_token.clone()
    };
    let token = match token {
        Some(token) => token,
        None => {
            let auth = SessionAuth {
                manager: Arc::clone(manager),
                handle: Arc::clone(handle),
            };
            match tbg_backend::AuthHandle::refresh_token(&auth).await {
                Ok(token) => token,
                Err(err) => {
                    warn!(
                        session_id = %handle.session_id,
                        user_id = %handle.user_id,
                        error = %err,
                        "no usable token for dispatch"
                    );
                    outbound::send_signed(handle, ops, &message.remote_jid, NEEDS_REFRESH).await;
                    return;
                }
            }
        }
    };

    if let Err(err) = ops.mark_read(&message.remote_jid, &message.message_id).await {
        warn!(session_id = %handle.session_id, error = %err, "mark-read failed");
    }
    if let Err(err) = ops.set_presence(&message.remote_jid, Presence::Typing).await {
        warn!(session_id = %handle.session_id, error = %err, "typing presence failed");
    }

    let history = {
        let mut convos = handle.convos.lock().unwrap();
        convos.record_user_turn(&message.remote_jid, route.agent, &route.text, now);
        convos.history(&message.remote_jid)
    };

    let auth = SessionAuth {
        manager: Arc::clone(manager),
        handle: Arc::clone(handle),
    };
    let request = DispatchRequest {
        platform: Platform::WhatsApp,
        agent: route.agent,
        history: &history,
        context: RequestContext {
            auth_token: token,
            user_id: handle.user_id.clone(),
            transport: TransportKey::WhatsApp {
                whatsapp_session: handle.session_id.clone(),
            },
            workspace_id: None,
        },
    };

    match manager.dispatcher.dispatch(request, &auth).await {
        Ok(response) => {
            let last_id = outbound::deliver_response(
                handle,
                ops,
                &message.remote_jid,
                &response,
                manager.private_responses,
            )
            .await;
            handle.convos.lock().unwrap().record_assistant_turn(
                &message.remote_jid,
                &response,
                last_id,
                OffsetDateTime::now_utc(),
            );
        }
        Err(err) => {
            warn!(
                session_id = %handle.session_id,
                user_id = %handle.user_id,
                agent = %route.agent,
                error = %err,
                "dispatch failed"
            );
            outbound::send_signed(handle, ops, &message.remote_jid, err.user_message()).await;
        }
    }
}
