//! Outbound delivery: signature, chunking, echo bookkeeping, and the
//! private-response mode.

use std::sync::Arc;
use std::time::Duration;

use tbg_core::{Platform, chunk_text, sign};
use tokio::time::sleep;
use tracing::warn;

use crate::session::SessionHandle;
use crate::transport::SocketOps;

const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Sends one signed message and records its id for echo suppression.
pub async fn send_signed(
    handle: &SessionHandle,
    ops: &Arc<dyn SocketOps>,
    target: &str,
    text: &str,
) -> Option<String> {
    let signed = sign(text);
    match ops.send_text(target, &signed).await {
        Ok(message_id) => {
            handle
                .sent_index
                .lock()
                .unwrap()
                .record(message_id.clone());
            Some(message_id)
        }
        Err(err) => {
            warn!(
                session_id = %handle.session_id,
                target,
                error = %err,
                "send failed"
            );
            None
        }
    }
}

/// Delivers an agent response, chunked under the transport limit with the
/// inter-chunk delay. Returns the final chunk's message id.
///
/// In private-response mode the whole response goes to the owner's
/// self-chat, prefixed with the originating chat id so the owner can tell
/// threads apart.
pub async fn deliver_response(
    handle: &SessionHandle,
    ops: &Arc<dyn SocketOps>,
    origin_remote: &str,
    text: &str,
    private_mode: bool,
) -> Option<String> {
    let (target, body) = if private_mode {
        match handle.self_jid() {
            Some(self_jid) if self_jid != origin_remote => {
                let body = format!("[Re: {origin_remote}]\n\n{text}");
                (self_jid, body)
            }
            Some(self_jid) => (self_jid, text.to_string()),
            // Phone number unknown until the first open; fall back to the
            // originating chat rather than dropping the response.
            None => (origin_remote.to_string(), text.to_string()),
        }
    } else {
        (origin_remote.to_string(), text.to_string())
    };

    let chunks = chunk_text(&body, Platform::WhatsApp.message_limit());
    let total = chunks.len();
    let mut last_id = None;
    for (index, chunk) in chunks.iter().enumerate() {
        match send_signed(handle, ops, &target, chunk).await {
            Some(id) => last_id = Some(id),
            None => break,
        }
        if index + 1 < total {
            sleep(INTER_CHUNK_DELAY).await;
        }
    }
    last_id
}
