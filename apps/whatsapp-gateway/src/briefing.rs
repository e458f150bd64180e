//! Morning briefing delivery to connected sessions' self-chats.

use std::sync::Arc;

use tbg_proactive::format_briefing;
use tracing::{info, warn};

use crate::outbound;
use crate::session::SessionManager;

pub struct BriefingRunner {
    pub manager: Arc<SessionManager>,
}

impl BriefingRunner {
    /// One pass over all connected sessions. Failures are isolated per
    /// session and logged with ids.
    pub async fn run_morning(&self) {
        let sessions = self.manager.snapshot();
        info!(sessions = sessions.len(), "whatsapp briefing sweep started");
        let mut delivered = 0usize;

        for handle in sessions {
            if !handle.is_connected() {
                continue;
            }
            let Some(ops) = handle.current_ops() else {
                continue;
            };
            let Some(self_jid) = handle.self_jid() else {
                continue;
            };
            let token = {
                let meta = handle.meta.lock().unwrap();
                meta.auth_token.clone()
            };
            let Some(token) = token else {
                warn!(
                    session_id = %handle.session_id,
                    user_id = %handle.user_id,
                    "no usable token; briefing skipped"
                );
                continue;
            };

            match self.manager.backend.morning_briefing(&token).await {
                Ok(briefing) => {
                    if let Some(text) = format_briefing(&briefing) {
                        if outbound::deliver_response(&handle, &ops, &self_jid, &text, false)
                            .await
                            .is_some()
                        {
                            delivered += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        session_id = %handle.session_id,
                        user_id = %handle.user_id,
                        check = "morning_briefing",
                        error = %err,
                        "briefing fetch failed"
                    );
                }
            }
        }
        info!(delivered, "whatsapp briefing sweep finished");
    }
}
