use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Platform;

/// Transport-specific key carried in the request context so agent tools can
/// address the originating chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "transport")]
pub enum TransportKey {
    #[serde(rename = "whatsapp")]
    WhatsApp { whatsapp_session: String },
    #[serde(rename = "telegram")]
    Telegram { telegram_chat_id: i64 },
}

impl TransportKey {
    pub fn platform(&self) -> Platform {
        match self {
            TransportKey::WhatsApp { .. } => Platform::WhatsApp,
            TransportKey::Telegram { .. } => Platform::Telegram,
        }
    }
}

/// Immutable per-request context handed to the agent runtime alongside the
/// message list. Conceptually a string-keyed dictionary; the typed fields
/// keep call sites honest and `to_entries` produces the wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub auth_token: String,
    pub user_id: String,
    #[serde(flatten)]
    pub transport: TransportKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl RequestContext {
    /// Flattens the context into ordered string entries for runtimes that
    /// accept only a flat dictionary.
    pub fn to_entries(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        entries.insert("authToken".into(), self.auth_token.clone());
        entries.insert("userId".into(), self.user_id.clone());
        match &self.transport {
            TransportKey::WhatsApp { whatsapp_session } => {
                entries.insert("whatsappSession".into(), whatsapp_session.clone());
            }
            TransportKey::Telegram { telegram_chat_id } => {
                entries.insert("telegramChatId".into(), telegram_chat_id.to_string());
            }
        }
        if let Some(workspace) = &self.workspace_id {
            entries.insert("workspaceId".into(), workspace.clone());
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whatsapp_context_entries() {
        let ctx = RequestContext {
            auth_token: "tok".into(),
            user_id: "u1".into(),
            transport: TransportKey::WhatsApp {
                whatsapp_session: "ab12cd34".into(),
            },
            workspace_id: None,
        };
        let entries = ctx.to_entries();
        assert_eq!(entries["whatsappSession"], "ab12cd34");
        assert_eq!(entries["userId"], "u1");
        assert!(!entries.contains_key("workspaceId"));
    }

    #[test]
    fn telegram_context_includes_workspace() {
        let ctx = RequestContext {
            auth_token: "tok".into(),
            user_id: "u2".into(),
            transport: TransportKey::Telegram {
                telegram_chat_id: 555,
            },
            workspace_id: Some("ws-9".into()),
        };
        let entries = ctx.to_entries();
        assert_eq!(entries["telegramChatId"], "555");
        assert_eq!(entries["workspaceId"], "ws-9");
    }
}
