use serde::{Deserialize, Serialize};

/// Supported chat transports (kept small and stable).
///
/// ```
/// use tbg_core::Platform;
///
/// let p = Platform::Telegram;
/// assert_eq!(p.as_str(), "telegram");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    WhatsApp,
    Telegram,
}

impl Platform {
    /// Returns the lowercase string identifier used in logs and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Telegram => "telegram",
        }
    }

    /// Per-transport outbound length limit in characters.
    pub fn message_limit(&self) -> usize {
        match self {
            // WhatsApp reserves room for the trailing bot signature.
            Platform::WhatsApp => 4096 - crate::signature::BOT_SIGNATURE_LEN,
            Platform::Telegram => 4096,
        }
    }
}

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One bounded-history conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
