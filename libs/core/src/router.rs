//! Decides whether an inbound message invokes an agent, which one, and with
//! what forwarded text.

use std::sync::OnceLock;

use regex::Regex;

use crate::AgentId;

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@(\w+)\s*").expect("mention regex"))
}

/// A leading `@name` mention, when `name` is a known agent alias.
///
/// Unknown names are not treated as mentions; the original text is forwarded
/// untouched so typos don't eat messages.
pub fn parse_mention(text: &str) -> Option<(AgentId, String)> {
    let caps = mention_re().captures(text)?;
    let agent = AgentId::from_alias(&caps[1])?;
    let rest = text[caps.get(0).expect("whole match").end()..].to_string();
    Some((agent, rest))
}

/// Everything the router needs to know about one inbound message.
#[derive(Debug, Clone, Default)]
pub struct RouteInput<'a> {
    pub text: &'a str,
    /// True when the message landed in the session owner's self-chat.
    pub is_self_chat: bool,
    /// Message id this inbound replies to, when the transport reports one.
    pub reply_to_id: Option<&'a str>,
    pub quoted_text: Option<&'a str>,
    /// Agent pinned by a live conversation for this chat, if any.
    pub active_agent: Option<AgentId>,
    /// The live conversation's last delivered agent message id.
    pub last_agent_message_id: Option<&'a str>,
    /// The user's stored default agent (Telegram mappings only).
    pub default_agent: Option<AgentId>,
}

/// A resolved dispatch target.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub agent: AgentId,
    pub text: String,
}

/// Applies the resolution policy; the first rule that fires wins.
///
/// 1. Self-chat: mention if present, else the default agent.
/// 2. Explicit mention anywhere.
/// 3. Reply to the conversation's last agent message.
/// 4. A live conversation pins its agent.
/// 5. A stored default agent (Telegram).
/// 6. Otherwise no dispatch.
pub fn resolve(input: RouteInput<'_>) -> Option<Route> {
    let mention = parse_mention(input.text);

    let (agent, text) = if input.is_self_chat {
        match mention {
            Some((agent, rest)) => (agent, rest),
            None => (
                input.default_agent.unwrap_or_default(),
                input.text.to_string(),
            ),
        }
    } else if let Some((agent, rest)) = mention {
        (agent, rest)
    } else if let (Some(reply_to), Some(last_id)) = (input.reply_to_id, input.last_agent_message_id)
    {
        if reply_to == last_id {
            (input.active_agent?, input.text.to_string())
        } else if let Some(agent) = input.active_agent {
            (agent, input.text.to_string())
        } else {
            (input.default_agent?, input.text.to_string())
        }
    } else if let Some(agent) = input.active_agent {
        (agent, input.text.to_string())
    } else if let Some(agent) = input.default_agent {
        (agent, input.text.to_string())
    } else {
        return None;
    };

    Some(Route {
        agent,
        text: with_quote_prefix(&text, input.quoted_text),
    })
}

/// Prepends the quoted-reply context so the agent sees it without transport
/// awareness.
fn with_quote_prefix(text: &str, quoted: Option<&str>) -> String {
    match quoted {
        Some(quoted) if !quoted.trim().is_empty() => {
            format!("[Replying to: \"{quoted}\"]\n\n{text}")
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_parses_and_strips() {
        let (agent, rest) = parse_mention("@pierre what about BTCUSDT?").unwrap();
        assert_eq!(agent, AgentId::Pierre);
        assert_eq!(rest, "what about BTCUSDT?");
    }

    #[test]
    fn unknown_mention_is_not_a_mention() {
        assert!(parse_mention("@nobody hello").is_none());
        assert!(parse_mention("hello @pierre").is_none());
    }

    #[test]
    fn self_chat_mention_overrides_default() {
        let route = resolve(RouteInput {
            text: "@pierre what about BTCUSDT?",
            is_self_chat: true,
            default_agent: Some(AgentId::Assistant),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(route.agent, AgentId::Pierre);
        assert_eq!(route.text, "what about BTCUSDT?");
    }

    #[test]
    fn self_chat_without_mention_uses_default() {
        let route = resolve(RouteInput {
            text: "remind me later",
            is_self_chat: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(route.agent, AgentId::Assistant);
    }

    #[test]
    fn reply_to_last_agent_message_continues_thread() {
        let route = resolve(RouteInput {
            text: "and then?",
            reply_to_id: Some("m-42"),
            last_agent_message_id: Some("m-42"),
            active_agent: Some(AgentId::Zoe),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(route.agent, AgentId::Zoe);
    }

    #[test]
    fn active_conversation_pins_agent() {
        let route = resolve(RouteInput {
            text: "tell me more",
            active_agent: Some(AgentId::Paddy),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(route.agent, AgentId::Paddy);
    }

    #[test]
    fn no_conversation_and_no_default_drops() {
        assert!(
            resolve(RouteInput {
                text: "hello there",
                ..Default::default()
            })
            .is_none()
        );
    }

    #[test]
    fn telegram_default_agent_catches_cold_chats() {
        let route = resolve(RouteInput {
            text: "hello",
            default_agent: Some(AgentId::Assistant),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(route.agent, AgentId::Assistant);
        assert_eq!(route.text, "hello");
    }

    #[test]
    fn quoted_reply_gets_context_prefix() {
        let route = resolve(RouteInput {
            text: "yes do that",
            quoted_text: Some("should I archive it?"),
            active_agent: Some(AgentId::Ash),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            route.text,
            "[Replying to: \"should I archive it?\"]\n\nyes do that"
        );
    }

    #[test]
    fn mention_text_keeps_quote_prefix_order() {
        let route = resolve(RouteInput {
            text: "@zoe summarize",
            quoted_text: Some("long report"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(route.agent, AgentId::Zoe);
        assert!(route.text.starts_with("[Replying to: \"long report\"]"));
        assert!(route.text.ends_with("summarize"));
    }
}
