use tbg_core::AgentId;

/// Slash commands the bot recognizes. Anything else starting with `/` is
/// ignored silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Start(Option<&'a str>),
    Disconnect,
    Agent(Option<&'a str>),
    Help,
    Unknown,
}

/// Parses a leading slash command. Returns `None` for ordinary text.
pub fn parse_command(text: &str) -> Option<Command<'_>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    // Telegram clients may suffix the bot name: `/start@mybot CODE`.
    let name = head
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or_default();

    Some(match name {
        "start" => Command::Start(arg),
        "disconnect" => Command::Disconnect,
        "agent" => Command::Agent(arg),
        "help" => Command::Help,
        _ => Command::Unknown,
    })
}

pub fn welcome_message(agent: AgentId) -> String {
    format!(
        "You're connected! I'll route your messages to the {agent} agent by default.\n\
         Mention another agent any time with @name, or change the default with /agent <name>.\n\
         Send /help to see everything I can do."
    )
}

pub fn help_message() -> String {
    let agents = AgentId::ALL
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Here's how this works:\n\
         • Just type to talk to your default agent.\n\
         • Start a message with @name to address a specific agent ({agents}).\n\
         • /agent <name> — change your default agent.\n\
         • /disconnect — unlink this chat.\n\
         • /start <code> — link this chat with a pairing code."
    )
}

pub const INVALID_CODE: &str =
    "That pairing code is invalid or has expired. Generate a fresh one from the app and try again.";

pub const NOT_PAIRED: &str =
    "This chat isn't linked yet. Generate a pairing code in the app, then send /start <code>.";

pub const DISCONNECTED: &str = "Done — this chat is no longer linked to your account.";

pub const NEEDS_REFRESH: &str =
    "Your session needs a refresh. Please re-pair from the app with a new /start code.";

pub fn unknown_agent_message(name: &str) -> String {
    let agents = AgentId::ALL
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("I don't know an agent called \"{name}\". Available agents: {agents}.")
}

pub fn agent_changed_message(agent: AgentId) -> String {
    format!("Default agent switched to {agent}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_code() {
        assert_eq!(
            parse_command("/start A3F1B2"),
            Some(Command::Start(Some("A3F1B2")))
        );
        assert_eq!(parse_command("/start"), Some(Command::Start(None)));
    }

    #[test]
    fn bot_name_suffix_is_stripped() {
        assert_eq!(
            parse_command("/start@mybot A3F1B2"),
            Some(Command::Start(Some("A3F1B2")))
        );
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("  hello /start"), None);
    }

    #[test]
    fn unknown_commands_are_flagged() {
        assert_eq!(parse_command("/frobnicate"), Some(Command::Unknown));
    }

    #[test]
    fn agent_command_takes_a_name() {
        assert_eq!(
            parse_command("/agent pierre"),
            Some(Command::Agent(Some("pierre")))
        );
    }
}
