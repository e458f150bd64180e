use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed pool of conversational agents the gateway can dispatch to.
///
/// Agents are addressed by short lowercase aliases in chat (`@pierre ...`).
/// The runtime behind each agent is an external collaborator; the gateway
/// only needs a stable identifier to route with.
///
/// ```
/// use tbg_core::AgentId;
///
/// assert_eq!(AgentId::from_alias("pierre"), Some(AgentId::Pierre));
/// assert_eq!(AgentId::Pierre.as_str(), "pierre");
/// assert_eq!(AgentId::from_alias("nobody"), None);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Weather,
    Pierre,
    Ash,
    Paddy,
    Zoe,
    Assistant,
}

impl AgentId {
    pub const ALL: [AgentId; 6] = [
        AgentId::Weather,
        AgentId::Pierre,
        AgentId::Ash,
        AgentId::Paddy,
        AgentId::Zoe,
        AgentId::Assistant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Weather => "weather",
            AgentId::Pierre => "pierre",
            AgentId::Ash => "ash",
            AgentId::Paddy => "paddy",
            AgentId::Zoe => "zoe",
            AgentId::Assistant => "assistant",
        }
    }

    /// Case-insensitive alias lookup. Unknown aliases return `None`.
    pub fn from_alias(alias: &str) -> Option<Self> {
        let lowered = alias.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|a| a.as_str() == lowered)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        AgentId::Assistant
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s).ok_or_else(|| UnknownAgent(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent alias: {0}")]
pub struct UnknownAgent(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_round_trip() {
        for agent in AgentId::ALL {
            assert_eq!(AgentId::from_alias(agent.as_str()), Some(agent));
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(AgentId::from_alias("ZOE"), Some(AgentId::Zoe));
        assert_eq!(AgentId::from_alias("Weather"), Some(AgentId::Weather));
    }

    #[test]
    fn serde_uses_lowercase_alias() {
        assert_eq!(serde_json::to_string(&AgentId::Paddy).unwrap(), "\"paddy\"");
        let parsed: AgentId = serde_json::from_str("\"ash\"").unwrap();
        assert_eq!(parsed, AgentId::Ash);
    }

    #[test]
    fn default_is_assistant() {
        assert_eq!(AgentId::default(), AgentId::Assistant);
    }
}
