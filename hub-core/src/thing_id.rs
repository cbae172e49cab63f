//! Digital-twin identifier handling.
//!
//! Every Thing is addressed through the runtime as `dtw:<agent_id>:<thing_id>`.
//! Agents never observe this namespace; consumers never observe the bare
//! agent namespace. The router is the only place the two are translated.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HubError;

/// Namespace prefix of every digital-twin thing id.
pub const DTW_PREFIX: &str = "dtw:";

/// A parsed `dtw:<agent_id>:<thing_id>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DThingId {
    pub agent_id: String,
    pub thing_id: String,
}

impl DThingId {
    pub fn new(agent_id: impl Into<String>, thing_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            thing_id: thing_id.into(),
        }
    }

    /// Split a digital-twin id into its agent and local thing parts.
    ///
    /// The agent id cannot contain `:`, so the split is on the first colon
    /// after the prefix; the remainder is the agent-local thing id.
    pub fn parse(dthing_id: &str) -> Result<Self, HubError> {
        let rest = dthing_id
            .strip_prefix(DTW_PREFIX)
            .ok_or_else(|| HubError::InvalidArgument(format!("not a dtw thing id: '{dthing_id}'")))?;
        let (agent_id, thing_id) = rest
            .split_once(':')
            .ok_or_else(|| HubError::InvalidArgument(format!("malformed dtw thing id: '{dthing_id}'")))?;
        if agent_id.is_empty() || thing_id.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "malformed dtw thing id: '{dthing_id}'"
            )));
        }
        Ok(Self::new(agent_id, thing_id))
    }
}

impl fmt::Display for DThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DTW_PREFIX}{}:{}", self.agent_id, self.thing_id)
    }
}

/// Build the digital-twin id for an agent's local thing id.
pub fn make_dthing_id(agent_id: &str, thing_id: &str) -> String {
    format!("{DTW_PREFIX}{agent_id}:{thing_id}")
}

/// Client ids are printable ASCII without `/`, `:` or whitespace.
pub fn validate_client_id(client_id: &str) -> Result<(), HubError> {
    if client_id.is_empty() {
        return Err(HubError::InvalidArgument("client id is empty".to_string()));
    }
    if let Some(bad) = client_id
        .chars()
        .find(|c| !c.is_ascii_graphic() || matches!(c, '/' | ':'))
    {
        return Err(HubError::InvalidArgument(format!(
            "client id '{client_id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Thing ids are printable ASCII, unique within an agent.
pub fn validate_thing_id(thing_id: &str) -> Result<(), HubError> {
    if thing_id.is_empty() {
        return Err(HubError::InvalidArgument("thing id is empty".to_string()));
    }
    if let Some(bad) = thing_id.chars().find(|c| !c.is_ascii_graphic()) {
        return Err(HubError::InvalidArgument(format!(
            "thing id '{thing_id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let id = DThingId::parse("dtw:agent1:thing1").expect("parse");
        assert_eq!(id.agent_id, "agent1");
        assert_eq!(id.thing_id, "thing1");
        assert_eq!(id.to_string(), "dtw:agent1:thing1");
    }

    #[test]
    fn thing_id_may_contain_colons() {
        let id = DThingId::parse("dtw:zwave:node:7").expect("parse");
        assert_eq!(id.agent_id, "zwave");
        assert_eq!(id.thing_id, "node:7");
    }

    #[test]
    fn rejects_bare_and_malformed_ids() {
        assert!(DThingId::parse("thing1").is_err());
        assert!(DThingId::parse("dtw:thing1").is_err());
        assert!(DThingId::parse("dtw::thing1").is_err());
        assert!(DThingId::parse("dtw:agent1:").is_err());
    }

    #[test]
    fn client_id_charset() {
        assert!(validate_client_id("alice-1").is_ok());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("al ice").is_err());
        assert!(validate_client_id("a/b").is_err());
        assert!(validate_client_id("a:b").is_err());
    }
}
