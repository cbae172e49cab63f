//! The closed operations vocabulary the runtime understands.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HubError;

/// One of the closed-set verbs a client may put in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    // property
    ReadProperty,
    ReadAllProperties,
    WriteProperty,
    ObserveProperty,
    ObserveAllProperties,
    UnobserveProperty,
    UnobserveAllProperties,
    // event
    SubscribeEvent,
    SubscribeAllEvents,
    UnsubscribeEvent,
    UnsubscribeAllEvents,
    // action
    InvokeAction,
    QueryAction,
    QueryAllActions,
    // thing description
    ReadTd,
    ReadAllTds,
    UpdateTd,
    RemoveTd,
    // session
    Login,
    Logout,
    RefreshToken,
    PingWs,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ReadProperty => "readproperty",
            Operation::ReadAllProperties => "readallproperties",
            Operation::WriteProperty => "writeproperty",
            Operation::ObserveProperty => "observeproperty",
            Operation::ObserveAllProperties => "observeallproperties",
            Operation::UnobserveProperty => "unobserveproperty",
            Operation::UnobserveAllProperties => "unobserveallproperties",
            Operation::SubscribeEvent => "subscribeevent",
            Operation::SubscribeAllEvents => "subscribeallevents",
            Operation::UnsubscribeEvent => "unsubscribeevent",
            Operation::UnsubscribeAllEvents => "unsubscribeallevents",
            Operation::InvokeAction => "invokeaction",
            Operation::QueryAction => "queryaction",
            Operation::QueryAllActions => "queryallactions",
            Operation::ReadTd => "readtd",
            Operation::ReadAllTds => "readalltds",
            Operation::UpdateTd => "updatetd",
            Operation::RemoveTd => "removetd",
            Operation::Login => "login",
            Operation::Logout => "logout",
            Operation::RefreshToken => "refreshtoken",
            Operation::PingWs => "pingws",
        }
    }

    /// Subscription-class operations change per-connection subscription or
    /// observation state and are never forwarded to an agent.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Operation::ObserveProperty
                | Operation::ObserveAllProperties
                | Operation::UnobserveProperty
                | Operation::UnobserveAllProperties
                | Operation::SubscribeEvent
                | Operation::SubscribeAllEvents
                | Operation::UnsubscribeEvent
                | Operation::UnsubscribeAllEvents
        )
    }

    /// Read-class operations are answered from the digital twin's stored
    /// state rather than forwarded to the owning agent.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Operation::ReadProperty
                | Operation::ReadAllProperties
                | Operation::QueryAction
                | Operation::QueryAllActions
                | Operation::ReadTd
                | Operation::ReadAllTds
        )
    }

    /// Whether a request with this operation expects a reply to correlate.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Operation::InvokeAction
                | Operation::WriteProperty
                | Operation::UpdateTd
                | Operation::RemoveTd
                | Operation::ReadProperty
                | Operation::ReadAllProperties
                | Operation::QueryAction
                | Operation::QueryAllActions
                | Operation::ReadTd
                | Operation::ReadAllTds
                | Operation::Login
                | Operation::RefreshToken
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| HubError::InvalidArgument(format!("unknown operation '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for op in [
            Operation::ReadProperty,
            Operation::WriteProperty,
            Operation::SubscribeAllEvents,
            Operation::InvokeAction,
            Operation::ReadAllTds,
            Operation::RefreshToken,
            Operation::PingWs,
        ] {
            let parsed: Operation = op.as_str().parse().expect("parse wire name");
            assert_eq!(parsed, op);
        }
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!("fly".parse::<Operation>().is_err());
    }

    #[test]
    fn classification() {
        assert!(Operation::InvokeAction.expects_reply());
        assert!(!Operation::SubscribeEvent.expects_reply());
        assert!(Operation::SubscribeEvent.is_subscription());
        assert!(Operation::ReadProperty.is_read());
        assert!(!Operation::WriteProperty.is_read());
    }
}
