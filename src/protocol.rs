//! Wire format of the multiplex channel.
//!
//! The shared socket carries newline-free JSON text frames in both
//! directions. Client messages are [`ClientCommand`]s keyed by a
//! per-connection subscription index; server messages are [`ServerFrame`]s
//! echoing that index so the hub can route payloads without inspecting them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WsError;

/// The live feeds the backend can multiplex onto one socket.
///
/// `Container`, `ContainerStats` and `SystemStats` carry an argument
/// (the target id) in the subscribe command's `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Rolling list of all containers.
    ContainersList,
    /// One container's inspect-level detail. Takes the container id.
    Container,
    /// Rolling list of all images.
    ImagesList,
    /// Resource usage samples for one container. Takes the container id.
    ContainerStats,
    /// Host-level resource usage samples. Takes a scope id.
    SystemStats,
}

impl SubscriptionKind {
    /// Action string that opens this feed.
    pub fn subscribe_action(self) -> &'static str {
        match self {
            Self::ContainersList => "subscribeToContainersList",
            Self::Container => "subscribeToContainer",
            Self::ImagesList => "subscribeToImagesList",
            Self::ContainerStats => "subscribeToContainerStats",
            Self::SystemStats => "subscribeToSystemStats",
        }
    }

    /// Action string that ends this feed.
    pub fn unsubscribe_action(self) -> &'static str {
        match self {
            Self::ContainersList => "unsubscribeToContainersList",
            Self::Container => "unsubscribeToContainer",
            Self::ImagesList => "unsubscribeToImagesList",
            Self::ContainerStats => "unsubscribeToContainerStats",
            Self::SystemStats => "unsubscribeToSystemStats",
        }
    }

    /// Whether the subscribe command carries a target argument in `data`.
    pub fn requires_arg(self) -> bool {
        matches!(self, Self::Container | Self::ContainerStats | Self::SystemStats)
    }
}

/// A client-to-server command on the multiplex channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClientCommand {
    /// Connection-scoped subscription index this command allocates or acts on.
    pub index: u64,
    /// Verb, e.g. `subscribeToContainersList`.
    pub action: &'static str,
    /// Subscribe: optional target argument. Unsubscribe: the index being
    /// retired (the command itself carries a freshly allocated index).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ClientCommand {
    /// A subscribe command for `kind` at `index`, with its optional argument.
    pub fn subscribe(index: u64, kind: SubscriptionKind, arg: Option<Value>) -> Self {
        Self {
            index,
            action: kind.subscribe_action(),
            data: arg,
        }
    }

    /// An unsubscribe command. `index` is newly allocated for the command
    /// itself; `old_index` names the subscription being retired.
    pub fn unsubscribe(index: u64, kind: SubscriptionKind, old_index: u64) -> Self {
        Self {
            index,
            action: kind.unsubscribe_action(),
            data: Some(Value::from(old_index)),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("client command serialization cannot fail")
    }
}

/// A server-to-client frame on the multiplex channel.
///
/// `data` defaults to `Value::Null` when absent; null payloads are still
/// delivered to the subscriber (an empty list and "no data yet" both look
/// like this on the wire).
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServerFrame {
    /// Index of the subscription this frame belongs to.
    pub index: u64,
    /// When true, `data` holds an error payload and the subscription is over.
    #[serde(default)]
    pub error: bool,
    /// Feed payload, or error payload when `error` is set.
    #[serde(default)]
    pub data: Value,
}

/// Parse one inbound text frame.
///
/// A parse failure is fatal for the whole connection, so it surfaces as
/// [`WsError::Protocol`] rather than a per-subscription error.
pub fn parse_server_frame(text: &str) -> Result<ServerFrame, WsError> {
    serde_json::from_str(text).map_err(|e| WsError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_strings() {
        let cases = [
            (SubscriptionKind::ContainersList, "ContainersList", false),
            (SubscriptionKind::Container, "Container", true),
            (SubscriptionKind::ImagesList, "ImagesList", false),
            (SubscriptionKind::ContainerStats, "ContainerStats", true),
            (SubscriptionKind::SystemStats, "SystemStats", true),
        ];
        for (kind, name, wants_arg) in cases {
            assert_eq!(kind.subscribe_action(), format!("subscribeTo{name}"));
            assert_eq!(kind.unsubscribe_action(), format!("unsubscribeTo{name}"));
            assert_eq!(kind.requires_arg(), wants_arg, "{name}");
        }
    }

    #[test]
    fn test_subscribe_command_json() {
        let cmd = ClientCommand::subscribe(0, SubscriptionKind::ContainersList, None);
        assert_eq!(cmd.to_json(), r#"{"index":0,"action":"subscribeToContainersList"}"#);

        let cmd = ClientCommand::subscribe(3, SubscriptionKind::Container, Some(json!("abc123")));
        assert_eq!(
            cmd.to_json(),
            r#"{"index":3,"action":"subscribeToContainer","data":"abc123"}"#
        );
    }

    #[test]
    fn test_unsubscribe_carries_old_index_as_data() {
        let cmd = ClientCommand::unsubscribe(5, SubscriptionKind::ContainerStats, 2);
        assert_eq!(
            cmd.to_json(),
            r#"{"index":5,"action":"unsubscribeToContainerStats","data":2}"#
        );
    }

    #[test]
    fn test_parse_server_frame() {
        let frame = parse_server_frame(r#"{"index":1,"data":{"cpu":12}}"#).expect("parse");
        assert_eq!(frame.index, 1);
        assert!(!frame.error);
        assert_eq!(frame.data, json!({"cpu": 12}));
    }

    #[test]
    fn test_parse_error_frame() {
        let frame =
            parse_server_frame(r#"{"index":4,"error":true,"data":"no such container"}"#)
                .expect("parse");
        assert!(frame.error);
        assert_eq!(frame.data, json!("no such container"));
    }

    #[test]
    fn test_parse_frame_without_data_is_null() {
        let frame = parse_server_frame(r#"{"index":0}"#).expect("parse");
        assert_eq!(frame.data, Value::Null);
        assert!(!frame.error);
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        let err = parse_server_frame("not json").err().expect("must fail");
        assert!(matches!(err, WsError::Protocol(_)));
    }
}
