//! Control protocol between the manager and its workers.
//!
//! Messages are JSON-serialized and newline-delimited; the manager writes to
//! a worker's stdin and reads from its stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkerId;
use crate::address::WorkerAddress;

/// What a broadcast is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Shared counters changed; receivers re-read shared memory.
    #[serde(rename = "metrics.updated")]
    MetricsUpdated,
    /// Ask the aggregator for its latest snapshot (answered with a `response`).
    #[serde(rename = "metrics.query")]
    MetricsQuery,
}

/// A control message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Worker → manager, once its private listener is bound.
    Listening {
        /// Address the worker actually bound.
        address: WorkerAddress,
    },

    /// Worker → manager → one target, or every other worker.
    Broadcast {
        action: Action,
        #[serde(default)]
        payload: Value,
        /// Deliver only to this worker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_worker_id: Option<WorkerId>,
        /// Sender, stamped by the manager on delivery.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_worker_id: Option<WorkerId>,
    },

    /// Reply routed back to the worker that owns the exchange.
    Response {
        owner_worker_id: WorkerId,
        #[serde(default)]
        payload: Value,
    },

    /// Manager → worker: close the listener and exit.
    Shutdown,
}

impl ControlMessage {
    /// Create a broadcast, optionally aimed at a single worker.
    pub fn broadcast(action: Action, payload: Value, target: Option<WorkerId>) -> Self {
        Self::Broadcast {
            action,
            payload,
            target_worker_id: target,
            owner_worker_id: None,
        }
    }

    /// Create a response for `owner`.
    pub fn response(owner: WorkerId, payload: Value) -> Self {
        Self::Response {
            owner_worker_id: owner,
            payload,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Listening { .. } => "listening",
            Self::Broadcast { .. } => "broadcast",
            Self::Response { .. } => "response",
            Self::Shutdown => "shutdown",
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listening_wire_format() {
        let msg = ControlMessage::Listening {
            address: WorkerAddress::Tcp {
                addr: "127.0.0.1:5000".parse().unwrap(),
            },
        };
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            line.trim_end(),
            r#"{"type":"listening","address":{"kind":"tcp","addr":"127.0.0.1:5000"}}"#
        );
        assert_eq!(ControlMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_broadcast_defaults() {
        let parsed = ControlMessage::from_line(r#"{"type":"broadcast","action":"metrics.updated"}"#)
            .unwrap();
        assert_eq!(
            parsed,
            ControlMessage::Broadcast {
                action: Action::MetricsUpdated,
                payload: Value::Null,
                target_worker_id: None,
                owner_worker_id: None,
            }
        );
    }

    #[test]
    fn test_broadcast_omits_absent_ids() {
        let line = ControlMessage::broadcast(Action::MetricsQuery, json!({"request_id": 3}), None)
            .to_line()
            .unwrap();
        assert!(!line.contains("target_worker_id"));
        assert!(!line.contains("owner_worker_id"));
        assert!(line.contains(r#""action":"metrics.query""#));
    }

    #[test]
    fn test_response_roundtrip() {
        let msg = ControlMessage::response(WorkerId(2), json!({"request_id": 1}));
        let parsed = ControlMessage::from_line(&msg.to_line().unwrap()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.kind(), "response");
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = ControlMessage::from_line(r#"{"type":"broadcast","action":"metrics.dance"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_shutdown() {
        let line = ControlMessage::Shutdown.to_line().unwrap();
        assert_eq!(line, "{\"type\":\"shutdown\"}\n");
        assert!(matches!(
            ControlMessage::from_line(&line).unwrap(),
            ControlMessage::Shutdown
        ));
    }
}
