//! RPC frame envelope and command names.
//!
//! Every message is a JSON envelope. Three command families share it: calls
//! (one request, one response), response streams (`cont` chunks terminated
//! by a final frame), and router housekeeping (authenticate, announce,
//! dispose, waitforroute).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The empty route addresses the local default service.
pub const DEFAULT_ROUTE: &str = "";
/// Route bound to the desktop UI connection.
pub const ELECTRON_ROUTE: &str = "electron";

pub const CMD_AUTHENTICATE: &str = "authenticate";
pub const CMD_AUTHENTICATE_TOKEN: &str = "authenticatetoken";
pub const CMD_ANNOUNCE: &str = "announce";
pub const CMD_DISPOSE: &str = "dispose";
pub const CMD_EVENT_RECV: &str = "eventrecv";
pub const CMD_WAIT_FOR_ROUTE: &str = "waitforroute";
pub const CMD_STREAM_TEST: &str = "streamtest";

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reqid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resid: String,
    /// Caller-chosen timeout in milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authtoken: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// More chunks follow on this response stream.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cont: bool,
    /// Cancellation of the request identified by `reqid`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
}

impl RpcMessage {
    pub fn command(command: &str, data: Option<Value>) -> Self {
        Self {
            command: command.to_string(),
            data,
            ..Default::default()
        }
    }

    pub fn is_response(&self) -> bool {
        !self.resid.is_empty()
    }

    /// Build the response frame for this request, addressed back at its
    /// source.
    pub fn response(&self, data: Option<Value>) -> RpcMessage {
        RpcMessage {
            resid: self.reqid.clone(),
            route: self.source.clone(),
            data,
            ..Default::default()
        }
    }

    pub fn error_response(&self, error: impl Into<String>) -> RpcMessage {
        RpcMessage {
            resid: self.reqid.clone(),
            route: self.source.clone(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn chunk_response(&self, data: Option<Value>) -> RpcMessage {
        RpcMessage {
            resid: self.reqid.clone(),
            route: self.source.clone(),
            data,
            cont: true,
            ..Default::default()
        }
    }
}

/// Identity a peer proves at connect time: which remote connection (if any)
/// and which block it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conn: String,
    #[serde(rename = "blockid", default, skip_serializing_if = "String::is_empty")]
    pub block_id: String,
}

impl RpcContext {
    /// The route id a context binds to.
    pub fn route_id(&self) -> Option<String> {
        if !self.conn.is_empty() {
            return Some(format!("conn:{}", self.conn));
        }
        if !self.block_id.is_empty() {
            return Some(format!("proc:{}", self.block_id));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_roundtrip_minimal() {
        let msg = RpcMessage::command("getmeta", Some(json!({"oref": "block:x"})));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("reqid"));
        assert!(!json.contains("cancel"));
        let back: RpcMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_response_addressing() {
        let req = RpcMessage {
            command: "message".into(),
            reqid: "r1".into(),
            source: "conn:host".into(),
            ..Default::default()
        };
        let resp = req.response(Some(json!(1)));
        assert_eq!(resp.resid, "r1");
        assert_eq!(resp.route, "conn:host");
        assert!(!resp.cont);
        let chunk = req.chunk_response(None);
        assert!(chunk.cont);
        let err = req.error_response("boom");
        assert_eq!(err.error, "boom");
    }

    #[test]
    fn test_rpc_context_route_id() {
        assert_eq!(
            RpcContext {
                conn: "user@host".into(),
                ..Default::default()
            }
            .route_id(),
            Some("conn:user@host".into())
        );
        assert_eq!(
            RpcContext {
                block_id: "b1".into(),
                ..Default::default()
            }
            .route_id(),
            Some("proc:b1".into())
        );
        assert_eq!(RpcContext::default().route_id(), None);
    }
}
