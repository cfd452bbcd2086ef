use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code sent back for server-initiated requests this client cannot serve.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub struct OutboundRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

#[derive(Debug, Serialize)]
pub struct OutboundNotification<'a> {
    pub method: &'a str,
    pub params: &'a Value,
}

#[derive(Debug, Serialize)]
pub struct OutboundErrorResponse<'a> {
    pub id: &'a Value,
    pub error: RpcError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One classified line from the child's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// What subscribers see: every notification plus every server request that
/// was answered with `METHOD_NOT_FOUND`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanionMessage {
    pub method: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

/// Returns `None` for anything that is not protocol traffic.
pub fn classify(line: &str) -> Option<Inbound> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let Value::Object(mut message) = serde_json::from_str::<Value>(trimmed).ok()? else {
        return None;
    };

    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let id = message.remove("id").filter(|id| !id.is_null());

    if let Some(id) = id {
        if message.contains_key("result") || message.contains_key("error") {
            let id = numeric_id(&id)?;
            let outcome = match message.remove("error").filter(|error| !error.is_null()) {
                Some(error) => Err(parse_error(error)),
                None => Ok(message.remove("result").unwrap_or(Value::Null)),
            };
            return Some(Inbound::Response { id, outcome });
        }
        let method = method?;
        return Some(Inbound::ServerRequest {
            id,
            method,
            params: message.remove("params").unwrap_or(Value::Null),
        });
    }

    Some(Inbound::Notification {
        method: method?,
        params: message.remove("params").unwrap_or(Value::Null),
    })
}

fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
}

fn parse_error(raw: Value) -> RpcError {
    match serde_json::from_value::<RpcError>(raw.clone()) {
        Ok(error) => error,
        Err(_) => RpcError {
            code: 0,
            message: raw.as_str().map(ToString::to_string).unwrap_or_else(|| raw.to_string()),
            data: None,
        },
    }
}

pub fn method_not_found(id: &Value, method: &str) -> String {
    let response = OutboundErrorResponse {
        id,
        error: RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("client does not handle server request '{}'", method),
            data: None,
        },
    };
    serde_json::to_string(&response).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_responses_and_errors() {
        assert_eq!(
            classify(r#"{"id":3,"result":{"ok":true}}"#),
            Some(Inbound::Response {
                id: 3,
                outcome: Ok(json!({ "ok": true }))
            })
        );
        assert_eq!(
            classify(r#"{"id":"4","error":{"code":-32000,"message":"boom","data":{"why":1}}}"#),
            Some(Inbound::Response {
                id: 4,
                outcome: Err(RpcError {
                    code: -32000,
                    message: "boom".to_string(),
                    data: Some(json!({ "why": 1 })),
                })
            })
        );
    }

    #[test]
    fn id_with_method_is_a_server_request() {
        let inbound = classify(r#"{"id":"srv-1","method":"applyPatchApproval","params":{"x":1}}"#);
        assert_eq!(
            inbound,
            Some(Inbound::ServerRequest {
                id: json!("srv-1"),
                method: "applyPatchApproval".to_string(),
                params: json!({ "x": 1 }),
            })
        );
    }

    #[test]
    fn notifications_and_noise() {
        assert_eq!(
            classify(r#"{"method":"turn/started","params":{"threadId":"t"}}"#),
            Some(Inbound::Notification {
                method: "turn/started".to_string(),
                params: json!({ "threadId": "t" }),
            })
        );
        assert_eq!(classify("starting codex app-server..."), None);
        assert_eq!(classify("{not json"), None);
        assert_eq!(classify(r#"{"id":1}"#), None);
        assert_eq!(classify("[1,2]"), None);
    }

    #[test]
    fn outbound_fields_keep_protocol_order() {
        let params = json!({ "a": 1 });
        let line = serde_json::to_string(&OutboundRequest {
            id: 7,
            method: "thread/start",
            params: &params,
        })
        .expect("encode");
        assert_eq!(line, r#"{"id":7,"method":"thread/start","params":{"a":1}}"#);

        let reply: Value = serde_json::from_str(&method_not_found(&json!(9), "x")).expect("decode");
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }
}
