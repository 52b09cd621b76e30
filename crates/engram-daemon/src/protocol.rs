//! JSON-RPC 2.0 framing over NDJSON.

use engram_error::EngramError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    #[must_use]
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn fail(id: Value, error: &EngramError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code: error.rpc_code(),
                message: error.to_string(),
                data: Some(Value::String(error.category().to_string())),
            }),
        }
    }
}

/// Parse one NDJSON line into a validated request.
pub fn parse_request(line: &str) -> Result<RpcRequest, EngramError> {
    let request: RpcRequest = serde_json::from_str(line)
        .map_err(|err| EngramError::ParseError(err.to_string()))?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(EngramError::InvalidRequest(format!(
            "jsonrpc must be \"{JSONRPC_VERSION}\", got {:?}",
            request.jsonrpc
        )));
    }
    if request.method.is_empty() {
        return Err(EngramError::InvalidRequest("method must be non-empty".to_string()));
    }
    Ok(request)
}

/// Serialize a response to one NDJSON line (without the newline).
#[must_use]
pub fn encode_response(response: &RpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        // A response that cannot serialize becomes a generic error frame.
        format!(
            "{{\"jsonrpc\":\"{JSONRPC_VERSION}\",\"id\":null,\"error\":{{\"code\":-32099,\"message\":\"response serialization failed\"}}}}"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_request_parses() {
        let request =
            parse_request(r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#).unwrap();
        assert_eq!(request.method, "ping");
        assert_eq!(request.id, Value::from(1));
    }

    #[test]
    fn wrong_version_is_invalid_request() {
        let err = parse_request(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert!(matches!(err, EngramError::InvalidRequest(_)));
        assert_eq!(err.rpc_code(), engram_error::RPC_INVALID_REQUEST);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_request("not json at all").unwrap_err();
        assert!(matches!(err, EngramError::ParseError(_)));
        assert_eq!(err.rpc_code(), engram_error::RPC_PARSE_ERROR);
    }

    #[test]
    fn error_responses_carry_stable_codes() {
        let response = RpcResponse::fail(
            Value::from(7),
            &EngramError::UnknownMethod("nope".to_string()),
        );
        let encoded = encode_response(&response);
        assert!(encoded.contains("-32601"));
        let back: RpcResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back.error.unwrap().code, engram_error::RPC_METHOD_NOT_FOUND);
    }

    #[test]
    fn responses_are_single_line() {
        let response = RpcResponse::ok(Value::from(1), serde_json::json!({"pong": true}));
        assert!(!encode_response(&response).contains('\n'));
    }
}
