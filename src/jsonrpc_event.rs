use crate::errors::{ProtocolError, WireCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stratum request methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StratumMethod {
    Subscribe,
    ExtranonceSubscribe,
    Authorize,
    Submit,
    Other(String),
}

impl From<&str> for StratumMethod {
    fn from(s: &str) -> Self {
        match s {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.extranonce.subscribe" => StratumMethod::ExtranonceSubscribe,
            "mining.authorize" => StratumMethod::Authorize,
            "mining.submit" => StratumMethod::Submit,
            other => StratumMethod::Other(other.to_string()),
        }
    }
}

/// A request from a miner. The id is kept as a raw JSON value so replies echo
/// it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcEvent {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl JsonRpcEvent {
    pub fn method_enum(&self) -> StratumMethod {
        StratumMethod::from(self.method.as_str())
    }
}

/// A response to a miner request. `result` and `error` are always present on
/// the wire (`null` when absent); ASIC firmwares are picky about this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self { id, result, error: Value::Null }
    }

    pub fn error(id: Value, code: WireCode) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Value::Array(vec![Value::from(code.code()), Value::String(code.message().to_string()), Value::Null]),
        }
    }
}

/// A server-initiated event (`mining.notify`, `mining.set_difficulty`,
/// `mining.set_extranonce`). No id field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Vec<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self { method: method.to_string(), params }
    }
}

/// Parse and validate one request line: a JSON object with a numeric `id`, a
/// string `method` and an array `params`. Anything else is a framing
/// violation and costs the sender its connection.
pub fn unmarshal_event(line: &str) -> Result<JsonRpcEvent, ProtocolError> {
    let value: Value = serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value.as_object().ok_or_else(|| ProtocolError::Malformed("request is not an object".to_string()))?;

    let id = obj.get("id").cloned().ok_or_else(|| ProtocolError::Malformed("missing id".to_string()))?;
    if !id.is_number() {
        return Err(ProtocolError::Malformed("id must be a number".to_string()));
    }
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("method must be a string".to_string()))?
        .to_string();
    let params = match obj.get("params") {
        Some(Value::Array(params)) => params.clone(),
        Some(_) => return Err(ProtocolError::Malformed("params must be an array".to_string())),
        None => return Err(ProtocolError::Malformed("missing params".to_string())),
    };

    Ok(JsonRpcEvent { id, method, params })
}
