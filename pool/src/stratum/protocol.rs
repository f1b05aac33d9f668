/// Miner protocol message types
///
/// One JSON object per line. Requests carry `{id, method, params}`; replies
/// always carry both `error` and `result`, one of them null.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PoolError;

#[derive(Debug, Clone, PartialEq)]
pub struct StratumRequest {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl StratumRequest {
    /// Pull `id`, `method` and `params` out of a parsed line. Returns the
    /// name of the first missing field instead.
    pub fn from_value(mut value: Value) -> Result<Self, &'static str> {
        let obj = value.as_object_mut().ok_or("id")?;

        let id = match obj.remove("id") {
            Some(id) if !id.is_null() => id,
            _ => return Err("id"),
        };
        let method = match obj.get("method").and_then(|m| m.as_str()) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return Err("method"),
        };
        let params = match obj.remove("params") {
            Some(p) if !p.is_null() => p,
            _ => return Err("params"),
        };

        Ok(Self { id, method, params })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl From<&PoolError> for StratumError {
    fn from(err: &PoolError) -> Self {
        Self {
            code: PoolError::CODE,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Value,
    pub jsonrpc: String,
    pub error: Option<StratumError>,
    pub result: Option<Value>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            error: None,
            result: Some(result),
        }
    }

    pub fn error(id: Value, error: &PoolError) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            error: Some(error.into()),
            result: None,
        }
    }

    pub fn from_result(id: Value, res: Result<Value, PoolError>) -> Self {
        match res {
            Ok(result) => Self::success(id, result),
            Err(e) => Self::error(id, &e),
        }
    }
}

/// Unsolicited server push, e.g. a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumPush {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl StratumPush {
    pub fn job(job: &MinerJob) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: "job".to_string(),
            params: serde_json::to_value(job).unwrap_or(Value::Null),
        }
    }
}

/// Job sent to a miner. The placeholder form only carries empty
/// `blob`, `job_id` and `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MinerJob {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub blob: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_hash: Option<String>,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algo: Option<String>,
    pub target: String,
}

impl MinerJob {
    pub fn placeholder() -> Self {
        Self {
            id: None,
            blob: String::new(),
            seed_hash: None,
            job_id: String::new(),
            algo: None,
            target: String::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.job_id.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionParams {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitParams {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

/// Lenient params decoding: fields of the wrong type read as absent.
pub fn parse_params<T: for<'de> Deserialize<'de> + Default>(params: &Value) -> T {
    serde_json::from_value(params.clone()).unwrap_or_default()
}

/// Reply for a line that looks like an HTTP request instead of JSON.
pub fn http_response(request_line: &str) -> Option<String> {
    if !request_line.starts_with("GET /") {
        return None;
    }
    let version = if request_line.contains("HTTP/1.1") {
        "HTTP/1.1"
    } else if request_line.contains("HTTP/1.0") {
        "HTTP/1.0"
    } else {
        return None;
    };
    Some(format!(
        "{} 200 OK\nContent-Type: text/plain\nContent-Length: 20\n\nmining server online",
        version
    ))
}
