//! Wire transports for the appliance API
//!
//! Two transports carry the same logical method+parameters contract: a
//! stateless HTTPS request/response, and a persistent connection with
//! length-prefixed JSON frames. Remote error envelopes are classified into
//! the crate error taxonomy here and nowhere else.

use crate::config::ApiConfig;
use crate::error::{VolumeError, VolumeResult};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One logical remote call. Implementations perform no retries; the API
/// client owns the retry policy.
pub trait ApiTransport: Send + Sync {
    /// Execute `method` with `params`, returning the result payload.
    fn call(&self, method: &str, params: &Value) -> VolumeResult<Value>;

    /// Whether [`ApiTransport::call_batch`] collapses into one round trip.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Execute several independent calls. Default: sequential.
    fn call_batch(&self, calls: &[(String, Value)]) -> VolumeResult<Vec<Value>> {
        calls
            .iter()
            .map(|(method, params)| self.call(method, params))
            .collect()
    }
}

/// Map a remote error envelope onto the crate taxonomy.
pub fn classify_remote_error(method: &str, code: i64, message: &str) -> VolumeError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("already exists") || code == 409 || code == 17 {
        return VolumeError::conflict(message.to_string());
    }
    if lower.contains("does not exist") || lower.contains("not found") || code == 404 || code == 2 {
        return VolumeError::absent(message.to_string());
    }
    if code == 429 || code == 408 || lower.contains("rate limit") || lower.contains("timed out") {
        return VolumeError::transient(method.to_string(), message.to_string());
    }
    if code == 401 || code == 403 {
        return VolumeError::validation("auth", message.to_string());
    }
    if code == 400 || code == 422 || code == 22 {
        return VolumeError::validation(method.to_string(), message.to_string());
    }

    VolumeError::Api {
        method: method.to_string(),
        code,
        message: message.to_string(),
    }
}

/// Pull the result out of a `{"result": ...}` / `{"error": {...}}` envelope.
fn unwrap_envelope(method: &str, body: Value) -> VolumeResult<Value> {
    if let Some(error) = body.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error");
        return Err(classify_remote_error(method, code, message));
    }
    match body {
        Value::Object(mut map) if map.contains_key("result") => {
            Ok(map.remove("result").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

/// Stateless request/response transport over HTTPS.
pub struct RestTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl RestTransport {
    pub fn new(config: &ApiConfig) -> VolumeResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.call_timeout_secs))
            .build()
            .map_err(|e| VolumeError::transient("client setup", e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

impl ApiTransport for RestTransport {
    fn call(&self, method: &str, params: &Value) -> VolumeResult<Value> {
        let request = json!({
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| {
                // Connect failures and client-side timeouts are retryable.
                VolumeError::transient(method.to_string(), e.to_string())
            })?;

        let status = response.status().as_u16() as i64;
        let body: Value = response
            .json()
            .map_err(|e| VolumeError::transient(method.to_string(), e.to_string()))?;

        if !(200..300).contains(&status) {
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("HTTP error");
            return Err(match status {
                429 | 408 | 500..=599 => {
                    VolumeError::transient(method.to_string(), format!("HTTP {}: {}", status, message))
                }
                _ => classify_remote_error(method, status, message),
            });
        }

        unwrap_envelope(method, body)
    }
}

/// Persistent connection transport with `[u32 BE length][JSON]` frames.
pub struct SocketTransport {
    endpoint: String,
    api_key: String,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
}

impl SocketTransport {
    pub fn new(config: &ApiConfig) -> VolumeResult<Self> {
        let transport = Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.call_timeout_secs),
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        Ok(transport)
    }

    fn connect(&self) -> VolumeResult<TcpStream> {
        let addr = self
            .endpoint
            .to_socket_addrs()
            .map_err(|e| VolumeError::transient("connect", e.to_string()))?
            .next()
            .ok_or_else(|| {
                VolumeError::validation("endpoint", format!("unresolvable: {}", self.endpoint))
            })?;

        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| VolumeError::transient("connect", e.to_string()))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(VolumeError::Io)?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(VolumeError::Io)?;

        log::debug!("connected to appliance at {}", self.endpoint);
        Ok(stream)
    }

    fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
        let length = payload.len() as u32;
        stream.write_all(&length.to_be_bytes())?;
        stream.write_all(payload)?;
        stream.flush()
    }

    fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let length = u32::from_be_bytes(len_buf) as usize;

        let mut data = vec![0u8; length];
        if length > 0 {
            stream.read_exact(&mut data)?;
        }
        Ok(data)
    }

    /// One request/response exchange, reconnecting once on a dead
    /// connection before giving up as transient.
    fn exchange(&self, method: &str, request: &Value) -> VolumeResult<Value> {
        let payload =
            serde_json::to_vec(request).map_err(|e| VolumeError::validation("encode", e.to_string()))?;

        let mut guard = self
            .stream
            .lock()
            .map_err(|_| VolumeError::transient(method.to_string(), "transport lock poisoned"))?;

        for attempt in 0..2 {
            if guard.is_none() {
                *guard = Some(self.connect()?);
            }
            let Some(stream) = guard.as_mut() else {
                continue;
            };

            let result = Self::write_frame(stream, &payload)
                .and_then(|_| Self::read_frame(stream));

            match result {
                Ok(frame) => {
                    let body: Value = serde_json::from_slice(&frame).map_err(|e| {
                        VolumeError::transient(method.to_string(), format!("bad frame: {}", e))
                    })?;
                    return unwrap_envelope(method, body);
                }
                Err(e) => {
                    // Stale connection; drop it and retry once.
                    *guard = None;
                    if attempt == 1 {
                        return Err(VolumeError::transient(method.to_string(), e.to_string()));
                    }
                    log::debug!("reconnecting to {} after {}", self.endpoint, e);
                }
            }
        }
        Err(VolumeError::transient(
            method.to_string(),
            "connection retries exhausted",
        ))
    }
}

impl ApiTransport for SocketTransport {
    fn call(&self, method: &str, params: &Value) -> VolumeResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "id": id,
            "token": self.api_key,
            "method": method,
            "params": params,
        });
        self.exchange(method, &request)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn call_batch(&self, calls: &[(String, Value)]) -> VolumeResult<Vec<Value>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let items: Vec<Value> = calls
            .iter()
            .map(|(method, params)| json!({"method": method, "params": params}))
            .collect();
        let request = json!({
            "id": id,
            "token": self.api_key,
            "method": "core.batch",
            "params": items,
        });

        let result = self.exchange("core.batch", &request)?;
        let items = result
            .as_array()
            .ok_or_else(|| VolumeError::transient("core.batch", "non-array batch result"))?;

        let mut results = Vec::with_capacity(items.len());
        for (item, (method, _)) in items.iter().zip(calls) {
            results.push(unwrap_envelope(method, item.clone())?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_conflict() {
        let err = classify_remote_error("zfs.dataset.create", 0, "dataset already exists");
        assert!(err.is_conflict());
        let err = classify_remote_error("iscsi.targetextent.create", 409, "duplicate");
        assert!(err.is_conflict());
    }

    #[test]
    fn test_classify_absent() {
        let err = classify_remote_error("zfs.dataset.delete", 0, "dataset does not exist");
        assert!(err.is_absent());
        let err = classify_remote_error("iscsi.extent.delete", 404, "gone");
        assert!(err.is_absent());
    }

    #[test]
    fn test_classify_transient() {
        assert!(classify_remote_error("core.ping", 429, "rate limit exceeded").is_transient());
        assert!(classify_remote_error("core.ping", 0, "request timed out").is_transient());
    }

    #[test]
    fn test_classify_validation_not_retried() {
        let err = classify_remote_error("zfs.dataset.create", 422, "invalid name");
        assert!(matches!(err, VolumeError::Validation { .. }));
        let err = classify_remote_error("core.ping", 401, "bad token");
        assert!(matches!(err, VolumeError::Validation { .. }));
    }

    #[test]
    fn test_unwrap_envelope() {
        let ok = unwrap_envelope("m", json!({"result": [1, 2]})).unwrap();
        assert_eq!(ok, json!([1, 2]));

        let err = unwrap_envelope(
            "m",
            json!({"error": {"code": 404, "message": "not found"}}),
        )
        .unwrap_err();
        assert!(err.is_absent());

        // Bare payloads pass through unchanged
        let bare = unwrap_envelope("m", json!([{"name": "x"}])).unwrap();
        assert_eq!(bare, json!([{"name": "x"}]));
    }
}
