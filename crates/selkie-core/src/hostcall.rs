//! Host-call payload formats
//!
//! Names and payload layouts of the host functions exposed to actor user
//! code, plus the reserved lifecycle operations. The formats are part of
//! the module ABI and must not change shape.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// =============================================================================
// Operation Names
// =============================================================================

/// Reserved operation invoked once after instantiation, before any other
/// operation
pub const STARTUP_OPERATION: &str = "__startup__";

/// Reserved operation invoked on removal; no operation starts after it
pub const SHUTDOWN_OPERATION: &str = "__shutdown__";

/// Host function: write a key/value pair into the actor's KV
pub const KV_PUT_OPERATION: &str = "kv.put";

/// Host function: read a value from the actor's KV
pub const KV_GET_OPERATION: &str = "kv.get";

/// Host function: create another actor
pub const ACTOR_CREATE_OPERATION: &str = "actor.create";

/// Host function: invoke another actor
pub const ACTOR_INVOKE_OPERATION: &str = "actor.invoke";

/// Host function: schedule a one-shot future invocation
pub const SCHEDULE_INVOKE_OPERATION: &str = "schedule.invoke";

// =============================================================================
// kv.put / kv.get Payloads
// =============================================================================

/// Encode a `kv.put` payload: `u32_be key_len || key || value`
pub fn encode_kv_put(key: &[u8], value: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    Bytes::from(out)
}

/// Split a `kv.put` payload into its key and value
pub fn extract_kv_put(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() < 4 {
        return Err(Error::MalformedPayload {
            reason: format!("kv.put payload too short: {} bytes", payload.len()),
        });
    }

    let key_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let rest = &payload[4..];
    if rest.len() < key_len {
        return Err(Error::MalformedPayload {
            reason: format!(
                "kv.put payload declares key of {} bytes but only {} remain",
                key_len,
                rest.len()
            ),
        });
    }

    Ok(rest.split_at(key_len))
}

/// Encode a `kv.get` result: `0x00` when absent, `0x01 || value` when found
pub fn encode_kv_get_result(value: Option<&[u8]>) -> Bytes {
    match value {
        None => Bytes::from_static(&[0]),
        Some(v) => {
            let mut out = Vec::with_capacity(1 + v.len());
            out.push(1);
            out.extend_from_slice(v);
            Bytes::from(out)
        }
    }
}

// =============================================================================
// JSON Host Call Requests
// =============================================================================

/// `actor.create` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActorCall {
    pub actor_id: String,
    /// Omitted when the actor forks itself: the new actor reuses the
    /// caller's module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
}

/// `actor.invoke` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeActorCall {
    /// Omitted in `schedule.invoke` when the actor schedules itself.
    #[serde(default)]
    pub actor_id: String,
    pub operation: String,
    #[serde(default = "Bytes::new", with = "crate::types::b64")]
    pub payload: Bytes,
}

/// `schedule.invoke` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInvokeCall {
    pub after_millis: u64,
    pub invoke: InvokeActorCall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_put_roundtrip() {
        let payload = encode_kv_put(b"count", b"41");
        let (key, value) = extract_kv_put(&payload).unwrap();
        assert_eq!(key, b"count");
        assert_eq!(value, b"41");
    }

    #[test]
    fn test_kv_put_empty_value() {
        let payload = encode_kv_put(b"k", b"");
        let (key, value) = extract_kv_put(&payload).unwrap();
        assert_eq!(key, b"k");
        assert!(value.is_empty());
    }

    #[test]
    fn test_kv_put_malformed() {
        assert!(extract_kv_put(&[0, 0]).is_err());
        // Declared key length exceeds available bytes.
        assert!(extract_kv_put(&[0, 0, 0, 10, b'a', b'b']).is_err());
    }

    #[test]
    fn test_kv_get_result_encoding() {
        assert_eq!(encode_kv_get_result(None).as_ref(), &[0]);
        assert_eq!(encode_kv_get_result(Some(b"v")).as_ref(), &[1, b'v']);
    }

    #[test]
    fn test_schedule_invoke_call_self_target() {
        // actor_id omitted means "schedule against myself".
        let call: ScheduleInvokeCall = serde_json::from_str(
            r#"{"after_millis": 50, "invoke": {"operation": "tick", "payload": "eA=="}}"#,
        )
        .unwrap();
        assert_eq!(call.after_millis, 50);
        assert!(call.invoke.actor_id.is_empty());
        assert_eq!(call.invoke.operation, "tick");
        assert_eq!(call.invoke.payload.as_ref(), b"x");
    }
}
