// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! B01 RPC payload schema.
//!
//! B01-family devices correlate by a string `msgId` instead of a numeric
//! request id, and report failures through a numeric `code` field (zero
//! means success). The request body lives under a caller-chosen integer
//! data point; response bodies arrive as JSON strings inside the `dps`
//! map.

use serde_json::{Value, json};

use crate::error::{CodecError, Error};

use super::{Message, MessageProtocol, ProtocolVersion};

/// One decoded B01 response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct B01Response {
    /// The correlation id echoed from the request.
    pub msg_id: String,
    /// Device status code; zero means success.
    pub code: i64,
    /// The result payload, if any.
    pub data: Value,
}

/// Builds a B01 request message.
///
/// `seq` and `random` are stamped later by the publishing channel.
#[must_use]
pub fn encode_request(
    dps: u32,
    command: &str,
    params: &Value,
    msg_id: &str,
    timestamp: u32,
) -> Message {
    let inner = json!({
        "msgId": msg_id,
        "method": command,
        "params": params,
    });
    let body = json!({
        "dps": { (dps.to_string()): inner.to_string() },
        "t": timestamp,
    });
    Message {
        version: ProtocolVersion::B01,
        seq: 0,
        random: 0,
        timestamp,
        protocol: MessageProtocol::RpcRequest,
        payload: body.to_string().into_bytes(),
    }
}

/// Decodes every response body in a B01 payload.
///
/// Entries without a `msgId` (unsolicited telemetry) are skipped; the
/// caller matches the returned bodies against its pending id.
///
/// # Errors
///
/// Returns an error when the payload is not a JSON object with a `dps`
/// map.
pub fn decode_response(message: &Message) -> Result<Vec<B01Response>, Error> {
    let body: Value = serde_json::from_slice(&message.payload).map_err(CodecError::Payload)?;
    let dps = body
        .get("dps")
        .and_then(Value::as_object)
        .ok_or_else(|| CodecError::InvalidFrame("B01 payload has no dps object".into()))?;

    let mut responses = Vec::new();
    for value in dps.values() {
        // Response bodies are JSON strings; raw telemetry values may sit
        // alongside them and are ignored here.
        let inner: Value = match value {
            Value::String(s) => match serde_json::from_str(s) {
                Ok(inner) => inner,
                Err(_) => continue,
            },
            Value::Object(_) => value.clone(),
            _ => continue,
        };
        let Some(msg_id) = inner.get("msgId").and_then(Value::as_str) else {
            continue;
        };
        responses.push(B01Response {
            msg_id: msg_id.to_string(),
            code: inner.get("code").and_then(Value::as_i64).unwrap_or(0),
            data: inner.get("data").cloned().unwrap_or(Value::Null),
        });
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wraps_inner_body() {
        let message = encode_request(
            101,
            "prop.get",
            &json!(["status"]),
            "123456789012",
            1_700_000_000,
        );
        assert_eq!(message.version, ProtocolVersion::B01);

        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        let inner: Value = serde_json::from_str(body["dps"]["101"].as_str().unwrap()).unwrap();
        assert_eq!(inner["msgId"], "123456789012");
        assert_eq!(inner["method"], "prop.get");
        assert_eq!(inner["params"], json!(["status"]));
    }

    #[test]
    fn decode_matches_msg_id() {
        let inner = json!({"msgId": "42", "code": 0, "data": {"battery": 80}}).to_string();
        let payload = json!({"dps": {"102": inner}, "t": 1}).to_string();
        let message = Message {
            version: ProtocolVersion::B01,
            seq: 0,
            random: 0,
            timestamp: 1,
            protocol: MessageProtocol::RpcResponse,
            payload: payload.into_bytes(),
        };

        let responses = decode_response(&message).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].msg_id, "42");
        assert_eq!(responses[0].code, 0);
        assert_eq!(responses[0].data["battery"], 80);
    }

    #[test]
    fn decode_skips_raw_telemetry_values() {
        let inner = json!({"msgId": "42", "code": 1}).to_string();
        let payload = json!({"dps": {"1": 75, "2": "not json", "102": inner}}).to_string();
        let message = Message {
            version: ProtocolVersion::B01,
            seq: 0,
            random: 0,
            timestamp: 1,
            protocol: MessageProtocol::RpcResponse,
            payload: payload.into_bytes(),
        };

        let responses = decode_response(&message).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].code, 1);
        assert_eq!(responses[0].data, Value::Null);
    }

    #[test]
    fn decode_without_dps_fails() {
        let message = Message {
            version: ProtocolVersion::B01,
            seq: 0,
            random: 0,
            timestamp: 1,
            protocol: MessageProtocol::RpcResponse,
            payload: br#"{"t":1}"#.to_vec(),
        };
        assert!(decode_response(&message).is_err());
    }
}
