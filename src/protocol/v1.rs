// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! V1 RPC payload schema.
//!
//! V1 devices wrap RPC traffic in data point 101 (requests) and 102
//! (responses): the frame payload is a JSON object whose `dps` entry
//! holds the request or response body as an embedded JSON string.
//! Requests sent over MQTT additionally carry a `security` object so the
//! device can encrypt map data for this client only.

use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use serde_json::{Value, json};

use crate::error::{ApiError, CodecError, Error};

use super::crypto;
use super::{Message, MessageProtocol, ProtocolVersion};

/// Data point carrying RPC requests.
const REQUEST_DP: &str = "101";
/// Data point carrying RPC responses.
const RESPONSE_DP: &str = "102";

/// Map response header: endpoint(8) + zero(8) + request_id_le(2) + zero(6).
const MAP_HEADER_LEN: usize = 24;

/// Well-known V1 command names.
pub mod commands {
    /// Query the device status record.
    pub const GET_STATUS: &str = "get_status";
    /// Query the device's LAN address and signal data.
    pub const GET_NETWORK_INFO: &str = "get_network_info";
    /// Query firmware/feature information reported at startup.
    pub const APP_GET_INIT_STATUS: &str = "app_get_init_status";
    /// Request the current map blob.
    pub const GET_MAP_V1: &str = "get_map_v1";
    /// Query the room id to segment mapping.
    pub const GET_ROOM_MAPPING: &str = "get_room_mapping";
    /// Query the cleaning history summary.
    pub const GET_CLEAN_SUMMARY: &str = "get_clean_summary";
    /// Query the list of stored maps.
    pub const GET_MULTI_MAPS_LIST: &str = "get_multi_maps_list";
    /// Start a cleaning run.
    pub const APP_START: &str = "app_start";
    /// Stop the current run.
    pub const APP_STOP: &str = "app_stop";
    /// Send the device back to the dock.
    pub const APP_CHARGE: &str = "app_charge";
    /// Set the speaker volume.
    pub const CHANGE_SOUND_VOLUME: &str = "change_sound_volume";
}

/// Per-session security material for MQTT RPC.
///
/// The endpoint identifies this client in map responses; the nonce keys
/// the map payload cipher. Both are derived once per client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityData {
    endpoint: String,
    nonce: [u8; 16],
}

impl SecurityData {
    /// Creates security data from explicit parts.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, nonce: [u8; 16]) -> Self {
        Self {
            endpoint: endpoint.into(),
            nonce,
        }
    }

    /// Derives security data from the account crypto key `k`.
    ///
    /// The endpoint is `base64(md5(k)[8..14])`; the nonce is 16 fresh
    /// random bytes.
    #[must_use]
    pub fn generate(k: &str) -> Self {
        let digest = crypto::md5_concat(&[k.as_bytes()]);
        let endpoint = BASE64.encode(&digest[8..14]);
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self { endpoint, nonce }
    }

    /// Returns the 8-character endpoint string.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the session nonce.
    #[must_use]
    pub fn nonce(&self) -> &[u8; 16] {
        &self.nonce
    }

    fn nonce_hex(&self) -> String {
        hex::encode(self.nonce)
    }
}

/// A V1 RPC request before framing.
#[derive(Debug, Clone)]
pub struct RequestMessage<'a> {
    /// Correlation id echoed back in the response.
    pub request_id: u32,
    /// Command name, e.g. `get_status`.
    pub command: &'a str,
    /// Command parameters; `[]` when absent.
    pub params: Option<Value>,
}

impl RequestMessage<'_> {
    /// Serializes the dps-101 payload.
    ///
    /// Including `security` marks the request as MQTT-flavored; local
    /// requests omit it.
    #[must_use]
    pub fn encode_payload(&self, timestamp: u32, security: Option<&SecurityData>) -> Vec<u8> {
        let mut inner = json!({
            "id": self.request_id,
            "method": self.command,
            "params": self.params.clone().unwrap_or_else(|| json!([])),
        });
        if let Some(security) = security {
            inner["security"] = json!({
                "endpoint": security.endpoint(),
                "nonce": security.nonce_hex(),
            });
        }
        let body = json!({
            "dps": { (REQUEST_DP): inner.to_string() },
            "t": timestamp,
        });
        body.to_string().into_bytes()
    }

    /// Builds a framed message carrying this request.
    ///
    /// `seq` and `random` are stamped later by the publishing channel.
    #[must_use]
    pub fn encode_message(
        &self,
        protocol: MessageProtocol,
        timestamp: u32,
        security: Option<&SecurityData>,
    ) -> Message {
        Message {
            version: ProtocolVersion::V1,
            seq: 0,
            random: 0,
            timestamp,
            protocol,
            payload: self.encode_payload(timestamp, security),
        }
    }
}

/// A decoded dps-102 RPC response.
#[derive(Debug)]
pub struct RpcResponse {
    /// The correlation id of the request this answers.
    pub request_id: u32,
    /// The result value, or the API error the device reported.
    pub result: Result<Value, Error>,
}

/// Decodes a V1 RPC response payload.
///
/// # Errors
///
/// Returns an error when the payload is not a dps-102 body or carries no
/// correlation id. API-level errors (`unknown_method`, `retry`) are
/// captured inside [`RpcResponse::result`], not returned here.
pub fn decode_rpc_response(message: &Message) -> Result<RpcResponse, Error> {
    let body: Value = serde_json::from_slice(&message.payload).map_err(CodecError::Payload)?;
    let inner_str = body
        .get("dps")
        .and_then(|dps| dps.get(RESPONSE_DP))
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::InvalidFrame("response payload has no dps 102".into()))?;
    let inner: Value = serde_json::from_str(inner_str).map_err(CodecError::Payload)?;

    let request_id = inner
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| CodecError::InvalidFrame("response carries no request id".into()))?;

    let result = match inner.get("result") {
        Some(Value::String(s)) => match s.as_str() {
            "unknown_method" => Err(Error::Api(ApiError::UnknownMethod)),
            "retry" => Err(Error::DeviceBusy),
            other => Err(Error::Api(ApiError::UnexpectedResult(other.to_string()))),
        },
        Some(value) => Ok(value.clone()),
        None => Ok(Value::Null),
    };

    Ok(RpcResponse { request_id, result })
}

/// A decrypted map payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapResponse {
    /// Correlation id from the map header.
    pub request_id: u16,
    /// The raw, gunzipped map bytes.
    pub data: Vec<u8>,
}

/// Decodes a MAP_RESPONSE payload addressed to this client.
///
/// Returns `Ok(None)` when the endpoint in the header belongs to a
/// different client; such responses must be dropped silently.
///
/// # Errors
///
/// Returns an error when the payload is too short, fails to decrypt, or
/// is not valid gzip.
pub fn decode_map_response(
    security: &SecurityData,
    message: &Message,
) -> Result<Option<MapResponse>, Error> {
    if message.payload.len() < MAP_HEADER_LEN {
        return Err(
            CodecError::InvalidFrame("map response is missing its payload header".into()).into(),
        );
    }
    let (header, ciphertext) = message.payload.split_at(MAP_HEADER_LEN);
    if &header[..8] != security.endpoint().as_bytes() {
        tracing::debug!("Received map response requested by another client, ignoring");
        return Ok(None);
    }
    let request_id = u16::from_le_bytes([header[16], header[17]]);

    let compressed = crypto::decrypt_cbc_raw(ciphertext, security.nonce())?;
    let mut data = Vec::new();
    flate2::read::GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut data)
        .map_err(|err| CodecError::InvalidFrame(format!("map blob is not gzip: {err}")))?;

    Ok(Some(MapResponse { request_id, data }))
}

/// A decoded RPC result with tolerant shape accessors.
///
/// Firmware answers some commands with a bare object and others with a
/// single-element array around that object; callers state the shape they
/// expect and both are accepted.
#[derive(Debug, Clone)]
pub struct RpcValue(Value);

impl RpcValue {
    /// Wraps a raw result value.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Deserializes the result into `T`.
    ///
    /// When the value does not fit `T` directly but is a single-element
    /// array, the element is tried as well, matching firmware that
    /// answers the same command with either shape.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::UnexpectedShape`] when neither shape fits.
    pub fn decode<T: serde::de::DeserializeOwned>(self, command: &str) -> Result<T, Error> {
        let shape_error = |err: serde_json::Error| {
            Error::Api(ApiError::UnexpectedShape {
                command: command.to_string(),
                message: err.to_string(),
            })
        };
        match serde_json::from_value::<T>(self.0.clone()) {
            Ok(decoded) => Ok(decoded),
            Err(direct_err) => match self.0 {
                Value::Array(mut items) if items.len() == 1 => {
                    serde_json::from_value(items.remove(0)).map_err(shape_error)
                }
                _ => Err(shape_error(direct_err)),
            },
        }
    }
}
