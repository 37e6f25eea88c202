// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A01 RPC payload schema.
//!
//! A01-family appliances (wet-dry vacs, washers) do not wrap RPC in dps
//! 101/102; the payload's `dps` object maps integer data point codes
//! directly to values. Queries list the requested codes under the
//! [`ID_QUERY`] data point and the device answers with one or more
//! messages carrying the queried codes.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::{CodecError, Error};

use super::{Message, MessageProtocol, ProtocolVersion};

/// Data point listing the codes a query requests.
pub const ID_QUERY: u32 = 10_000;

/// Builds an A01 request message from data point values.
///
/// `seq` and `random` are stamped later by the publishing channel.
#[must_use]
pub fn encode_request(params: &BTreeMap<u32, Value>, timestamp: u32) -> Message {
    let mut dps = serde_json::Map::new();
    for (code, value) in params {
        dps.insert(code.to_string(), value.clone());
    }
    let body = json!({ "dps": dps, "t": timestamp });
    Message {
        version: ProtocolVersion::A01,
        seq: 0,
        random: 0,
        timestamp,
        protocol: MessageProtocol::RpcRequest,
        payload: body.to_string().into_bytes(),
    }
}

/// Decodes an A01 response payload into data point values.
///
/// # Errors
///
/// Returns an error when the payload is not a JSON object with a `dps`
/// map of integer codes.
pub fn decode_response(message: &Message) -> Result<BTreeMap<u32, Value>, Error> {
    let body: Value = serde_json::from_slice(&message.payload).map_err(CodecError::Payload)?;
    let dps = body
        .get("dps")
        .and_then(Value::as_object)
        .ok_or_else(|| CodecError::InvalidFrame("A01 payload has no dps object".into()))?;

    let mut values = BTreeMap::new();
    for (key, value) in dps {
        let code: u32 = key
            .parse()
            .map_err(|_| CodecError::InvalidFrame(format!("non-numeric dps code {key}")))?;
        values.insert(code, value.clone());
    }
    Ok(values)
}
