// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol for device communication.
//!
//! Devices speak a framed binary protocol carried over two transports:
//! raw TCP on the LAN and length-prefixed payloads inside MQTT publishes.
//! This module provides the frame model ([`Message`]), the two cipher
//! suites (V1 CBC and L01 GCM, in [`crypto`]), the framing codec with a
//! garbage-tolerant streaming decoder ([`codec`]), and the RPC payload
//! schemas layered on top ([`v1`], [`a01`], [`b01`]).

pub mod a01;
pub mod b01;
pub mod codec;
pub mod crypto;
pub mod v1;

pub use codec::{Codec, SessionNonces, StreamDecoder};
pub use v1::SecurityData;

use crate::error::CodecError;

/// Protocol identifiers carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageProtocol {
    /// Local handshake request, sent by the client.
    HelloRequest = 0,
    /// Local handshake response, sent by the device.
    HelloResponse = 1,
    /// Local keepalive request.
    PingRequest = 2,
    /// Local keepalive response.
    PingResponse = 3,
    /// RPC request over the local transport.
    GeneralRequest = 4,
    /// RPC response over the local transport.
    GeneralResponse = 5,
    /// RPC request over MQTT.
    RpcRequest = 101,
    /// RPC response over MQTT.
    RpcResponse = 102,
    /// Map payload response over MQTT.
    MapResponse = 301,
}

impl MessageProtocol {
    /// Returns the wire value of this protocol identifier.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parses a wire protocol identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidFrame`] for unknown values.
    pub fn from_u16(value: u16) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::HelloRequest),
            1 => Ok(Self::HelloResponse),
            2 => Ok(Self::PingRequest),
            3 => Ok(Self::PingResponse),
            4 => Ok(Self::GeneralRequest),
            5 => Ok(Self::GeneralResponse),
            101 => Ok(Self::RpcRequest),
            102 => Ok(Self::RpcResponse),
            301 => Ok(Self::MapResponse),
            other => Err(CodecError::InvalidFrame(format!(
                "unknown protocol {other}"
            ))),
        }
    }
}

/// Protocol version tag carried in the first three bytes of a frame.
///
/// The tag selects the cipher suite: `1.0`, `A01`, and `B01` use the V1
/// CBC suite, `L01` uses AES-GCM keyed with the session nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// The original v1 protocol family.
    V1,
    /// The A01 appliance family (wet-dry vacs, washers).
    A01,
    /// The B01 appliance family.
    B01,
    /// The GCM-encrypted local protocol.
    L01,
}

impl ProtocolVersion {
    /// Returns the three-byte wire tag.
    #[must_use]
    pub fn tag(self) -> [u8; 3] {
        match self {
            Self::V1 => *b"1.0",
            Self::A01 => *b"A01",
            Self::B01 => *b"B01",
            Self::L01 => *b"L01",
        }
    }

    /// Parses a three-byte wire tag, returning `None` for unknown tags.
    #[must_use]
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"1.0" => Some(Self::V1),
            b"A01" => Some(Self::A01),
            b"B01" => Some(Self::B01),
            b"L01" => Some(Self::L01),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = self.tag();
        // Tags are fixed ASCII.
        f.write_str(std::str::from_utf8(&tag).unwrap_or("?"))
    }
}

/// One framed protocol message.
///
/// `seq` is monotonic per channel, `random` is regenerated per message,
/// and `timestamp` is wall-clock seconds; all three participate in
/// payload encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol version tag, selecting the cipher suite.
    pub version: ProtocolVersion,
    /// Per-channel monotonic sequence number.
    pub seq: u32,
    /// Per-message random value.
    pub random: u32,
    /// Wall-clock seconds at encode time.
    pub timestamp: u32,
    /// Protocol identifier.
    pub protocol: MessageProtocol,
    /// Decrypted payload bytes; empty for handshake and ping frames.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message with the given protocol and payload.
    ///
    /// The remaining fields start zeroed and are stamped by the channel
    /// that publishes the message.
    #[must_use]
    pub fn new(protocol: MessageProtocol, payload: Vec<u8>) -> Self {
        Self {
            version: ProtocolVersion::V1,
            seq: 0,
            random: 0,
            timestamp: 0,
            protocol,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trip() {
        for protocol in [
            MessageProtocol::HelloRequest,
            MessageProtocol::HelloResponse,
            MessageProtocol::PingRequest,
            MessageProtocol::PingResponse,
            MessageProtocol::GeneralRequest,
            MessageProtocol::GeneralResponse,
            MessageProtocol::RpcRequest,
            MessageProtocol::RpcResponse,
            MessageProtocol::MapResponse,
        ] {
            assert_eq!(MessageProtocol::from_u16(protocol.as_u16()).unwrap(), protocol);
        }
    }

    #[test]
    fn unknown_protocol_rejected() {
        assert!(MessageProtocol::from_u16(999).is_err());
    }

    #[test]
    fn version_tag_round_trip() {
        for version in [
            ProtocolVersion::V1,
            ProtocolVersion::A01,
            ProtocolVersion::B01,
            ProtocolVersion::L01,
        ] {
            assert_eq!(ProtocolVersion::from_tag(&version.tag()), Some(version));
        }
        assert_eq!(ProtocolVersion::from_tag(b"X01"), None);
    }

    #[test]
    fn new_message_defaults() {
        let msg = Message::new(MessageProtocol::RpcRequest, b"data".to_vec());
        assert_eq!(msg.version, ProtocolVersion::V1);
        assert_eq!(msg.seq, 0);
        assert_eq!(msg.payload, b"data");
    }
}
