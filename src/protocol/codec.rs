// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame encoding and decoding.
//!
//! Frame layout, big-endian:
//!
//! ```text
//! offset  size  field
//! 0       3     version tag ("1.0", "A01", "B01", "L01")
//! 3       4     seq
//! 7       4     random
//! 11      4     timestamp (unix seconds)
//! 15      2     protocol
//! 17      2     payload length
//! 19      N     encrypted payload
//! 19+N    4     crc32 over bytes [0, 19+N)
//! ```
//!
//! MQTT publishes carry a 4-byte big-endian length prefix before each
//! frame. The local TCP stream has no prefix; frames may be concatenated
//! in one segment and some firmware prepends garbage bytes, so the
//! [`StreamDecoder`] scans forward byte-by-byte until a tag, length, and
//! checksum agree.

use crate::error::CodecError;

use super::crypto::{self, L01KeyMaterial};
use super::{Message, MessageProtocol, ProtocolVersion};

/// Frame header length in bytes.
const HEADER_LEN: usize = 19;
/// Smallest possible frame: header plus trailing CRC, no payload.
const MIN_FRAME_LEN: usize = HEADER_LEN + 4;

/// The nonce pair negotiated by the HELLO handshake.
///
/// `connect` is chosen by the client, `ack` by the device; both feed the
/// L01 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionNonces {
    /// Client-chosen nonce from the HELLO request.
    pub connect: u32,
    /// Device-chosen nonce from the HELLO response.
    pub ack: u32,
}

/// Encoder/decoder for framed messages under one device key.
#[derive(Debug, Clone)]
pub struct Codec {
    local_key: String,
    nonces: Option<SessionNonces>,
}

impl Codec {
    /// Creates a codec for the given device key.
    #[must_use]
    pub fn new(local_key: impl Into<String>) -> Self {
        Self {
            local_key: local_key.into(),
            nonces: None,
        }
    }

    /// Creates a codec carrying the session nonces for the L01 suite.
    #[must_use]
    pub fn with_nonces(local_key: impl Into<String>, nonces: SessionNonces) -> Self {
        Self {
            local_key: local_key.into(),
            nonces: Some(nonces),
        }
    }

    /// Returns the session nonces, if negotiated.
    #[must_use]
    pub fn nonces(&self) -> Option<SessionNonces> {
        self.nonces
    }

    /// Encodes one message into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the encrypted payload exceeds the 16-bit
    /// length field or the L01 suite is selected without session nonces.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let ciphertext = if message.payload.is_empty() {
            Vec::new()
        } else {
            match message.version {
                ProtocolVersion::V1 | ProtocolVersion::A01 | ProtocolVersion::B01 => {
                    crypto::encrypt_v1(&message.payload, &self.local_key, message.timestamp)
                }
                ProtocolVersion::L01 => {
                    let nonces = self.nonces.ok_or(CodecError::MissingNonces)?;
                    crypto::encrypt_l01(&message.payload, &self.l01_material(message, nonces))?
                }
            }
        };

        let payload_len = u16::try_from(ciphertext.len()).map_err(|_| {
            CodecError::InvalidFrame(format!("payload too large: {} bytes", ciphertext.len()))
        })?;

        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + ciphertext.len());
        frame.extend_from_slice(&message.version.tag());
        frame.extend_from_slice(&message.seq.to_be_bytes());
        frame.extend_from_slice(&message.random.to_be_bytes());
        frame.extend_from_slice(&message.timestamp.to_be_bytes());
        frame.extend_from_slice(&message.protocol.as_u16().to_be_bytes());
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        Ok(frame)
    }

    /// Encodes one message for MQTT, with the 4-byte length prefix.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`encode`](Self::encode).
    pub fn encode_mqtt(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let frame = self.encode(message)?;
        let mut out = Vec::with_capacity(frame.len() + 4);
        let len = u32::try_from(frame.len())
            .map_err(|_| CodecError::InvalidFrame("frame too large".into()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&frame);
        Ok(out)
    }

    /// Decodes every complete frame in `data`.
    ///
    /// Garbage bytes before a frame are skipped; a trailing partial frame
    /// is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error when a structurally valid frame fails to decrypt,
    /// such as when the session nonces do not match.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Message>, CodecError> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match self.extract_frame(&data[offset..]) {
                Extracted::NeedMore => break,
                Extracted::Skip(n) => offset += n,
                Extracted::Frame { consumed, result } => {
                    messages.push(result?);
                    offset += consumed;
                }
            }
        }
        Ok(messages)
    }

    /// Decodes every length-prefixed frame in an MQTT payload.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated prefixes or undecodable frames.
    pub fn decode_mqtt(&self, data: &[u8]) -> Result<Vec<Message>, CodecError> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            if data.len() - offset < 4 {
                return Err(CodecError::InvalidFrame("truncated length prefix".into()));
            }
            let len = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;
            if data.len() - offset < len {
                return Err(CodecError::InvalidFrame(format!(
                    "frame truncated: prefix says {len}, {} available",
                    data.len() - offset
                )));
            }
            match self.extract_frame(&data[offset..offset + len]) {
                Extracted::Frame { result, .. } => messages.push(result?),
                Extracted::NeedMore | Extracted::Skip(_) => {
                    return Err(CodecError::InvalidFrame(
                        "prefixed frame did not parse".into(),
                    ));
                }
            }
            offset += len;
        }
        Ok(messages)
    }

    /// Attempts to extract one frame from the start of `data`.
    fn extract_frame(&self, data: &[u8]) -> Extracted {
        if data.len() < MIN_FRAME_LEN {
            return Extracted::NeedMore;
        }
        let Some(version) = ProtocolVersion::from_tag(&data[..3]) else {
            return Extracted::Skip(1);
        };
        let payload_len = usize::from(u16::from_be_bytes([data[17], data[18]]));
        let total = HEADER_LEN + payload_len + 4;
        if data.len() < total {
            return Extracted::NeedMore;
        }
        let crc_offset = HEADER_LEN + payload_len;
        let expected = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        let actual = crc32fast::hash(&data[..crc_offset]);
        if expected != actual {
            // Not a real frame start; resume the scan one byte later.
            return Extracted::Skip(1);
        }

        let seq = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
        let random = u32::from_be_bytes([data[7], data[8], data[9], data[10]]);
        let timestamp = u32::from_be_bytes([data[11], data[12], data[13], data[14]]);
        let protocol = match MessageProtocol::from_u16(u16::from_be_bytes([data[15], data[16]])) {
            Ok(protocol) => protocol,
            Err(err) => {
                return Extracted::Frame {
                    consumed: total,
                    result: Err(err),
                };
            }
        };

        let ciphertext = &data[HEADER_LEN..crc_offset];
        let payload = if ciphertext.is_empty() {
            Ok(Vec::new())
        } else {
            match version {
                ProtocolVersion::V1 | ProtocolVersion::A01 | ProtocolVersion::B01 => {
                    crypto::decrypt_v1(ciphertext, &self.local_key, timestamp)
                }
                ProtocolVersion::L01 => match self.nonces {
                    Some(nonces) => crypto::decrypt_l01(
                        ciphertext,
                        &L01KeyMaterial {
                            local_key: &self.local_key,
                            timestamp,
                            seq,
                            random,
                            connect_nonce: nonces.connect,
                            ack_nonce: nonces.ack,
                        },
                    ),
                    None => Err(CodecError::MissingNonces),
                },
            }
        };

        Extracted::Frame {
            consumed: total,
            result: payload.map(|payload| Message {
                version,
                seq,
                random,
                timestamp,
                protocol,
                payload,
            }),
        }
    }

    fn l01_material<'a>(&'a self, message: &Message, nonces: SessionNonces) -> L01KeyMaterial<'a> {
        L01KeyMaterial {
            local_key: &self.local_key,
            timestamp: message.timestamp,
            seq: message.seq,
            random: message.random,
            connect_nonce: nonces.connect,
            ack_nonce: nonces.ack,
        }
    }
}

enum Extracted {
    /// The buffer ends before the frame does.
    NeedMore,
    /// The bytes at the cursor are not a frame; skip forward.
    Skip(usize),
    /// A checksummed frame was consumed.
    Frame {
        consumed: usize,
        result: Result<Message, CodecError>,
    },
}

/// Streaming reassembler for the local TCP byte stream.
///
/// Chunks may split frames at arbitrary points and carry leading garbage.
/// Frames that verify but fail to decrypt are logged and dropped; the
/// stream itself never fails.
#[derive(Debug)]
pub struct StreamDecoder {
    codec: Codec,
    buffer: Vec<u8>,
}

impl StreamDecoder {
    /// Creates a streaming decoder around the given codec.
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    /// Replaces the codec, e.g. after the handshake upgrades to L01.
    pub fn set_codec(&mut self, codec: Codec) {
        self.codec = codec;
    }

    /// Feeds a chunk of stream bytes, returning every completed message.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < self.buffer.len() {
            match self.codec.extract_frame(&self.buffer[offset..]) {
                Extracted::NeedMore => break,
                Extracted::Skip(n) => offset += n,
                Extracted::Frame { consumed, result } => {
                    match result {
                        Ok(message) => messages.push(message),
                        Err(err) => {
                            tracing::warn!(error = %err, "Dropping undecodable frame");
                        }
                    }
                    offset += consumed;
                }
            }
        }
        self.buffer.drain(..offset);
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_KEY: &str = "local_key";

    fn test_message() -> Message {
        Message {
            version: ProtocolVersion::V1,
            seq: 1,
            random: 123,
            timestamp: 1_700_000_000,
            protocol: MessageProtocol::RpcRequest,
            payload: b"test_payload".to_vec(),
        }
    }

    #[test]
    fn v1_round_trip() {
        let codec = Codec::new(LOCAL_KEY);
        let message = test_message();

        let encoded = codec.encode(&message).unwrap();
        let decoded = codec.decode(&encoded).unwrap();

        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn l01_round_trip_with_nonces() {
        let nonces = SessionNonces {
            connect: 123,
            ack: 456,
        };
        let codec = Codec::with_nonces(LOCAL_KEY, nonces);
        let message = Message {
            version: ProtocolVersion::L01,
            ..test_message()
        };

        let encoded = codec.encode(&message).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn l01_decode_fails_with_mismatched_nonces() {
        let codec = Codec::with_nonces(
            LOCAL_KEY,
            SessionNonces {
                connect: 123,
                ack: 456,
            },
        );
        let message = Message {
            version: ProtocolVersion::L01,
            ..test_message()
        };
        let encoded = codec.encode(&message).unwrap();

        let wrong = Codec::with_nonces(
            LOCAL_KEY,
            SessionNonces {
                connect: 123,
                ack: 457,
            },
        );
        assert!(wrong.decode(&encoded).is_err());
    }

    #[test]
    fn l01_encode_requires_nonces() {
        let codec = Codec::new(LOCAL_KEY);
        let message = Message {
            version: ProtocolVersion::L01,
            ..test_message()
        };
        assert!(matches!(
            codec.encode(&message),
            Err(CodecError::MissingNonces)
        ));
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let codec = Codec::new(LOCAL_KEY);
        let message = test_message();
        let encoded = codec.encode(&message).unwrap();

        let mut data = b"\x00\x00\x05\xa1\xff\xff".to_vec();
        data.extend_from_slice(&encoded);

        let decoded = codec.decode(&data).unwrap();
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn arbitrary_short_prefixes_are_skipped() {
        let codec = Codec::new(LOCAL_KEY);
        let message = test_message();
        let encoded = codec.encode(&message).unwrap();

        for garbage_len in 1..=8 {
            let mut data = vec![0xa5u8; garbage_len];
            data.extend_from_slice(&encoded);
            let decoded = codec.decode(&data).unwrap();
            assert_eq!(decoded, vec![message.clone()], "prefix {garbage_len}");
        }
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let codec = Codec::new(LOCAL_KEY);
        let first = test_message();
        let second = Message {
            seq: 2,
            payload: b"second".to_vec(),
            ..test_message()
        };

        let mut data = codec.encode(&first).unwrap();
        data.extend_from_slice(&codec.encode(&second).unwrap());

        let decoded = codec.decode(&data).unwrap();
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn empty_payload_frame_round_trips() {
        let codec = Codec::new(LOCAL_KEY);
        let message = Message {
            protocol: MessageProtocol::HelloRequest,
            payload: Vec::new(),
            ..test_message()
        };
        let encoded = codec.encode(&message).unwrap();
        assert_eq!(encoded.len(), MIN_FRAME_LEN);
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn corrupted_checksum_is_not_a_frame() {
        let codec = Codec::new(LOCAL_KEY);
        let mut encoded = codec.encode(&test_message()).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        // The scan never finds a verifying frame.
        assert_eq!(codec.decode(&encoded).unwrap(), vec![]);
    }

    #[test]
    fn mqtt_round_trip_with_prefix() {
        let codec = Codec::new(LOCAL_KEY);
        let message = test_message();
        let encoded = codec.encode_mqtt(&message).unwrap();

        let frame_len =
            u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(frame_len, encoded.len() - 4);

        let decoded = codec.decode_mqtt(&encoded).unwrap();
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn mqtt_truncated_prefix_fails() {
        let codec = Codec::new(LOCAL_KEY);
        assert!(codec.decode_mqtt(&[0, 0]).is_err());
        assert!(codec.decode_mqtt(&[0, 0, 0, 200, 1, 2]).is_err());
    }

    #[test]
    fn stream_decoder_reassembles_split_frames() {
        let codec = Codec::new(LOCAL_KEY);
        let message = test_message();
        let encoded = codec.encode(&message).unwrap();

        let mut decoder = StreamDecoder::new(codec);
        let (head, tail) = encoded.split_at(7);
        assert!(decoder.decode(head).is_empty());
        assert_eq!(decoder.decode(tail), vec![message]);
    }

    #[test]
    fn stream_decoder_skips_garbage_between_chunks() {
        let codec = Codec::new(LOCAL_KEY);
        let message = test_message();
        let encoded = codec.encode(&message).unwrap();

        let mut decoder = StreamDecoder::new(codec);
        assert!(decoder.decode(b"\x00\x00\x05\xa1\xff\xff").is_empty());
        assert_eq!(decoder.decode(&encoded), vec![message]);
    }

    #[test]
    fn stream_decoder_drops_undecryptable_frame() {
        let nonces = SessionNonces {
            connect: 123,
            ack: 456,
        };
        let l01_codec = Codec::with_nonces(LOCAL_KEY, nonces);
        let l01_message = Message {
            version: ProtocolVersion::L01,
            ..test_message()
        };
        let encoded = l01_codec.encode(&l01_message).unwrap();

        // A decoder without session nonces verifies the frame but cannot
        // decrypt it; the frame is dropped and the stream continues.
        let mut decoder = StreamDecoder::new(Codec::new(LOCAL_KEY));
        assert!(decoder.decode(&encoded).is_empty());

        let v1_message = test_message();
        let encoded2 = Codec::new(LOCAL_KEY).encode(&v1_message).unwrap();
        assert_eq!(decoder.decode(&encoded2), vec![v1_message]);
    }
}
