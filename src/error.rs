// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `RoboVac` library.
//!
//! This module provides the error hierarchy for failures across the
//! library: wire codec failures, MQTT session and local transport errors,
//! RPC timeouts, and device-level API errors.

use std::time::Duration;

use thiserror::Error;

/// The main error type for this library.
///
/// This enum encompasses all possible errors that can occur when
/// communicating with devices over MQTT or the local transport.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame could not be parsed, verified, or decrypted.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// MQTT session or transport failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Cache persistence failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// No response arrived within the RPC deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The transport closed while an operation was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The broker rejected the session credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// The device asked for the request to be retried later.
    #[error("device is busy")]
    DeviceBusy,

    /// The device answered with a typed API-level error.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// A second external subscriber attached to a device channel.
    #[error("already subscribed to the device")]
    AlreadySubscribed,

    /// The channel's bounded send queue is full.
    #[error("channel send queue is full")]
    ChannelBusy,

    /// The operation was cancelled by a channel or session close.
    #[error("operation cancelled")]
    Cancelled,

    /// Device startup failed with a non-retryable error.
    #[error("device startup failed: {0}")]
    FatalStartup(String),

    /// Device was not found in the manager.
    #[error("device not found")]
    DeviceNotFound,
}

/// Errors produced while encoding or decoding framed messages.
///
/// Codec errors never tear down a connection; frames that fail to decode
/// are logged, counted, and dropped.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame header or length fields are inconsistent.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The version tag is not one understood by this library.
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion([u8; 3]),

    /// The trailing CRC32 did not match the frame contents.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// The CRC32 carried by the frame.
        expected: u32,
        /// The CRC32 computed over the frame contents.
        actual: u32,
    },

    /// Payload encryption or decryption failed.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// The session nonces required by the L01 suite are missing.
    #[error("missing session nonces for L01 payload")]
    MissingNonces,

    /// A decrypted payload did not contain the expected JSON.
    #[error("payload parse error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors related to the account-wide MQTT session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The MQTT client rejected a request.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Connecting to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was attempted on a session that is not connected.
    #[error("session is not connected")]
    NotConnected,

    /// An internal channel between session tasks was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors related to cache persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing or deserializing the cache blob failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// API-level errors reported by the device inside an RPC response.
///
/// The connection is healthy when these occur; only the individual
/// request failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The device does not recognize the requested method.
    #[error("method not recognized by the device")]
    UnknownMethod,

    /// The device returned a result this library cannot interpret.
    #[error("unexpected api result: {0}")]
    UnexpectedResult(String),

    /// The response payload did not have the shape the command expects.
    #[error("unexpected response shape for {command}: {message}")]
    UnexpectedShape {
        /// The command whose response failed to parse.
        command: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A B01 device reported a non-zero status code.
    #[error("device returned error code {code} for {command}")]
    ErrorCode {
        /// The non-zero status code.
        code: i64,
        /// The command that failed.
        command: String,
    },
}

impl Error {
    /// Returns whether a connect loop should retry after this error.
    ///
    /// Transport-level failures and busy devices are retryable with
    /// backoff; everything else aborts the connect task and surfaces on
    /// the next user query.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Codec(_)
                | Self::Session(_)
                | Self::Timeout(_)
                | Self::ConnectionLost(_)
                | Self::DeviceBusy
                | Self::ChannelBusy
                | Self::Cancelled
        )
    }
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
