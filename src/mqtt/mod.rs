// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Account-wide MQTT session management.
//!
//! One [`MqttSession`] serves every device on an account. Broker
//! credentials are not the account password: username and password are
//! MD5 derivations of the `rriot` secrets, and the client id is a fresh
//! base-62 rendering of a UUID on every connection.

mod health;
pub(crate) mod session;

pub use health::HealthManager;
pub use session::{MqttSession, MqttSessionConfig, PayloadCallback, UnauthorizedHook};

use std::time::Duration;

use crate::error::{Error, SessionError};
use crate::protocol::crypto::md5_concat;
use crate::types::UserData;

/// Default MQTT port when the broker URL does not name one.
const DEFAULT_MQTT_PORT: u16 = 8883;

/// Connection parameters for the account broker.
#[derive(Debug, Clone)]
pub struct MqttParams {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Whether to wrap the connection in TLS.
    pub tls: bool,
    /// Derived broker username.
    pub username: String,
    /// Derived broker password.
    pub password: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
}

impl MqttParams {
    /// Derives broker parameters from the account credential bundle.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker URL in `rriot.r.m` cannot be
    /// parsed.
    pub fn from_user_data(user_data: &UserData) -> Result<Self, Error> {
        let rriot = &user_data.rriot;
        let (host, port, tls) = parse_broker_url(&rriot.r.m)?;
        Ok(Self {
            host,
            port,
            tls,
            username: mqtt_username(&rriot.u, &rriot.k),
            password: mqtt_password(&rriot.s, &rriot.k),
            keep_alive: Duration::from_secs(30),
        })
    }
}

/// Derives the broker username: `md5_hex(u + ":" + k)[2..10]`.
#[must_use]
pub fn mqtt_username(mqtt_user: &str, k: &str) -> String {
    let digest = md5_concat(&[mqtt_user.as_bytes(), b":", k.as_bytes()]);
    hex::encode(digest)[2..10].to_string()
}

/// Derives the broker password: `md5_hex(s + ":" + k)[16..]`.
#[must_use]
pub fn mqtt_password(mqtt_secret: &str, k: &str) -> String {
    let digest = md5_concat(&[mqtt_secret.as_bytes(), b":", k.as_bytes()]);
    hex::encode(digest)[16..].to_string()
}

/// Generates a fresh client id: a UUID128 in base-62, padded to 22 chars.
#[must_use]
pub fn generate_client_id() -> String {
    const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut value = uuid::Uuid::new_v4().as_u128();
    let mut id = Vec::with_capacity(22);
    while value > 0 {
        id.push(ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    while id.len() < 22 {
        id.push(b'0');
    }
    id.reverse();
    String::from_utf8(id).unwrap_or_default()
}

/// Parses a broker URL of the form `tcp://host:port` or `ssl://host:port`.
fn parse_broker_url(url: &str) -> Result<(String, u16, bool), Error> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("ssl://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("mqtts://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (false, rest)
    } else {
        (true, url)
    };

    let (host, port) = if let Some((host, port)) = rest.rsplit_once(':') {
        let port = port.parse().map_err(|_| {
            Error::Session(SessionError::ConnectionFailed(format!(
                "invalid broker port in {url}"
            )))
        })?;
        (host.to_string(), port)
    } else {
        (rest.to_string(), DEFAULT_MQTT_PORT)
    };

    if host.is_empty() {
        return Err(Error::Session(SessionError::ConnectionFailed(format!(
            "invalid broker url {url}"
        ))));
    }
    Ok((host, port, tls))
}
