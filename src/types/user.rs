// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Account credential containers.

use serde::{Deserialize, Serialize};

/// Credentials and account data returned by the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// Numeric account id.
    #[serde(default)]
    pub uid: i64,
    /// Account API token.
    pub token: String,
    /// Token type reported by the API.
    #[serde(default)]
    pub tokentype: String,
    /// Account region code, e.g. `us`.
    #[serde(default)]
    pub region: String,
    /// IoT credential bundle.
    pub rriot: Rriot,
}

/// The account-level IoT credential bundle.
///
/// Contains the MQTT endpoint and the secrets every per-device session
/// derives its credentials from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rriot {
    /// MQTT user id.
    pub u: String,
    /// MQTT secret.
    pub s: String,
    /// HMAC secret for the web API.
    #[serde(default)]
    pub h: String,
    /// Account crypto key; seeds MQTT credentials and map security data.
    pub k: String,
    /// Regional endpoints.
    pub r: RriotRegion,
}

/// Regional service endpoints inside [`Rriot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RriotRegion {
    /// Region code.
    #[serde(default)]
    pub r: String,
    /// Web API base URL.
    #[serde(default)]
    pub a: String,
    /// MQTT broker URL, e.g. `tcp://mqtt-us.roborock.com:8883`.
    pub m: String,
    /// Log upload URL.
    #[serde(default)]
    pub l: String,
}

/// Everything the device manager needs to know about the account.
#[derive(Debug, Clone)]
pub struct UserParams {
    /// The account login name.
    pub username: String,
    /// Credentials returned by the login endpoint.
    pub user_data: UserData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_parses_api_shape() {
        let raw = serde_json::json!({
            "uid": 123_456,
            "tokentype": "token_type",
            "token": "abc123",
            "rruid": "abc123",
            "region": "us",
            "nickname": "user_nickname",
            "rriot": {
                "u": "user123",
                "s": "pass123",
                "h": "unknown123",
                "k": "qiCNieZa",
                "r": {
                    "r": "US",
                    "a": "https://api-us.example.com",
                    "m": "tcp://mqtt-us.example.com:8883",
                    "l": "https://wood-us.example.com",
                },
            },
        });
        let user_data: UserData = serde_json::from_value(raw).unwrap();
        assert_eq!(user_data.token, "abc123");
        assert_eq!(user_data.rriot.u, "user123");
        assert_eq!(user_data.rriot.k, "qiCNieZa");
        assert_eq!(user_data.rriot.r.m, "tcp://mqtt-us.example.com:8883");
    }
}
