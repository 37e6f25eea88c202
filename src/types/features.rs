// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device capability flags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, Error};

/// Capability flags discovered from `app_get_init_status`.
///
/// The firmware reports capabilities as two 64-bit masks plus a list of
/// legacy feature codes. The masks are kept raw; callers probe single
/// bits or codes rather than naming every flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFeatures {
    /// Primary feature bitmask.
    #[serde(default)]
    pub new_feature_info: u64,
    /// Secondary feature bitmask.
    #[serde(default)]
    pub new_feature_info2: u64,
    /// Legacy numeric feature codes.
    #[serde(default)]
    pub feature_info: Vec<i64>,
}

impl DeviceFeatures {
    /// Parses the `app_get_init_status` response.
    ///
    /// The response is an object, or a single-element array holding one.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::UnexpectedShape`] for any other shape.
    pub fn from_init_status(result: &Value) -> Result<Self, Error> {
        let object = match result {
            Value::Object(_) => result,
            Value::Array(items) if items.len() == 1 => &items[0],
            _ => {
                return Err(Error::Api(ApiError::UnexpectedShape {
                    command: "app_get_init_status".into(),
                    message: format!("expected object, got {result}"),
                }));
            }
        };
        let new_feature_info = object
            .get("new_feature_info")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        // Firmware also reports the secondary mask as a hex string in
        // new_feature_info_str; the numeric field wins when both exist.
        let new_feature_info2 = object
            .get("new_feature_info2")
            .and_then(Value::as_u64)
            .or_else(|| {
                object
                    .get("new_feature_info_str")
                    .and_then(Value::as_str)
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
            })
            .unwrap_or(0);
        let feature_info = object
            .get("feature_info")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        Ok(Self {
            new_feature_info,
            new_feature_info2,
            feature_info,
        })
    }

    /// Returns whether bit `bit` of the primary mask is set.
    #[must_use]
    pub fn supports_bit(&self, bit: u32) -> bool {
        bit < 64 && self.new_feature_info & (1 << bit) != 0
    }

    /// Returns whether bit `bit` of the secondary mask is set.
    #[must_use]
    pub fn supports_bit2(&self, bit: u32) -> bool {
        bit < 64 && self.new_feature_info2 & (1 << bit) != 0
    }

    /// Returns whether a legacy feature code is present.
    #[must_use]
    pub fn has_feature_code(&self, code: i64) -> bool {
        self.feature_info.contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn init_status() -> Value {
        json!({
            "local_info": {"name": "custom_A.03.0069_FCC"},
            "feature_info": [111, 112, 113],
            "new_feature_info": 633_887_780_925_447_u64,
            "new_feature_info2": 8192,
            "new_feature_info_str": "0000000000002000",
        })
    }

    #[test]
    fn parses_object_response() {
        let features = DeviceFeatures::from_init_status(&init_status()).unwrap();
        assert_eq!(features.new_feature_info, 633_887_780_925_447);
        assert_eq!(features.new_feature_info2, 8192);
        assert!(features.has_feature_code(111));
        assert!(!features.has_feature_code(999));
    }

    #[test]
    fn parses_array_wrapped_response() {
        let features = DeviceFeatures::from_init_status(&json!([init_status()])).unwrap();
        assert_eq!(features.new_feature_info2, 8192);
    }

    #[test]
    fn hex_string_fallback() {
        let features = DeviceFeatures::from_init_status(&json!({
            "new_feature_info": 1,
            "new_feature_info_str": "2000",
        }))
        .unwrap();
        assert_eq!(features.new_feature_info2, 0x2000);
    }

    #[test]
    fn bit_probes() {
        let features = DeviceFeatures {
            new_feature_info: 0b101,
            new_feature_info2: 1 << 13,
            feature_info: vec![],
        };
        assert!(features.supports_bit(0));
        assert!(!features.supports_bit(1));
        assert!(features.supports_bit(2));
        assert!(features.supports_bit2(13));
        assert!(!features.supports_bit(64));
    }

    #[test]
    fn rejects_scalar_response() {
        assert!(DeviceFeatures::from_init_status(&json!(42)).is_err());
    }
}
