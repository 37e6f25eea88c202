// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device status container.

use serde::{Deserialize, Serialize};

/// The status record answered by `get_status`.
///
/// Firmware generations report different subsets of these fields, so
/// everything defaults and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Status message schema version.
    #[serde(default)]
    pub msg_ver: i32,
    /// Status message sequence number.
    #[serde(default)]
    pub msg_seq: i32,
    /// Activity state code (8 = charging, 5 = cleaning, ...).
    #[serde(default)]
    pub state: i32,
    /// Battery percentage.
    #[serde(default)]
    pub battery: i32,
    /// Current run duration in seconds.
    #[serde(default)]
    pub clean_time: i64,
    /// Current run area in mm².
    #[serde(default)]
    pub clean_area: i64,
    /// Device error code; zero when healthy.
    #[serde(default)]
    pub error_code: i32,
    /// Whether a map is available.
    #[serde(default)]
    pub map_present: i32,
    /// Whether a cleaning run is active.
    #[serde(default)]
    pub in_cleaning: i32,
    /// Whether the device is returning to the dock.
    #[serde(default)]
    pub in_returning: i32,
    /// Fan power mode code.
    #[serde(default)]
    pub fan_power: i32,
    /// Whether do-not-disturb is enabled.
    #[serde(default)]
    pub dnd_enabled: i32,
    /// Water box mode code.
    #[serde(default)]
    pub water_box_mode: i32,
    /// Mop mode code.
    #[serde(default)]
    pub mop_mode: i32,
    /// Dock type code.
    #[serde(default)]
    pub dock_type: i32,
    /// Whether the device is currently charging.
    #[serde(default)]
    pub charge_status: i32,
    /// Dock error code; zero when healthy.
    #[serde(default)]
    pub dock_error_status: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_status_payload() {
        let status: Status = serde_json::from_value(serde_json::json!({
            "msg_ver": 2,
            "msg_seq": 458,
            "state": 8,
            "battery": 100,
            "clean_time": 1176,
            "clean_area": 20_965_000,
            "error_code": 0,
            "map_present": 1,
            "in_cleaning": 0,
            "in_returning": 0,
            "in_fresh_state": 1,
            "fan_power": 102,
            "dnd_enabled": 0,
            "water_box_mode": 203,
            "mop_mode": 300,
            "dock_type": 3,
            "charge_status": 1,
            "dock_error_status": 0,
            "unsave_map_flag": 0,
        }))
        .unwrap();

        assert_eq!(status.battery, 100);
        assert_eq!(status.state, 8);
        assert_eq!(status.clean_area, 20_965_000);
        assert_eq!(status.charge_status, 1);
    }

    #[test]
    fn missing_fields_default() {
        let status: Status = serde_json::from_value(serde_json::json!({
            "state": 5,
            "battery": 42,
        }))
        .unwrap();
        assert_eq!(status.state, 5);
        assert_eq!(status.battery, 42);
        assert_eq!(status.fan_power, 0);
    }
}
