// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Home roster containers.

use serde::{Deserialize, Serialize};

/// The account's home: device roster, products, and rooms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeData {
    /// Numeric home id.
    #[serde(default)]
    pub id: i64,
    /// Home display name.
    #[serde(default)]
    pub name: String,
    /// Product catalog entries referenced by the devices.
    #[serde(default)]
    pub products: Vec<HomeDataProduct>,
    /// Devices owned by the account.
    #[serde(default)]
    pub devices: Vec<HomeDataDevice>,
    /// Devices shared with the account.
    #[serde(default, rename = "receivedDevices")]
    pub received_devices: Vec<HomeDataDevice>,
    /// Rooms configured in the home.
    #[serde(default)]
    pub rooms: Vec<HomeRoom>,
}

impl HomeData {
    /// Iterates over owned and shared devices.
    pub fn all_devices(&self) -> impl Iterator<Item = &HomeDataDevice> {
        self.devices.iter().chain(self.received_devices.iter())
    }

    /// Looks up the product entry for a device.
    #[must_use]
    pub fn product(&self, product_id: &str) -> Option<&HomeDataProduct> {
        self.products.iter().find(|p| p.id == product_id)
    }
}

/// One device in the home roster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeDataDevice {
    /// Device unique id, assigned by the cloud.
    pub duid: String,
    /// Device display name.
    #[serde(default)]
    pub name: String,
    /// 16-byte ASCII secret shared with cloud and device.
    #[serde(rename = "localKey")]
    pub local_key: String,
    /// Product catalog id.
    #[serde(default, rename = "productId")]
    pub product_id: String,
    /// Protocol version: `1.0`, `A01`, `B01`, or `L01`.
    #[serde(default)]
    pub pv: String,
    /// Whether the cloud currently sees the device online.
    #[serde(default)]
    pub online: bool,
}

/// One product catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeDataProduct {
    /// Product catalog id.
    pub id: String,
    /// Product display name.
    #[serde(default)]
    pub name: String,
    /// Firmware model string, e.g. `roborock.vacuum.a27`.
    #[serde(default)]
    pub model: String,
    /// Product category, e.g. `robot.vacuum.cleaner`.
    #[serde(default)]
    pub category: String,
}

/// One room configured in the home.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeRoom {
    /// Numeric room id.
    pub id: i64,
    /// Room display name.
    #[serde(default)]
    pub name: String,
}

/// LAN address and signal data reported by `get_network_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// The device's LAN IP address.
    pub ip: String,
    /// Connected Wi-Fi SSID.
    #[serde(default)]
    pub ssid: String,
    /// Device MAC address.
    #[serde(default)]
    pub mac: String,
    /// Access point BSSID.
    #[serde(default)]
    pub bssid: String,
    /// Signal strength in dBm.
    #[serde(default)]
    pub rssi: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home_data() -> HomeData {
        serde_json::from_value(serde_json::json!({
            "id": 123_456,
            "name": "My Home",
            "products": [{
                "id": "product-id-123",
                "name": "Roborock S7 MaxV",
                "model": "roborock.vacuum.a27",
                "category": "robot.vacuum.cleaner",
            }],
            "devices": [{
                "duid": "abc123",
                "name": "Roborock S7 MaxV",
                "localKey": "key123key123key1",
                "productId": "product-id-123",
                "pv": "1.0",
                "online": true,
            }],
            "receivedDevices": [{
                "duid": "shared456",
                "name": "Shared vacuum",
                "localKey": "key456key456key4",
                "productId": "product-id-123",
                "pv": "A01",
            }],
            "rooms": [{"id": 2_362_048, "name": "Example room 1"}],
        }))
        .unwrap()
    }

    #[test]
    fn parses_roster() {
        let home = home_data();
        assert_eq!(home.devices.len(), 1);
        assert_eq!(home.devices[0].duid, "abc123");
        assert_eq!(home.devices[0].local_key, "key123key123key1");
        assert_eq!(home.devices[0].pv, "1.0");
        assert_eq!(home.rooms[0].name, "Example room 1");
    }

    #[test]
    fn all_devices_includes_shared() {
        let home = home_data();
        let duids: Vec<_> = home.all_devices().map(|d| d.duid.as_str()).collect();
        assert_eq!(duids, ["abc123", "shared456"]);
    }

    #[test]
    fn product_lookup() {
        let home = home_data();
        let product = home.product("product-id-123").unwrap();
        assert_eq!(product.model, "roborock.vacuum.a27");
        assert!(home.product("missing").is_none());
    }

    #[test]
    fn network_info_parses_rpc_result() {
        let info: NetworkInfo = serde_json::from_value(serde_json::json!({
            "ip": "1.1.1.1",
            "ssid": "test_wifi",
            "mac": "aa:bb:cc:dd:ee:ff",
            "bssid": "aa:bb:cc:dd:ee:ff",
            "rssi": -50,
        }))
        .unwrap();
        assert_eq!(info.ip, "1.1.1.1");
        assert_eq!(info.rssi, -50);
    }
}
