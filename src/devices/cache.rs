// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device data caching.
//!
//! A [`Cache`] stores per-device network info, discovered capabilities,
//! and map snapshots so reconnects and restarts skip redundant cloud
//! calls. Callers may bring their own implementation; the library ships
//! an in-memory cache for tests and a file-backed cache whose on-disk
//! format defaults to a compact binary encoding with JSON as an
//! alternative.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::types::{DeviceFeatures, HomeData, HomeRoom, NetworkInfo};

/// Cached state for one device, keyed by duid in [`CacheData`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCacheEntry {
    /// Last known LAN address and signal data.
    #[serde(default)]
    pub network_info: Option<NetworkInfo>,
    /// Capability flags discovered on first connect.
    #[serde(default)]
    pub device_features: Option<DeviceFeatures>,
    /// Map metadata keyed by map id.
    #[serde(default)]
    pub home_map_info: HashMap<i32, MapInfo>,
    /// Raw map snapshots keyed by map id, base64 encoded.
    #[serde(default)]
    pub home_map_content_base64: HashMap<i32, String>,
}

/// Metadata for one stored map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapInfo {
    /// Map display name.
    #[serde(default)]
    pub name: String,
    /// Rooms present on this map.
    #[serde(default)]
    pub rooms: Vec<HomeRoom>,
}

/// The full cached state for an account.
///
/// The flat top-level maps are a legacy layout: they are accepted on
/// read for backward compatibility and folded into the per-device form
/// by [`migrate_legacy`](Self::migrate_legacy) before the next flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    /// Cached home roster.
    #[serde(default)]
    pub home_data: Option<HomeData>,
    /// Per-device cached state keyed by duid.
    #[serde(default)]
    pub device_info: HashMap<String, DeviceCacheEntry>,
    /// Legacy: network info keyed by duid.
    #[serde(default)]
    pub network_info: HashMap<String, NetworkInfo>,
    /// Legacy: map metadata keyed by map id.
    #[serde(default)]
    pub home_map_info: HashMap<i32, MapInfo>,
    /// Legacy: map snapshots keyed by map id.
    #[serde(default)]
    pub home_map_content_base64: HashMap<i32, String>,
}

impl CacheData {
    /// Returns the cached entry for a device, if any.
    #[must_use]
    pub fn device(&self, duid: &str) -> Option<&DeviceCacheEntry> {
        self.device_info.get(duid)
    }

    /// Returns the mutable entry for a device, creating it on demand.
    pub fn device_mut(&mut self, duid: &str) -> &mut DeviceCacheEntry {
        self.device_info.entry(duid.to_string()).or_default()
    }

    /// Looks up network info, falling back to the legacy layout.
    #[must_use]
    pub fn network_info(&self, duid: &str) -> Option<&NetworkInfo> {
        self.device_info
            .get(duid)
            .and_then(|entry| entry.network_info.as_ref())
            .or_else(|| self.network_info.get(duid))
    }

    /// Folds legacy top-level fields into the per-device form.
    ///
    /// Map entries have no duid in the legacy layout; they are assigned
    /// to the device only when the cached roster names exactly one.
    pub fn migrate_legacy(&mut self) {
        let legacy_network: Vec<(String, NetworkInfo)> = self.network_info.drain().collect();
        for (duid, info) in legacy_network {
            let entry = self.device_mut(&duid);
            entry.network_info.get_or_insert(info);
        }

        let single_duid = self.home_data.as_ref().and_then(|home| {
            let mut duids = home.all_devices().map(|d| d.duid.clone());
            match (duids.next(), duids.next()) {
                (Some(duid), None) => Some(duid),
                _ => None,
            }
        });
        if let Some(duid) = single_duid {
            let map_info: Vec<_> = self.home_map_info.drain().collect();
            let map_content: Vec<_> = self.home_map_content_base64.drain().collect();
            let entry = self.device_mut(&duid);
            for (map_id, info) in map_info {
                entry.home_map_info.entry(map_id).or_insert(info);
            }
            for (map_id, content) in map_content {
                entry.home_map_content_base64.entry(map_id).or_insert(content);
            }
        }
    }
}

/// Storage for cached device state.
///
/// Reads are served from an in-memory copy after the first load; writes
/// mark the cache dirty and [`flush`](Cache::flush) persists.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the cached state.
    async fn get(&self) -> Result<CacheData>;

    /// Replaces the cached state.
    async fn set(&self, data: CacheData) -> Result<()>;

    /// Persists dirty state to the backing store, if any.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory cache, primarily for tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    data: Mutex<CacheData>,
}

impl InMemoryCache {
    /// Creates an empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self) -> Result<CacheData> {
        Ok(self.data.lock().clone())
    }

    async fn set(&self, data: CacheData) -> Result<()> {
        *self.data.lock() = data;
        Ok(())
    }
}

/// Cache that stores nothing.
#[derive(Debug, Default)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get(&self) -> Result<CacheData> {
        Ok(CacheData::default())
    }

    async fn set(&self, _data: CacheData) -> Result<()> {
        Ok(())
    }
}

/// Serializer from cache state to bytes.
pub type SerializeFn = Arc<dyn Fn(&CacheData) -> Result<Vec<u8>> + Send + Sync>;
/// Deserializer from bytes to cache state.
pub type DeserializeFn = Arc<dyn Fn(&[u8]) -> Result<CacheData> + Send + Sync>;

/// On-disk formats shipped with the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFormat {
    /// Compact binary encoding (the default).
    Binary,
    /// Human-readable JSON.
    Json,
}

struct FileCacheState {
    data: Option<CacheData>,
    dirty: bool,
}

/// File-backed cache.
///
/// The first read loads the file; later reads are served from memory.
/// `set` marks the state dirty and `flush` writes it back using the
/// configured serializer.
pub struct FileCache {
    path: PathBuf,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    state: tokio::sync::Mutex<FileCacheState>,
}

impl FileCache {
    /// Creates a file cache with the default binary format.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_format(path, CacheFormat::Binary)
    }

    /// Creates a file cache with one of the shipped formats.
    #[must_use]
    pub fn with_format(path: impl Into<PathBuf>, format: CacheFormat) -> Self {
        let (serialize, deserialize): (SerializeFn, DeserializeFn) = match format {
            CacheFormat::Binary => (
                Arc::new(|data: &CacheData| {
                    bincode::serialize(data)
                        .map_err(|err| CacheError::Serialization(err.to_string()).into())
                }),
                Arc::new(|bytes: &[u8]| {
                    bincode::deserialize(bytes)
                        .map_err(|err| CacheError::Serialization(err.to_string()).into())
                }),
            ),
            CacheFormat::Json => (
                Arc::new(|data: &CacheData| {
                    serde_json::to_vec(data)
                        .map_err(|err| CacheError::Serialization(err.to_string()).into())
                }),
                Arc::new(|bytes: &[u8]| {
                    serde_json::from_slice(bytes)
                        .map_err(|err| CacheError::Serialization(err.to_string()).into())
                }),
            ),
        };
        Self {
            path: path.into(),
            serialize,
            deserialize,
            state: tokio::sync::Mutex::new(FileCacheState {
                data: None,
                dirty: false,
            }),
        }
    }

    /// Creates a file cache with caller-supplied serializers.
    #[must_use]
    pub fn with_codec(
        path: impl Into<PathBuf>,
        serialize: SerializeFn,
        deserialize: DeserializeFn,
    ) -> Self {
        Self {
            path: path.into(),
            serialize,
            deserialize,
            state: tokio::sync::Mutex::new(FileCacheState {
                data: None,
                dirty: false,
            }),
        }
    }

    async fn load(&self) -> CacheData {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match (self.deserialize)(&bytes) {
                Ok(mut data) => {
                    data.migrate_legacy();
                    data
                }
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "Cache file unreadable, starting fresh"
                    );
                    CacheData::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CacheData::default(),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Cache file unreadable, starting fresh"
                );
                CacheData::default()
            }
        }
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn get(&self) -> Result<CacheData> {
        let mut state = self.state.lock().await;
        if state.data.is_none() {
            state.data = Some(self.load().await);
        }
        Ok(state.data.clone().unwrap_or_default())
    }

    async fn set(&self, data: CacheData) -> Result<()> {
        let mut state = self.state.lock().await;
        state.data = Some(data);
        state.dirty = true;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let bytes = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            let mut data = state.data.clone().unwrap_or_default();
            data.migrate_legacy();
            // A failed serialize leaves the cache dirty for a later retry.
            let bytes = (self.serialize)(&data)?;
            state.data = Some(data);
            state.dirty = false;
            bytes
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CacheError::Io)?;
        }
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(CacheError::Io)?;
        tracing::debug!(path = %self.path.display(), "Cache flushed");
        Ok(())
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_info() -> NetworkInfo {
        NetworkInfo {
            ip: "1.1.1.1".into(),
            ssid: "test_wifi".into(),
            mac: "aa:bb:cc:dd:ee:ff".into(),
            bssid: "aa:bb:cc:dd:ee:ff".into(),
            rssi: -50,
        }
    }

    #[tokio::test]
    async fn in_memory_round_trip() {
        let cache = InMemoryCache::new();
        let mut data = cache.get().await.unwrap();
        data.device_mut("abc123").network_info = Some(network_info());
        cache.set(data.clone()).await.unwrap();

        let loaded = cache.get().await.unwrap();
        assert_eq!(loaded.network_info("abc123"), Some(&network_info()));
    }

    #[tokio::test]
    async fn no_cache_stores_nothing() {
        let cache = NoCache;
        let mut data = cache.get().await.unwrap();
        data.device_mut("abc123").network_info = Some(network_info());
        cache.set(data).await.unwrap();
        assert!(cache.get().await.unwrap().device_info.is_empty());
    }

    #[tokio::test]
    async fn file_cache_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let cache = FileCache::new(&path);
        let mut data = cache.get().await.unwrap();
        data.device_mut("abc123").network_info = Some(network_info());
        cache.set(data).await.unwrap();
        cache.flush().await.unwrap();

        let reloaded = FileCache::new(&path);
        let loaded = reloaded.get().await.unwrap();
        assert_eq!(loaded.network_info("abc123"), Some(&network_info()));
    }

    #[tokio::test]
    async fn file_cache_json_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = FileCache::with_format(&path, CacheFormat::Json);
        let mut data = cache.get().await.unwrap();
        data.device_mut("abc123").device_features = Some(DeviceFeatures {
            new_feature_info: 7,
            ..DeviceFeatures::default()
        });
        cache.set(data).await.unwrap();
        cache.flush().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value["device_info"]["abc123"]["device_features"]["new_feature_info"],
            7
        );
    }

    #[tokio::test]
    async fn file_cache_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("missing.bin"));
        assert_eq!(cache.get().await.unwrap(), CacheData::default());
    }

    #[tokio::test]
    async fn file_cache_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"not a cache").unwrap();

        let cache = FileCache::new(&path);
        assert_eq!(cache.get().await.unwrap(), CacheData::default());
    }

    #[tokio::test]
    async fn flush_without_changes_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let cache = FileCache::new(&path);
        cache.flush().await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn legacy_network_info_is_migrated() {
        let mut data = CacheData {
            network_info: HashMap::from([("abc123".to_string(), network_info())]),
            ..CacheData::default()
        };
        data.migrate_legacy();

        assert!(data.network_info.is_empty());
        assert_eq!(
            data.device("abc123").unwrap().network_info,
            Some(network_info())
        );
    }

    #[test]
    fn legacy_lookup_works_before_migration() {
        let data = CacheData {
            network_info: HashMap::from([("abc123".to_string(), network_info())]),
            ..CacheData::default()
        };
        assert_eq!(data.network_info("abc123"), Some(&network_info()));
    }

    #[test]
    fn legacy_maps_migrate_to_single_device() {
        let home_data: HomeData = serde_json::from_value(serde_json::json!({
            "devices": [{"duid": "abc123", "localKey": "key", "pv": "1.0"}],
        }))
        .unwrap();
        let mut data = CacheData {
            home_data: Some(home_data),
            home_map_info: HashMap::from([(0, MapInfo {
                name: "Ground floor".into(),
                rooms: vec![],
            })]),
            home_map_content_base64: HashMap::from([(0, "bWFw".to_string())]),
            ..CacheData::default()
        };
        data.migrate_legacy();

        let entry = data.device("abc123").unwrap();
        assert_eq!(entry.home_map_info[&0].name, "Ground floor");
        assert_eq!(entry.home_map_content_base64[&0], "bWFw");
        assert!(data.home_map_info.is_empty());
    }

    #[test]
    fn legacy_maps_stay_put_with_multiple_devices() {
        let home_data: HomeData = serde_json::from_value(serde_json::json!({
            "devices": [
                {"duid": "abc123", "localKey": "key", "pv": "1.0"},
                {"duid": "def456", "localKey": "key", "pv": "1.0"},
            ],
        }))
        .unwrap();
        let mut data = CacheData {
            home_data: Some(home_data),
            home_map_info: HashMap::from([(0, MapInfo::default())]),
            ..CacheData::default()
        };
        data.migrate_legacy();
        assert_eq!(data.home_map_info.len(), 1);
    }
}
