//! Latest-per-device freshness markers and device heartbeats.
//!
//! Both maps are monotone: a marker only moves forward in
//! `(ts_ms, sent_at_ms)` order and a heartbeat only forward in time,
//! regardless of the order rows reach persistence.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Freshness marker per device, ordered lexicographically by
/// `(ts_ms, sent_at_ms)`. A missing `sent_at_ms` sorts before any present
/// one at the same `ts_ms`.
#[derive(Default)]
pub struct LatestMarkers {
    map: Mutex<HashMap<String, (i64, Option<i64>)>>,
}

impl LatestMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `(ts_ms, sent_at_ms)` is strictly newer than the marker.
    pub fn is_newer(&self, device_id: &str, ts_ms: i64, sent_at_ms: Option<i64>) -> bool {
        match self.map.lock().get(device_id) {
            Some(marker) => (ts_ms, sent_at_ms) > *marker,
            None => true,
        }
    }

    /// Moves the marker forward; older values are ignored.
    pub fn advance(&self, device_id: &str, ts_ms: i64, sent_at_ms: Option<i64>) {
        let mut map = self.map.lock();
        let candidate = (ts_ms, sent_at_ms);
        let marker = map.entry(device_id.to_string()).or_insert(candidate);
        if candidate > *marker {
            *marker = candidate;
        }
    }

    pub fn get(&self, device_id: &str) -> Option<(i64, Option<i64>)> {
        self.map.lock().get(device_id).copied()
    }
}

/// Last time each device was seen on the bus, epoch ms.
#[derive(Default)]
pub struct Heartbeats {
    map: Mutex<HashMap<String, i64>>,
}

impl Heartbeats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting; earlier times never overwrite later ones.
    pub fn note(&self, device_id: &str, seen_ms: i64) {
        let mut map = self.map.lock();
        let entry = map.entry(device_id.to_string()).or_insert(seen_ms);
        if seen_ms > *entry {
            *entry = seen_ms;
        }
    }

    /// Devices not seen within `timeout_ms`, sorted for stable output.
    pub fn offline(&self, now_ms: i64, timeout_ms: i64) -> Vec<String> {
        let map = self.map.lock();
        let mut offline: Vec<String> = map
            .iter()
            .filter(|(_, seen)| now_ms - **seen > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        offline.sort();
        offline
    }

    /// Drops entries older than `max_age_ms` to bound the map.
    pub fn trim(&self, now_ms: i64, max_age_ms: i64) {
        self.map.lock().retain(|_, seen| now_ms - *seen <= max_age_ms);
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
