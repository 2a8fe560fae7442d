//! In-memory cache of the latest metric samples per device.
//!
//! Check-ins carry a keyed metrics map; the control channel worker folds
//! the latest samples into periodic fleet status frames. Samples are
//! transient and intentionally not persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Default)]
pub struct MetricsCache {
    inner: Arc<Mutex<HashMap<String, HashMap<String, f64>>>>,
}

impl MetricsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached samples for a device. Last-write-wins.
    pub fn record(&self, uuid: &str, samples: HashMap<String, f64>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid.to_string(), samples);
    }

    /// Latest samples for a device, empty if it has never reported any.
    #[must_use]
    pub fn for_device(&self, uuid: &str) -> HashMap<String, f64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_replaces_previous_samples() {
        let cache = MetricsCache::new();
        cache.record("d1", HashMap::from([("uptime_secs".to_string(), 10.0)]));
        cache.record("d1", HashMap::from([("uptime_secs".to_string(), 70.0)]));

        let samples = cache.for_device("d1");
        assert_eq!(samples.get("uptime_secs"), Some(&70.0));
    }

    #[test]
    fn unknown_device_yields_empty_map() {
        let cache = MetricsCache::new();
        assert!(cache.for_device("nope").is_empty());
    }
}
