//! Per-target gauges for resolved endpoints.
//!
//! A [`Metrics`] registry is created once and shared by every resolver a
//! builder starts. Each target gets its own set of gauges, keyed by the
//! target's display form. Registering the same target twice returns the
//! existing gauges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A gauge holding a single non-negative value.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    /// Sets the gauge value.
    pub fn set(&self, value: usize) {
        self.0
            .store(u64::try_from(value).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauges for one target.
#[derive(Clone, Debug, Default)]
pub struct TargetGauges {
    /// The number of endpoint groups observed in the last snapshot.
    pub endpoints: Gauge,
    /// The number of addresses resolved from the last snapshot.
    pub addresses: Gauge,
    /// The number of endpoint groups in the last snapshot skipped for lack
    /// of a usable port.
    pub skipped_groups: Gauge,
}

/// Point-in-time values of a target's gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetSample {
    /// Endpoint groups.
    pub endpoints: u64,
    /// Resolved addresses.
    pub addresses: u64,
    /// Endpoint groups skipped for lack of a usable port.
    pub skipped_groups: u64,
}

/// Process-wide registry of per-target gauges.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    targets: Arc<Mutex<BTreeMap<String, TargetGauges>>>,
}

impl Metrics {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the gauges for `target`, registering them on first use.
    #[must_use]
    pub fn for_target(&self, target: &str) -> TargetGauges {
        self.targets
            .lock()
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    /// Returns the current values of every registered target, for export.
    #[must_use]
    pub fn samples(&self) -> BTreeMap<String, TargetSample> {
        self.targets
            .lock()
            .iter()
            .map(|(target, gauges)| {
                let sample = TargetSample {
                    endpoints: gauges.endpoints.get(),
                    addresses: gauges.addresses.get(),
                    skipped_groups: gauges.skipped_groups.get(),
                };

                (target.clone(), sample)
            })
            .collect()
    }
}
