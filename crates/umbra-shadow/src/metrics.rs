//! Engine statistics and their export through metrics-rs.
//!
//! The engine keeps its own relaxed atomic counters so callers can take a
//! consistent-enough [`StatsSnapshot`] at any time. [`record_stats`] publishes
//! a snapshot through whatever global (or local) `metrics` recorder is active.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{Unit, counter, describe_counter, describe_gauge, gauge};
use umbra_codec::ShadowValue;

/// Live engine counters.
#[derive(Debug, Default)]
pub struct ShadowStats {
    blocks_allocated: AtomicU64,
    promotion_races_lost: AtomicU64,
    special_swaps: [AtomicU64; 4],
    bytes_bulk_filled: AtomicU64,
    threads_initialized: AtomicU64,
}

impl ShadowStats {
    pub fn record_block_allocated(&self) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_race_lost(&self) {
        self.promotion_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_special_swap(&self, value: ShadowValue) {
        self.special_swaps[usize::from(value.code())].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bulk_fill(&self, bytes: u64) {
        self.bytes_bulk_filled.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_thread_init(&self) {
        self.threads_initialized.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        let swaps =
            |v: ShadowValue| self.special_swaps[usize::from(v.code())].load(Ordering::Relaxed);
        StatsSnapshot {
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            promotion_races_lost: self.promotion_races_lost.load(Ordering::Relaxed),
            special_swaps: ShadowValue::ALL.map(swaps),
            bytes_bulk_filled: self.bytes_bulk_filled.load(Ordering::Relaxed),
            threads_initialized: self.threads_initialized.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ShadowStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Private blocks created. Blocks are never freed while the engine lives.
    pub blocks_allocated: u64,
    /// Promotions that found the slot already private and discarded their block.
    pub promotion_races_lost: u64,
    /// Slot swaps between special blocks, indexed by the new value's code.
    pub special_swaps: [u64; 4],
    /// Shadowed bytes written by bulk fills.
    pub bytes_bulk_filled: u64,
    /// Register shadow records created.
    pub threads_initialized: u64,
}

impl StatsSnapshot {
    pub const fn special_swaps_to(&self, value: ShadowValue) -> u64 {
        self.special_swaps[value.code() as usize]
    }

    pub fn total_special_swaps(&self) -> u64 {
        self.special_swaps.iter().sum()
    }
}

// ============================================================================
// Metric descriptions
// ============================================================================

/// Register metric descriptions. Call once at startup.
pub fn init() {
    describe_counter!(
        "umbra_private_blocks_allocated_total",
        Unit::Count,
        "Private shadow blocks allocated"
    );
    describe_counter!(
        "umbra_private_blocks_freed_total",
        Unit::Count,
        "Private shadow blocks freed"
    );
    describe_counter!(
        "umbra_promotion_races_lost_total",
        Unit::Count,
        "Promotions discarded because another thread promoted first"
    );
    describe_counter!(
        "umbra_special_swaps_total",
        Unit::Count,
        "Table slots switched to a special block"
    );
    describe_counter!(
        "umbra_bulk_filled_bytes_total",
        Unit::Bytes,
        "Shadowed bytes written by bulk fills"
    );
    describe_gauge!(
        "umbra_threads_initialized",
        Unit::Count,
        "Register shadow records created"
    );
}

// ============================================================================
// Metric recording
// ============================================================================

/// Publish a snapshot through the active recorder.
pub fn record_stats(stats: &StatsSnapshot) {
    counter!("umbra_private_blocks_allocated_total").absolute(stats.blocks_allocated);
    counter!("umbra_private_blocks_freed_total").absolute(0);
    counter!("umbra_promotion_races_lost_total").absolute(stats.promotion_races_lost);
    for value in ShadowValue::ALL {
        let labels = [("value", value.name().to_string())];
        counter!("umbra_special_swaps_total", &labels).absolute(stats.special_swaps_to(value));
    }
    counter!("umbra_bulk_filled_bytes_total").absolute(stats.bytes_bulk_filled);
    gauge!("umbra_threads_initialized").set(stats.threads_initialized as f64);
}

/// In-memory recorder for asserting on published metrics.
#[cfg(test)]
mod recorder {
    use std::collections::HashMap;
    use std::sync::Arc;

    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
    use parking_lot::RwLock;

    #[derive(Default)]
    struct Storage {
        counters: RwLock<HashMap<String, u64>>,
        gauges: RwLock<HashMap<String, f64>>,
    }

    struct MemoryCounter {
        key: String,
        storage: Arc<Storage>,
    }

    impl metrics::CounterFn for MemoryCounter {
        fn increment(&self, value: u64) {
            *self.storage.counters.write().entry(self.key.clone()).or_insert(0) += value;
        }

        fn absolute(&self, value: u64) {
            self.storage.counters.write().insert(self.key.clone(), value);
        }
    }

    struct MemoryGauge {
        key: String,
        storage: Arc<Storage>,
    }

    impl metrics::GaugeFn for MemoryGauge {
        fn increment(&self, value: f64) {
            *self.storage.gauges.write().entry(self.key.clone()).or_insert(0.0) += value;
        }

        fn decrement(&self, value: f64) {
            *self.storage.gauges.write().entry(self.key.clone()).or_insert(0.0) -= value;
        }

        fn set(&self, value: f64) {
            self.storage.gauges.write().insert(self.key.clone(), value);
        }
    }

    /// Recorder that keeps counters and gauges in memory.
    ///
    /// Keys with labels are rendered as `name{label=value}`. Histograms are ignored.
    #[derive(Default, Clone)]
    pub struct MemoryRecorder {
        storage: Arc<Storage>,
    }

    impl MemoryRecorder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn counter(&self, key: &str) -> Option<u64> {
            self.storage.counters.read().get(key).copied()
        }

        pub fn gauge(&self, key: &str) -> Option<f64> {
            self.storage.gauges.read().get(key).copied()
        }
    }

    fn key_to_string(key: &Key) -> String {
        let labels: Vec<String> = key
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect();
        if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        }
    }

    impl Recorder for MemoryRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
            Counter::from_arc(Arc::new(MemoryCounter {
                key: key_to_string(key),
                storage: Arc::clone(&self.storage),
            }))
        }

        fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(Arc::new(MemoryGauge {
                key: key_to_string(key),
                storage: Arc::clone(&self.storage),
            }))
        }

        fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }
}
