use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Accumulated duration samples (sum + count), enough for the run summary.
#[derive(Debug, Default)]
pub struct DurationRecorder {
    total_micros: AtomicU64,
    samples: AtomicU64,
}

impl DurationRecorder {
    pub fn record(&self, elapsed: Duration) {
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed))
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// In-process metrics registry.
///
/// Injected into clients and the executor; a default instance is a
/// functioning no-op from the caller's perspective (nothing reads it).
/// The Prometheus scrape surface is a separate concern and not part of
/// this crate; the run summary consumes these values directly.
#[derive(Debug, Default)]
pub struct Metrics {
    pub source_reads: Counter,
    pub source_lists: Counter,
    pub store_calls: Counter,
    pub store_pages: Counter,
    pub blob_calls: Counter,
    pub discovery_calls: Counter,
    pub retries: Counter,
    pub breaker_rejections: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub ou_listing_failures: Counter,
    pub merge_phase: DurationRecorder,
    pub sync_phase: DurationRecorder,
    pub store_call_duration: DurationRecorder,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::default();
        metrics.retries.increment();
        metrics.retries.add(2);
        assert_eq!(metrics.retries.get(), 3);
    }

    #[test]
    fn duration_recorder_sums_samples() {
        let recorder = DurationRecorder::default();
        recorder.record(Duration::from_millis(2));
        recorder.record(Duration::from_millis(3));
        assert_eq!(recorder.samples(), 2);
        assert_eq!(recorder.total(), Duration::from_millis(5));
    }
}
