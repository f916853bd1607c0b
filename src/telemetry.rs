//! Structured, in-process observability hooks.
//!
//! The library never prints. Callers that want logs provide a
//! [`StoreEventListener`] forwarding events to `tracing`, `log`, or custom
//! sinks, and/or install a `metrics` recorder; with neither configured both
//! paths are no-ops.

use std::path::PathBuf;
use std::sync::Arc;

/// Structured event hook for observability.
pub trait StoreEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: StoreEvent);
}

/// Structured events emitted by the storage engine.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    FileCreated {
        path: PathBuf,
        bytes: u64,
    },
    /// Points committed to one archive (before propagation).
    PointsWritten {
        step: u32,
        count: usize,
    },
    /// Propagation into the archive with `step` stopped: coverage below the
    /// file's xFilesFactor. Not an error.
    PropagationSkipped {
        step: u32,
        known: usize,
        expected: usize,
    },
    /// Header-only rewrite (aggregation method or xFilesFactor).
    HeaderRewritten {
        path: PathBuf,
    },
    ResizeCommitted {
        path: PathBuf,
        bytes: u64,
    },
    BackupRemoved {
        path: PathBuf,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl StoreEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: StoreEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn StoreEventListener> {
    Arc::new(NoopEventListener)
}

/// Metric names and recording helpers.
///
/// Counters are exposed as `<name>_total` by the Prometheus exporter;
/// histograms as `<name>_bucket`, `<name>_sum`, `<name>_count`. Recording is
/// effectively free until a recorder is installed.
pub mod store_metrics {
    use std::time::Duration;

    use metrics::{describe_counter, describe_histogram, Unit};

    pub const UPDATE_POINTS: &str = "whisper_update_points";
    pub const UPDATE_DURATION_SECONDS: &str = "whisper_update_duration_seconds";
    pub const FETCH_POINTS: &str = "whisper_fetch_points";
    pub const FETCH_DURATION_SECONDS: &str = "whisper_fetch_duration_seconds";
    pub const PROPAGATION_SKIPS: &str = "whisper_propagation_skips";

    #[inline]
    pub fn record_update(duration: Duration, points: u64) {
        metrics::histogram!(UPDATE_DURATION_SECONDS).record(duration.as_secs_f64());
        if points > 0 {
            metrics::counter!(UPDATE_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_fetch(duration: Duration, points: u64) {
        metrics::histogram!(FETCH_DURATION_SECONDS).record(duration.as_secs_f64());
        if points > 0 {
            metrics::counter!(FETCH_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_propagation_skip() {
        metrics::counter!(PROPAGATION_SKIPS).increment(1);
    }

    /// Registers descriptions for every metric this crate emits.
    pub fn describe_all() {
        describe_counter!(
            UPDATE_POINTS,
            Unit::Count,
            "Total number of points written via update/update_many."
        );
        describe_counter!(
            FETCH_POINTS,
            Unit::Count,
            "Total number of slots returned by fetch."
        );
        describe_counter!(
            PROPAGATION_SKIPS,
            Unit::Count,
            "Propagations stopped because coverage fell below the xFilesFactor."
        );
        describe_histogram!(
            UPDATE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of a single update or update_many operation."
        );
        describe_histogram!(
            FETCH_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of a single fetch operation."
        );
    }

    /// Installs a global in-process Prometheus recorder and returns its
    /// handle; call [`render`](metrics_exporter_prometheus::PrometheusHandle::render)
    /// to scrape. No HTTP server is started.
    #[cfg(feature = "prometheus")]
    pub fn install_prometheus(
    ) -> Result<metrics_exporter_prometheus::PrometheusHandle, metrics_exporter_prometheus::BuildError>
    {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
        describe_all();
        Ok(handle)
    }
}
