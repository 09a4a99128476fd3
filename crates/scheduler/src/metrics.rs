//! Metrics for the compilation scheduler.

/// Metric names and registration for scheduler observability.
#[derive(Debug, Clone, Copy)]
pub struct Metrics;

impl Metrics {
    /// Total compilations dispatched by this process.
    pub const COMPILATIONS_DISPATCHED: &'static str = "kiln_scheduler_compilations_dispatched_total";
    /// Total compile requests attached to an already running compilation.
    pub const COMPILATIONS_DEDUPLICATED: &'static str =
        "kiln_scheduler_compilations_deduplicated_total";
    /// Total deduplicated clients that disconnected after a stall.
    pub const DEDUPLICATION_DISCONNECTS: &'static str =
        "kiln_scheduler_deduplication_disconnects_total";
    /// Running compilations currently registered.
    pub const RUNNING_COMPILATIONS: &'static str = "kiln_scheduler_running_compilations";

    /// Describes and zeroes every scheduler metric.
    ///
    /// Called when a [`Scheduler`] is constructed; re-running it for a
    /// second scheduler in the same process is harmless.
    ///
    /// [`Scheduler`]: crate::Scheduler
    #[cfg(feature = "metrics")]
    pub fn init() {
        Self::describe();
        Self::zero();
    }

    #[cfg(feature = "metrics")]
    fn describe() {
        metrics::describe_counter!(
            Self::COMPILATIONS_DISPATCHED,
            metrics::Unit::Count,
            "Total number of compilations dispatched by the scheduler",
        );

        metrics::describe_counter!(
            Self::COMPILATIONS_DEDUPLICATED,
            metrics::Unit::Count,
            "Total number of compile requests deduplicated against a running compilation",
        );

        metrics::describe_counter!(
            Self::DEDUPLICATION_DISCONNECTS,
            metrics::Unit::Count,
            "Total number of deduplicated clients that disconnected after a stall",
        );

        metrics::describe_gauge!(
            Self::RUNNING_COMPILATIONS,
            metrics::Unit::Count,
            "Number of running compilations currently registered",
        );
    }

    #[cfg(feature = "metrics")]
    fn zero() {
        metrics::counter!(Self::COMPILATIONS_DISPATCHED).increment(0);
        metrics::counter!(Self::COMPILATIONS_DEDUPLICATED).increment(0);
        metrics::counter!(Self::DEDUPLICATION_DISCONNECTS).increment(0);
        metrics::gauge!(Self::RUNNING_COMPILATIONS).set(0.0);
    }

    /// Records a dispatched compilation and the new registry size.
    pub(crate) fn record_dispatch(running: usize) {
        #[cfg(feature = "metrics")]
        {
            metrics::counter!(Self::COMPILATIONS_DISPATCHED).increment(1);
            metrics::gauge!(Self::RUNNING_COMPILATIONS).set(running as f64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = running;
    }

    /// Records a deduplicated compile request.
    pub(crate) fn record_deduplicated() {
        #[cfg(feature = "metrics")]
        metrics::counter!(Self::COMPILATIONS_DEDUPLICATED).increment(1);
    }

    /// Records a stall disconnect and the new registry size.
    pub(crate) fn record_disconnect(running: usize) {
        #[cfg(feature = "metrics")]
        {
            metrics::counter!(Self::DEDUPLICATION_DISCONNECTS).increment(1);
            metrics::gauge!(Self::RUNNING_COMPILATIONS).set(running as f64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = running;
    }
}
