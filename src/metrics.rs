//! Metrics for the sampling processor.
//!
//! Provides OpenTelemetry instruments for the calculation loop:
//! - Operations covered by each calculation round
//! - Calculation round latency

use opentelemetry::metrics::{Gauge, Histogram, Meter};

/// Instruments recorded by the calculation loop.
pub struct ProcessorMetrics {
    /// Number of operations the leader produced probabilities for in the
    /// latest round.
    pub operations_calculated: Gauge<u64>,

    /// Wall-clock time of one probability calculation round.
    pub calculate_probabilities_duration: Histogram<f64>,
}

impl ProcessorMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            operations_calculated: meter
                .u64_gauge("adaptive_sampling.operations_calculated")
                .with_description("Number of operations probabilities were calculated for")
                .build(),
            calculate_probabilities_duration: meter
                .f64_histogram("adaptive_sampling.calculate_probabilities.duration")
                .with_description("Duration of one probability calculation round in seconds")
                .with_unit("s")
                .build(),
        }
    }
}
