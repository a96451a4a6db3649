//! Result Aggregator plus the metric and notification sinks it feeds.

pub mod aggregator;
pub mod metrics;
pub mod notify;

pub use aggregator::{ResultAggregator, ResultInputs};
pub use metrics::{MemoryMetricsSink, MetricKind, MetricSample, MetricsSink, NullMetricsSink};
pub use notify::{
    NotificationMessage, NotificationSink, NullNotifier, OutcomeEvent, RecordingNotifier,
};
