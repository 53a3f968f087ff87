//! StatsD metrics for Roost.
//!
//! Metric names live on enums implementing [`CounterMetric`] or
//! [`GaugeMetric`], so every name has exactly one declaration site and a
//! call site cannot mix a counter up with a gauge. The [`metric!`] macro is
//! the only emission path; until [`init`] installs an exporter, emissions
//! are dropped.
//!
//! ```
//! use roost_statsd::{metric, CounterMetric};
//!
//! struct Accepted;
//!
//! impl CounterMetric for Accepted {
//!     fn name(&self) -> &'static str {
//!         "accepted"
//!     }
//! }
//!
//! metric!(counter(Accepted) += 1, reason = "handshake");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use metrics_exporter_dogstatsd::{AggregationMode, BuildError, DogStatsDBuilder};
use serde::{Deserialize, Serialize};

mod mock;

pub use mock::with_capturing_test_client;

/// A monotonically increasing event count.
pub trait CounterMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// An instantaneous measurement that holds until it is set again.
pub trait GaugeMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// Settings for the statsd exporter.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// `host:port` of the statsd endpoint. Metrics are disabled when unset.
    pub host: Option<String>,

    /// Prefix prepended to every metric name.
    pub prefix: String,

    /// Tags attached to every metric.
    pub tags: BTreeMap<String, String>,
}

/// Error installing the statsd exporter.
#[derive(Debug)]
pub struct Error(BuildError);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {}

impl From<BuildError> for Error {
    fn from(value: BuildError) -> Self {
        Self(value)
    }
}

/// Installs the global statsd exporter.
///
/// Without a configured host this does nothing and metrics stay off.
pub fn init(config: &MetricsConfig) -> Result<(), Error> {
    let Some(host) = config.host.as_deref() else {
        return Ok(());
    };

    roost_log::info!("reporting metrics to statsd at {host}");

    let tags = config
        .tags
        .iter()
        .map(|(key, value)| metrics::Label::new(key.clone(), value.clone()))
        .collect();

    DogStatsDBuilder::default()
        .with_remote_address(host)?
        .with_aggregation_mode(AggregationMode::Aggressive)
        .set_global_prefix(config.prefix.clone())
        .with_global_labels(tags)
        .install()?;

    Ok(())
}

#[doc(hidden)]
pub mod _emit {
    use metrics::{Key, Label, Level, Metadata};

    pub use metrics::Label as TagLabel;

    static METADATA: Metadata<'static> =
        Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

    /// Adds `value` to the counter `name`. Zero increments are not emitted.
    pub fn counter(name: &'static str, value: u64, tags: Vec<Label>) {
        if value == 0 {
            return;
        }

        let key = Key::from_parts(name, tags);
        metrics::with_recorder(|recorder| recorder.register_counter(&key, &METADATA))
            .increment(value);
    }

    /// Sets the gauge `name`.
    pub fn gauge(name: &'static str, value: f64, tags: Vec<Label>) {
        let key = Key::from_parts(name, tags);
        metrics::with_recorder(|recorder| recorder.register_gauge(&key, &METADATA)).set(value);
    }
}

/// Emits a metric.
///
/// Counters increment, gauges are set; both take trailing `tag = value`
/// pairs. See the [crate docs](self) for an example.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $tag:ident = $tag_value:expr)* $(,)?) => {
        $crate::_emit::counter(
            $crate::CounterMetric::name(&$id),
            $value,
            ::std::vec![$($crate::_emit::TagLabel::new(
                stringify!($tag),
                ::std::string::String::from($tag_value),
            )),*],
        )
    };
    (gauge($id:expr) = $value:expr $(, $tag:ident = $tag_value:expr)* $(,)?) => {
        $crate::_emit::gauge(
            $crate::GaugeMetric::name(&$id),
            $value as f64,
            ::std::vec![$($crate::_emit::TagLabel::new(
                stringify!($tag),
                ::std::string::String::from($tag_value),
            )),*],
        )
    };
}
