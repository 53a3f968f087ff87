use roost_statsd::GaugeMetric;

/// Gauge metrics emitted by the service framework.
pub enum SystemGauges {
    /// The number of messages queued in a service's inbound channel.
    ///
    /// This metric is tagged with:
    /// - `service`: the name of the service.
    ServiceBackPressure,
}

impl GaugeMetric for SystemGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::ServiceBackPressure => "service.back_pressure",
        }
    }
}
