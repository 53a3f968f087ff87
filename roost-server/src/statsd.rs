use roost_statsd::{CounterMetric, GaugeMetric};

/// Counter metrics emitted by the Roost server.
pub enum RoostCounters {
    /// Streaming connections that completed the handshake and were handed to
    /// a worker.
    StreamAccepted,
    /// Streaming connections rejected before handoff.
    ///
    /// This metric is tagged with:
    /// - `reason`: the access-log status of the rejection.
    StreamRejected,
    /// Payload bytes read from connected children.
    StreamBytesReceived,
    /// Requests handled by the HTTP surface.
    HttpRequests,
}

impl CounterMetric for RoostCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::StreamAccepted => "stream.accepted",
            Self::StreamRejected => "stream.rejected",
            Self::StreamBytesReceived => "stream.received_bytes",
            Self::HttpRequests => "http.requests",
        }
    }
}

/// Gauge metrics emitted by the Roost server.
pub enum RoostGauges {
    /// Receiver states currently alive in the process.
    Receivers,
    /// Bytes allocated for receiver states and their buffers.
    ReceiverMemoryBytes,
}

impl GaugeMetric for RoostGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::Receivers => "stream.receivers",
            Self::ReceiverMemoryBytes => "stream.receivers_memory_bytes",
        }
    }
}
