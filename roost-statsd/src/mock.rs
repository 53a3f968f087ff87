use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

/// Runs `f` with a recorder that captures every emission as a statsd-style
/// line, and returns the captured lines.
///
/// The recorder only covers the current thread, so captures from concurrent
/// tests cannot bleed into each other.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let lines = Arc::new(Mutex::new(Vec::new()));

    let recorder = CaptureRecorder {
        lines: lines.clone(),
    };
    metrics::with_local_recorder(&recorder, f);

    let lines = lines.lock().unwrap_or_else(PoisonError::into_inner);
    lines.clone()
}

struct CaptureRecorder {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureRecorder {
    fn handle(&self, key: &Key) -> Arc<CaptureHandle> {
        Arc::new(CaptureHandle {
            key: key.clone(),
            lines: self.lines.clone(),
        })
    }
}

impl Recorder for CaptureRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.handle(key))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key))
    }
}

struct CaptureHandle {
    key: Key,
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureHandle {
    /// Renders one emission like the dogstatsd wire format: the tag section
    /// only appears when there are tags.
    fn push(&self, kind: char, value: impl fmt::Display) {
        let mut line = format!("{}:{value}|{kind}", self.key.name());

        let tags = self
            .key
            .labels()
            .map(|label| format!("{}:{}", label.key(), label.value()))
            .collect::<Vec<_>>()
            .join(",");

        if !tags.is_empty() {
            line.push_str("|#");
            line.push_str(&tags);
        }

        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

impl metrics::CounterFn for CaptureHandle {
    fn increment(&self, value: u64) {
        self.push('c', value);
    }

    fn absolute(&self, value: u64) {
        self.push('c', format!("={value}"));
    }
}

impl metrics::GaugeFn for CaptureHandle {
    fn increment(&self, value: f64) {
        self.push('g', format!("+{value}"));
    }

    fn decrement(&self, value: f64) {
        self.push('g', format!("-{value}"));
    }

    fn set(&self, value: f64) {
        self.push('g', value);
    }
}

impl metrics::HistogramFn for CaptureHandle {
    fn record(&self, value: f64) {
        self.push('d', value);
    }
}
