//! Composition root of the server.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use roost_config::{Config, StreamCredentials};
use roost_system::{Addr, Service};

use crate::receiver::RateGate;
use crate::registry::HostRegistry;
use crate::services::streaming::{AddReceiver, StreamingService};

struct StateInner {
    config: Arc<Config>,
    credentials: Arc<StreamCredentials>,
    registry: Arc<HostRegistry>,
    rate_gate: RateGate,
    streaming: Addr<AddReceiver>,
    streaming_running: AtomicBool,
}

/// Everything the request handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceState")
            .field("hosts", &self.inner.registry.host_count())
            .finish_non_exhaustive()
    }
}

impl ServiceState {
    /// Builds the shared state and starts the streaming worker service.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(config: Arc<Config>, credentials: Arc<StreamCredentials>) -> Self {
        let localhost_guid = config.machine_guid().unwrap_or_else(Uuid::new_v4);
        let registry = Arc::new(HostRegistry::new(
            localhost_guid,
            config.hostname(),
            config.max_hosts(),
        ));

        let streaming = StreamingService::new(config.clone(), registry.clone()).start();

        Self {
            inner: Arc::new(StateInner {
                config,
                credentials,
                registry,
                rate_gate: RateGate::new(),
                streaming,
                streaming_running: AtomicBool::new(true),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn credentials(&self) -> &StreamCredentials {
        &self.inner.credentials
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.inner.registry
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.inner.rate_gate
    }

    pub fn streaming(&self) -> &Addr<AddReceiver> {
        &self.inner.streaming
    }

    /// Whether new streaming connections are currently accepted.
    pub fn streaming_running(&self) -> bool {
        self.inner.streaming_running.load(Ordering::Acquire)
    }

    /// Stops accepting new streaming connections, used during shutdown.
    pub fn shutdown_streaming(&self) {
        self.inner.streaming_running.store(false, Ordering::Release);
    }
}
