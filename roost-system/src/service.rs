use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::statsd::SystemGauges;

/// A message consumed by a [`Service`].
///
/// An interface is usually an enum of everything the service reacts to, or a
/// single struct for services with one concern. Messages cross task
/// boundaries, so they must be `Send` and `'static`.
pub trait Interface: Send + 'static {}

/// Services that take no messages use `()` as their interface.
impl Interface for () {}

/// Bookkeeping shared by an [`Addr`] and its [`Receiver`].
struct ChannelState {
    name: &'static str,
    depth: AtomicU64,
}

impl ChannelState {
    /// Publishes the current backlog of the service as a gauge.
    fn record_depth(&self, depth: u64) {
        roost_statsd::metric!(
            gauge(SystemGauges::ServiceBackPressure) = depth,
            service = self.name
        );
    }
}

/// The sending side of a service channel.
///
/// Addresses clone freely. Once every clone is dropped, the channel closes
/// and the service drains its backlog and stops. Sending is fire-and-forget:
/// a message to a stopped service is silently dropped.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
    state: Arc<ChannelState>,
}

impl<I: Interface> Addr<I> {
    /// Queues a message for the service.
    ///
    /// The channel is unbounded; the backlog shows up in the back-pressure
    /// gauge rather than as a blocked sender.
    pub fn send<M>(&self, message: M)
    where
        M: Into<I>,
    {
        // The depth goes up before the message becomes visible, so the
        // receiver's decrement can never observe an unaccounted message.
        let depth = self.state.depth.fetch_add(1, Ordering::SeqCst) + 1;

        if self.tx.send(message.into()).is_ok() {
            self.state.record_depth(depth);
        } else {
            self.state.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Clone is manual: the derive would demand `I: Clone` for no reason.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("service", &self.state.name)
            .field("open", &!self.tx.is_closed())
            .field("depth", &self.state.depth.load(Ordering::Relaxed))
            .finish()
    }
}

/// The receiving side of a service channel, owned by the running service.
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
    state: Arc<ChannelState>,
}

impl<I: Interface> Receiver<I> {
    /// Waits for the next message.
    ///
    /// Resolves to `None` once every [`Addr`] is gone and the backlog is
    /// drained, which is the service's signal to stop.
    pub async fn recv(&mut self) -> Option<I> {
        let message = self.rx.recv().await;

        if message.is_some() {
            let depth = self.state.depth.fetch_sub(1, Ordering::SeqCst) - 1;
            self.state.record_depth(depth);
        }

        message
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("service", &self.state.name)
            .field("depth", &self.state.depth.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates the channel pair for a service.
///
/// `name` tags the service's back-pressure gauge and diagnostics.
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    let state = Arc::new(ChannelState {
        name,
        depth: AtomicU64::new(0),
    });

    let (tx, rx) = mpsc::unbounded_channel();

    let addr = Addr {
        tx,
        state: state.clone(),
    };
    let receiver = Receiver { rx, state };

    (addr, receiver)
}

/// A long-lived unit that consumes messages from its channel.
///
/// A service is started once and then only reachable through its [`Addr`].
/// Implementors receive the channel in [`spawn`](Self::spawn) and must move
/// it into at least one task; when `recv` returns `None`, the service should
/// wind down.
///
/// ```no_run
/// use roost_system::{Interface, Receiver, Service};
///
/// struct Job(u32);
///
/// impl Interface for Job {}
///
/// struct Worker;
///
/// impl Service for Worker {
///     type Interface = Job;
///
///     fn spawn(self, mut rx: Receiver<Job>) {
///         tokio::spawn(async move {
///             while let Some(Job(id)) = rx.recv().await {
///                 let _ = id;
///             }
///         });
///     }
/// }
///
/// let addr = Worker.start();
/// addr.send(Job(7));
/// ```
pub trait Service: Sized {
    /// The messages this service consumes.
    type Interface: Interface;

    /// Moves the receiver into the service's task.
    fn spawn(self, rx: Receiver<Self::Interface>);

    /// Starts the service on the current runtime and hands back its address.
    fn start(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name());
        self.spawn(rx);
        addr
    }

    /// Short name used in diagnostics and the back-pressure gauge.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Ping(u32);

    impl Interface for Ping {}

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (addr, mut rx) = channel::<Ping>("order");

        for n in 0..5 {
            addr.send(Ping(n));
        }
        drop(addr);

        let mut seen = Vec::new();
        while let Some(Ping(n)) = rx.recv().await {
            seen.push(n);
        }

        assert_eq!(seen, [0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cloned_addresses_feed_the_same_service() {
        let (addr, mut rx) = channel::<Ping>("clones");
        let other = addr.clone();

        addr.send(Ping(1));
        other.send(Ping(2));
        drop(addr);
        drop(other);

        assert_eq!(rx.recv().await.map(|Ping(n)| n), Some(1));
        assert_eq!(rx.recv().await.map(|Ping(n)| n), Some(2));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn depth_gauge_follows_the_backlog() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let captures = roost_statsd::with_capturing_test_client(|| {
            let (addr, mut rx) = channel::<Ping>("depth");

            addr.send(Ping(1));
            addr.send(Ping(2));
            rt.block_on(async {
                rx.recv().await;
            });
        });

        assert_eq!(
            captures,
            [
                "service.back_pressure:1|g|#service:depth",
                "service.back_pressure:2|g|#service:depth",
                "service.back_pressure:1|g|#service:depth",
            ]
        );
    }

    #[tokio::test]
    async fn started_service_consumes_its_mail() {
        struct Collector(Arc<Mutex<Vec<u32>>>);

        impl Service for Collector {
            type Interface = Ping;

            fn spawn(self, mut rx: Receiver<Ping>) {
                tokio::spawn(async move {
                    while let Some(Ping(n)) = rx.recv().await {
                        self.0.lock().unwrap().push(n);
                    }
                });
            }

            fn name() -> &'static str {
                "collector"
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector(seen.clone()).start();

        addr.send(Ping(42));
        drop(addr);

        // The service drains after the last address is gone.
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(*seen.lock().unwrap(), [42]);
    }
}
