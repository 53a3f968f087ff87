use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::watch;

/// Notice that the process is going down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    /// Grace period services get to wind down. `None` means stop immediately.
    pub timeout: Option<Duration>,
}

/// The process-wide shutdown broadcast.
///
/// Only the sender lives here; every [`ShutdownHandle`] subscribes on
/// creation, so there is no receiver to keep alive.
static SHUTDOWN: OnceCell<watch::Sender<Option<Shutdown>>> = OnceCell::new();

fn shutdown_sender() -> &'static watch::Sender<Option<Shutdown>> {
    SHUTDOWN.get_or_init(|| watch::channel(None).0)
}

/// A subscription to the shutdown broadcast.
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits for the next shutdown notice.
    ///
    /// Cancellation safe, so it composes with `select!` in service loops.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }

            if let Some(shutdown) = self.0.borrow_and_update().clone() {
                return shutdown;
            }
        }
    }
}

/// Drives process shutdown.
///
/// [`start`](Self::start) installs the signal listeners. Services that wind
/// down in an orderly manner subscribe via
/// [`shutdown_handle`](Self::shutdown_handle) and receive a [`Shutdown`]
/// notice; after its grace period the process exits regardless.
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Installs the termination-signal listeners.
    ///
    /// `grace` is the wind-down budget handed to services on a graceful
    /// termination.
    pub fn start(grace: Duration) {
        tokio::spawn(listen_for_signals(grace));
    }

    /// Broadcasts a shutdown without a signal, for when the process decides
    /// to stop itself.
    pub fn trigger_shutdown(timeout: Option<Duration>) {
        // send_replace delivers even while no handle is subscribed yet.
        shutdown_sender().send_replace(Some(Shutdown { timeout }));
    }

    /// Subscribes to the shutdown broadcast.
    pub fn shutdown_handle() -> ShutdownHandle {
        ShutdownHandle(shutdown_sender().subscribe())
    }

    /// Resolves when the process should exit.
    ///
    /// That is after the grace period of a graceful shutdown, immediately on
    /// a forced one, or as soon as a second signal upgrades a graceful
    /// shutdown to a forced one.
    pub async fn shutdown() {
        let mut handle = Self::shutdown_handle();

        if let Some(grace) = handle.notified().await.timeout {
            tokio::select! {
                _ = handle.notified() => (),
                _ = tokio::time::sleep(grace) => (),
            }
        }
    }
}

#[cfg(unix)]
async fn listen_for_signals(grace: Duration) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
        return;
    };
    let Ok(mut quit) = signal(SignalKind::quit()) else {
        return;
    };
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        return;
    };

    loop {
        let shutdown = tokio::select! {
            Some(()) = interrupt.recv() => {
                roost_log::info!("SIGINT received, stopping now");
                Shutdown { timeout: None }
            }
            Some(()) = quit.recv() => {
                roost_log::info!("SIGQUIT received, stopping now");
                Shutdown { timeout: None }
            }
            Some(()) = terminate.recv() => {
                roost_log::info!("SIGTERM received, stopping within {}s", grace.as_secs());
                Shutdown { timeout: Some(grace) }
            }
            else => return,
        };

        shutdown_sender().send_replace(Some(shutdown));
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(grace: Duration) {
    // Ctrl-C is the only portable termination signal elsewhere.
    let _ = grace;

    while tokio::signal::ctrl_c().await.is_ok() {
        roost_log::info!("interrupt received, stopping now");
        shutdown_sender().send_replace(Some(Shutdown { timeout: None }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn triggered_shutdown_reaches_subscribers() {
        let mut handle = Controller::shutdown_handle();

        Controller::trigger_shutdown(Some(Duration::from_secs(3)));

        let shutdown = handle.notified().await;
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(3)));
    }
}
