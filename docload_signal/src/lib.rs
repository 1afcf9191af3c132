//! One-shot phase signals for docload.
//!
//! A load run has a handful of long-lived utility tasks, such as the document
//! source and the telemetry pusher, that outlive the workers and must be told
//! when the run is over. They must also be waited on: the run is not complete
//! until each of them has observed the signal and wound down.
//!
//! The mechanism here has two halves, a `Broadcaster` and a `Watcher`. There is
//! exactly one `Broadcaster` and any number of `Watcher` instances. The signal
//! is a one-time event. `Broadcaster::signal_and_wait` doubles as the run's
//! completion tracker: it returns only once every registered `Watcher` has
//! either received the signal or been dropped.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered: the `Broadcaster` will wait on it
/// in `signal_and_wait` until it receives the signal or is dropped.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let departed = Arc::new(Notify::new());

    let w = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        departed: Arc::clone(&departed),
        registered: true,
        peer_count_decreased: false,
        signal_received: false,
    };
    let b = Broadcaster {
        sender,
        peers,
        departed,
    };
    (w, b)
}

#[derive(Debug)]
/// Notifies one or more `Watcher` instances that a phase has been reached.
pub struct Broadcaster {
    /// Carries the signal. `true` once signaled.
    sender: watch::Sender<bool>,
    /// Count of registered watchers that have not yet departed.
    peers: Arc<AtomicU32>,
    /// Woken each time a registered watcher departs.
    departed: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal to every `Watcher`.
    ///
    /// Does NOT wait for watchers to acknowledge.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal to every `Watcher` and wait for all registered
    /// watchers to depart.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        // Register interest before checking the count. A departure between
        // the load and the await would otherwise be missed.
        loop {
            let departed = self.departed.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("waiting on {peers} peers to shut down");
            departed.await;
        }
    }

    /// Number of registered watchers that have not yet departed.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.peers.load(Ordering::SeqCst)
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// The signal was already received by this watcher.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The signal was already received by this watcher.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Waits for the signal sent by a `Broadcaster`.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    departed: Arc<Notify>,
    /// Whether the `Broadcaster` waits on this instance.
    registered: bool,
    peer_count_decreased: bool,
    signal_received: bool,
}

impl Watcher {
    fn depart(&mut self) {
        if !self.registered || self.peer_count_decreased {
            return;
        }
        // fetch_sub would wrap at zero.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.departed.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
        self.peer_count_decreased = true;
    }

    /// Wait for the signal. Returns immediately if it was already sent.
    ///
    /// A `Broadcaster` dropped without signaling counts as a signal.
    pub async fn recv(mut self) {
        if !self.signal_received {
            // An error means the sender is gone, which is as good as a signal.
            let _ = self.receiver.wait_for(|signaled| *signaled).await;
            self.signal_received = true;
        }
        self.depart();
    }

    /// Check for the signal without blocking.
    ///
    /// Returns `Ok(false)` while the signal has not been sent and `Ok(true)`
    /// the first time it is observed.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` on every call after the one that
    /// observed the signal.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }
        let signaled = *self.receiver.borrow() || self.receiver.has_changed().is_err();
        if signaled {
            self.signal_received = true;
            self.depart();
        }
        Ok(signaled)
    }

    /// Register a new `Watcher` the `Broadcaster` will wait on.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this watcher has already
    /// received the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }
        self.peers.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            departed: Arc::clone(&self.departed),
            registered: true,
            peer_count_decreased: false,
            signal_received: false,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.depart();
    }
}

impl Clone for Watcher {
    /// Clones are NOT registered: the `Broadcaster` does not wait on them.
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            departed: Arc::clone(&self.departed),
            registered: false,
            peer_count_decreased: false,
            signal_received: self.signal_received,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::{RegisterError, TryRecvError, signal};

    const BOUND: Duration = Duration::from_secs(5);

    #[tokio::test(flavor = "multi_thread")]
    async fn signal_and_wait_returns_after_watcher_receives() {
        let (watcher, broadcaster) = signal();
        let handle = tokio::spawn(watcher.recv());

        timeout(BOUND, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster hung");
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn unregistered_clone_does_not_block_shutdown() {
        let (watcher, broadcaster) = signal();
        let _unregistered = watcher.clone();
        drop(watcher);

        timeout(BOUND, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster waited on an unregistered watcher");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waits_on_every_registered_watcher() {
        let (root, broadcaster) = signal();
        let first = root.register().expect("register failed");
        let second = root.register().expect("register failed");
        drop(root);
        assert_eq!(broadcaster.outstanding(), 2);

        let h1 = tokio::spawn(first.recv());
        let h2 = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            second.recv().await;
        });

        timeout(BOUND, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster hung");
        h1.await.expect("first watcher panicked");
        h2.await.expect("second watcher panicked");
    }

    #[test]
    fn try_recv_before_and_after_signal() {
        let (mut watcher, broadcaster) = signal();
        assert_eq!(watcher.try_recv(), Ok(false));

        broadcaster.signal();

        assert_eq!(watcher.try_recv(), Ok(true));
        assert_eq!(watcher.try_recv(), Err(TryRecvError::SignalReceived));
    }

    #[test]
    fn dropped_broadcaster_counts_as_signal() {
        let (mut watcher, broadcaster) = signal();
        drop(broadcaster);
        assert_eq!(watcher.try_recv(), Ok(true));
    }

    #[test]
    fn register_after_receipt_fails() {
        let (mut watcher, broadcaster) = signal();
        broadcaster.signal();
        assert_eq!(watcher.try_recv(), Ok(true));
        assert!(matches!(
            watcher.register(),
            Err(RegisterError::SignalReceived)
        ));
    }

    #[test]
    fn register_after_signal_before_receipt_succeeds() {
        let (mut watcher, broadcaster) = signal();
        broadcaster.signal();

        let mut late = watcher.register().expect("register failed");
        assert_eq!(watcher.try_recv(), Ok(true));
        assert_eq!(late.try_recv(), Ok(true));
    }
}
