//! Process-wide stop signal observable from blocking threads.
//!
//! Stop is signalled by disconnecting a zero-capacity channel: every waiting
//! receiver wakes at once, and a late observer still sees the disconnect.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Fires the stop signal. Consumed on use; dropping it without calling
/// [`trigger`](Self::trigger) also stops the pipeline.
pub struct StopTrigger {
    tx: Sender<()>,
}

/// Cloneable observer side of the stop signal.
#[derive(Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

/// Create a connected trigger/signal pair.
pub fn stop_signal() -> (StopTrigger, StopSignal) {
    let (tx, rx) = bounded(0);
    (StopTrigger { tx }, StopSignal { rx })
}

impl StopTrigger {
    pub fn trigger(self) {
        tracing::debug!("stop signal triggered");
        drop(self.tx);
    }
}

impl StopSignal {
    /// True once the trigger has fired.
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `timeout`, returning early with `true` if stop fires meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_not_stopped_initially() {
        let (_trigger, signal) = stop_signal();
        assert!(!signal.is_stopped());
        assert!(!signal.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let (trigger, signal) = stop_signal();
        let waiter = signal.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = waiter.wait(Duration::from_secs(30));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        trigger.trigger();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5), "wait was not interrupted: {elapsed:?}");
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_dropped_trigger_stops() {
        let (trigger, signal) = stop_signal();
        drop(trigger);
        assert!(signal.is_stopped());
        assert!(signal.wait(Duration::from_secs(30)));
    }
}
