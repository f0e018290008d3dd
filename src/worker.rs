//! Named background thread that runs a tick at a fixed interval.
//!
//! The worker holds only a `Weak` reference to its target, so the owner can
//! be dropped while the thread sleeps; the thread exits on the next wakeup.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to a running periodic thread. Dropping it stops and joins.
pub struct PeriodicWorker {
    name: String,
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicWorker {
    /// Spawn `tick` every `interval` against `target`.
    ///
    /// A panicking tick is logged and the next interval retries.
    pub fn spawn<T, F>(
        name: &str,
        interval: Duration,
        target: Weak<T>,
        tick: F,
    ) -> std::io::Result<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = signal.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                {
                    let mut stop = thread_signal.stop.lock();
                    if !*stop {
                        thread_signal.wake.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        break;
                    }
                }

                let Some(target) = target.upgrade() else {
                    break;
                };
                if catch_unwind(AssertUnwindSafe(|| tick(&target))).is_err() {
                    tracing::error!(worker = %thread_name, "Background pass panicked, retrying next interval");
                }
            }
            tracing::debug!(worker = %thread_name, "Worker exited");
        })?;

        tracing::debug!(worker = name, interval_ms = interval.as_millis() as u64, "Worker started");
        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the thread without waiting for it.
    pub fn signal_stop(&self) {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
    }

    /// Signal and join.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            // The last strong reference may be released on the worker itself.
            let joined = handle.thread().id() != thread::current().id();
            if joined && handle.join().is_err() {
                tracing::warn!(worker = %self.name, "Worker thread panicked on exit");
            }
            tracing::debug!(worker = %self.name, joined, "Worker stopped");
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
