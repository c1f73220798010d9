//! Cancellable background tasks
//!
//! Each task runs on its own named OS thread and idles on a wake channel.
//! Stopping a task clears its running flag, wakes it and joins it, so
//! shutdown never waits out an interval.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

/// Wakes the task owning the matching `WakeSignal`. Wakes coalesce: any
/// number of wakes before the task runs produce one run.
#[derive(Clone, Debug)]
pub struct Waker {
    tx: Sender<()>,
}

impl Waker {
    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                debug!("Wake dropped: task already gone");
            }
        }
    }
}

/// Receiving side of a wake channel
pub struct WakeSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn waker(&self) -> Waker {
        Waker {
            tx: self.tx.clone(),
        }
    }

    /// Wait for a wake or for `timeout` to pass. Returns false once every
    /// waker is gone.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => self.rx.recv().is_ok(),
            Some(d) => !matches!(self.rx.recv_timeout(d), Err(RecvTimeoutError::Disconnected)),
        }
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// When a task body runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Only when woken
    OnWake,
    /// When woken or after the interval elapses, whichever comes first
    Every(Duration),
}

/// Read-only view of a task's running flag, handed to the body so long
/// loops can bail out early.
#[derive(Clone)]
pub struct TaskControl {
    running: Arc<AtomicBool>,
}

impl TaskControl {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Handle to a running background task
pub struct BackgroundTask {
    name: String,
    running: Arc<AtomicBool>,
    waker: Waker,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `body` on a new thread driven by `signal`.
    pub fn spawn<F>(name: &str, signal: WakeSignal, schedule: Schedule, mut body: F) -> io::Result<Self>
    where
        F: FnMut(&TaskControl) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let waker = signal.waker();
        let control = TaskControl {
            running: Arc::clone(&running),
        };
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("Task {} started", thread_name);
                loop {
                    let timeout = match schedule {
                        Schedule::OnWake => None,
                        Schedule::Every(d) => Some(d),
                    };
                    if !signal.wait(timeout) || !control.is_running() {
                        break;
                    }
                    signal.drain();
                    body(&control);
                }
                debug!("Task {} stopped", thread_name);
            })?;

        Ok(Self {
            name: name.to_string(),
            running,
            waker,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub fn wake(&self) {
        self.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the task to stop without waiting for it
    pub fn stop_noblock(&self) {
        self.running.store(false, Ordering::Release);
        self.waker.wake();
    }

    /// Stop the task and wait for its thread to exit
    pub fn stop(&mut self) {
        self.stop_noblock();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                warn!("Task {} asked to join itself; detaching", self.name);
                return;
            }
            if handle.join().is_err() {
                warn!("Task {} panicked", self.name);
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_runs_on_wake_only() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut task = BackgroundTask::spawn("test-wake", WakeSignal::new(), Schedule::OnWake, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        task.wake();
        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        task.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut task = BackgroundTask::spawn(
            "test-periodic",
            WakeSignal::new(),
            Schedule::Every(Duration::from_millis(10)),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        task.stop();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_stop_is_immediate_for_long_interval() {
        let mut task = BackgroundTask::spawn(
            "test-stop",
            WakeSignal::new(),
            Schedule::Every(Duration::from_secs(3600)),
            |_| {},
        )
        .unwrap();
        let started = Instant::now();
        task.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!task.is_running());
    }

    #[test]
    fn test_wakes_coalesce() {
        let signal = WakeSignal::new();
        let waker = signal.waker();
        waker.wake();
        waker.wake();
        waker.wake();
        assert!(signal.wait(Some(Duration::from_millis(10))));
        signal.drain();
        assert!(signal.rx.try_recv().is_err());
    }
}
