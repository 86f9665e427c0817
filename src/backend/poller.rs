//! Background poll task
//!
//! A [`Poller`] runs a tick closure on its own thread at a fixed interval
//! until it is stopped. The sleep between ticks is split into short slices
//! that check the cancellation flag, so [`Poller::stop`] returns within one
//! slice of the current tick finishing. Dropping a poller stops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep between cancellation checks
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Handle to a running poll thread
pub struct Poller {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn a thread calling `tick` every `interval`
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::debug!("Poll loop started ({} ms)", interval.as_millis());
                while !flag.load(Ordering::SeqCst) {
                    tick();
                    sleep_unless_cancelled(interval, &flag);
                }
                tracing::debug!("Poll loop stopped");
            })?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to exit and wait for it
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Poll thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_unless_cancelled(interval: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + interval;
    loop {
        let now = Instant::now();
        if now >= deadline || cancel.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut poller = Poller::spawn("test-poll", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        assert!(poller.is_running());
        poller.stop();
        assert!(!poller.is_running());

        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_interrupts_long_interval() {
        let mut poller = Poller::spawn("test-poll", Duration::from_secs(30), || {}).unwrap();
        let started = Instant::now();
        poller.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_drop_stops_thread() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        {
            let _poller = Poller::spawn("test-poll", Duration::from_millis(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        let after_drop = ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }
}
