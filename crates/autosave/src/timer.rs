use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

/// Runs a task after a cancellable delay.
///
/// Cancellation only affects a fire that has not happened yet: once the delay
/// elapses the task runs on its own spawned task, so re-arming or cancelling
/// from inside that task (or while it is mid-save) never interrupts it.
/// Dropping the timer cancels any pending fire.
pub struct Timer {
    name: &'static str,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(None),
        }
    }

    /// Arms the timer, replacing any pending fire.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            trace!(target = "autosave.timer", timer = name, "fired");
            tokio::spawn(task);
        });
        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Fires `make_task()` every `period` until cancelled.
    pub fn repeat<F, Fut>(&self, period: Duration, make_task: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let handle = tokio::spawn(async move {
            loop {
                sleep(period).await;
                trace!(target = "autosave.timer", timer = name, "tick");
                tokio::spawn(make_task());
            }
        });
        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Returns whether a pending fire was cancelled.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let timer = Timer::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        timer.schedule(Duration::from_millis(800), counter_task(&fired));

        sleep(Duration::from_millis(799)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_coalesces_bursts() {
        let timer = Timer::new("debounce");
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            timer.schedule(Duration::from_millis(800), counter_task(&fired));
            sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_drop_prevent_fire() {
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = Timer::new("cancelled");
        timer.schedule(Duration::from_millis(100), counter_task(&fired));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let dropped = Timer::new("dropped");
        dropped.schedule(Duration::from_millis(100), counter_task(&fired));
        drop(dropped);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_ticks_until_cancelled() {
        let timer = Timer::new("periodic");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.repeat(Duration::from_secs(30), move || counter_task(&counter));

        sleep(Duration::from_secs(95)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        timer.cancel();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
