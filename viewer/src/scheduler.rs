//! Periodic background polls tied to a viewer session.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct PollingTask {
    name: String,
    active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Runs named callbacks on fixed intervals until cancelled.
///
/// A tick waits for the previous callback to finish, so a task's callbacks
/// never overlap. Ticks missed while a callback runs are delayed, not bursted.
#[derive(Default)]
pub(crate) struct PollingScheduler {
    tasks: Vec<PollingTask>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start calling `callback` every `period`, first one `period` from now.
    pub fn add_task<F, Fut>(&mut self, name: impl Into<String>, period: Duration, mut callback: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let active = Arc::new(AtomicBool::new(true));
        let task_active = Arc::clone(&active);
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !task_active.load(Ordering::SeqCst) {
                    break;
                }
                callback().await;
            }
        });
        tracing::debug!(task = %name, ?period, "Polling task started");
        self.tasks.push(PollingTask {
            name,
            active,
            handle,
        });
    }

    /// Stop every task and wait until none of them is running.
    pub async fn cancel_all(&mut self) {
        for task in &self.tasks {
            task.active.store(false, Ordering::SeqCst);
            task.handle.abort();
        }
        for task in self.tasks.drain(..) {
            // Cancellation is the expected outcome.
            let _ = task.handle.await;
            tracing::debug!(task = %task.name, "Polling task stopped");
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_task(scheduler: &mut PollingScheduler, period: Duration) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);
        scheduler.add_task("count", period, move || {
            let count = Arc::clone(&task_count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_one_period_after_registration() {
        let mut scheduler = PollingScheduler::new();
        let count = counting_task(&mut scheduler, Duration::from_millis(100));

        advance(50).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        advance(60).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        advance(100).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_every_task() {
        let mut scheduler = PollingScheduler::new();
        let fast = counting_task(&mut scheduler, Duration::from_millis(100));
        let slow = counting_task(&mut scheduler, Duration::from_millis(300));
        assert_eq!(scheduler.len(), 2);

        advance(350).await;
        assert_eq!(fast.load(Ordering::SeqCst), 3);
        assert_eq!(slow.load(Ordering::SeqCst), 1);

        scheduler.cancel_all().await;
        assert!(scheduler.is_empty());

        advance(1000).await;
        assert_eq!(fast.load(Ordering::SeqCst), 3);
        assert_eq!(slow.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_callbacks_never_overlap() {
        let mut scheduler = PollingScheduler::new();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let task_starts = Arc::clone(&starts);
        scheduler.add_task("slow", Duration::from_millis(100), move || {
            let starts = Arc::clone(&task_starts);
            async move {
                starts.lock().unwrap().push(Instant::now());
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        });

        advance(1000).await;
        scheduler.cancel_all().await;

        let starts = starts.lock().unwrap();
        assert!(starts.len() >= 3);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }
}
