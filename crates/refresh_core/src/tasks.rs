//! Priority-based admission for background computation.
//!
//! Admission depends on the current pressure level; admitted work then
//! queues on a semaphore sized to the host's parallelism. Low-priority work
//! still waiting for a permit when pressure reaches Critical is cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{Error, PressureLevel, TaskPriority};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pressure::PressureListener;

/// Whether `priority` is admitted at `level`.
pub fn admits(priority: TaskPriority, level: PressureLevel) -> bool {
    match priority {
        TaskPriority::Critical => true,
        TaskPriority::High | TaskPriority::Normal => level < PressureLevel::Critical,
        TaskPriority::Low => level < PressureLevel::Urgent,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub running: usize,
    pub pending: usize,
    pub pressure: PressureLevel,
    pub parallelism: usize,
    pub completed: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

struct PendingTask {
    priority: TaskPriority,
    token: CancellationToken,
}

struct Inner {
    permits: Arc<Semaphore>,
    parallelism: usize,
    level: AtomicU8,
    running: AtomicUsize,
    pending: Mutex<HashMap<Uuid, PendingTask>>,
    completed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Decrements the running gauge even if the work future is dropped.
struct RunningGuard<'a>(&'a Inner);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct PriorityTaskScheduler {
    inner: Arc<Inner>,
}

impl PriorityTaskScheduler {
    /// `max_parallelism == 0` sizes the pool to the available parallelism.
    pub fn new(max_parallelism: usize) -> Self {
        let parallelism = if max_parallelism == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            max_parallelism
        };

        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(parallelism)),
                parallelism,
                level: AtomicU8::new(PressureLevel::Normal.as_u8()),
                running: AtomicUsize::new(0),
                pending: Mutex::new(HashMap::new()),
                completed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    pub fn pressure(&self) -> PressureLevel {
        PressureLevel::from_u8(self.inner.level.load(Ordering::SeqCst))
    }

    /// Run `work` if admitted at the current pressure level.
    ///
    /// Rejection and cancellation are reported as errors so the caller can
    /// substitute a degraded result.
    pub async fn submit<T, Fut>(&self, priority: TaskPriority, work: Fut) -> Result<T, Error>
    where
        Fut: Future<Output = T>,
    {
        let level = self.pressure();
        if !admits(priority, level) {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Rejected {} task under {} pressure", priority, level);
            return Err(Error::TaskRejected {
                priority: priority.to_string(),
                pressure: level.to_string(),
            });
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.inner.pending.lock().insert(
            id,
            PendingTask {
                priority,
                token: token.clone(),
            },
        );

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = self.inner.permits.clone().acquire_owned() => permit.ok(),
        };

        // Whoever removes the entry decides: a bulk cancel may have won the race.
        let still_tracked = self.inner.pending.lock().remove(&id).is_some();
        let Some(_permit) = permit.filter(|_| still_tracked) else {
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Cancelled(format!("{} priority task {}", priority, id)));
        };

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let _running = RunningGuard(&self.inner);
        let out = work.await;
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// [`submit`](Self::submit), falling back to `fallback` when not run.
    pub async fn submit_or_else<T, Fut, F>(&self, priority: TaskPriority, work: Fut, fallback: F) -> T
    where
        Fut: Future<Output = T>,
        F: FnOnce() -> T,
    {
        match self.submit(priority, work).await {
            Ok(out) => out,
            Err(e) => {
                debug!("Using degraded result: {}", e);
                fallback()
            }
        }
    }

    /// Cancel every Low-priority task that has not started yet.
    pub fn cancel_pending_low(&self) -> usize {
        let mut pending = self.inner.pending.lock();
        let ids: Vec<Uuid> = pending
            .iter()
            .filter(|(_, task)| task.priority == TaskPriority::Low)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(task) = pending.remove(id) {
                task.token.cancel();
            }
        }
        ids.len()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            running: self.inner.running.load(Ordering::SeqCst),
            pending: self.inner.pending.lock().len(),
            pressure: self.pressure(),
            parallelism: self.inner.parallelism,
            completed: self.inner.completed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl PressureListener for PriorityTaskScheduler {
    fn on_pressure_change(&self, _previous: PressureLevel, current: PressureLevel) {
        self.inner.level.store(current.as_u8(), Ordering::SeqCst);
        if current == PressureLevel::Critical {
            let cancelled = self.cancel_pending_low();
            if cancelled > 0 {
                info!("Cancelled {} pending low-priority tasks under critical pressure", cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_admission_matrix() {
        use PressureLevel::*;
        use TaskPriority as P;

        for level in [Normal, Warning, Urgent, Critical] {
            assert!(admits(P::Critical, level));
        }
        assert!(admits(P::High, Urgent));
        assert!(!admits(P::High, Critical));
        assert!(admits(P::Normal, Urgent));
        assert!(!admits(P::Normal, Critical));
        assert!(admits(P::Low, Warning));
        assert!(!admits(P::Low, Urgent));
    }

    #[tokio::test]
    async fn test_rejected_submission_uses_fallback() {
        let scheduler = PriorityTaskScheduler::new(2);
        scheduler.on_pressure_change(PressureLevel::Normal, PressureLevel::Urgent);

        let result = scheduler
            .submit_or_else(TaskPriority::Low, async { vec![1, 2, 3, 4] }, || vec![1])
            .await;
        assert_eq!(result, vec![1]);

        let critical = scheduler.submit(TaskPriority::Critical, async { 7 }).await;
        assert_eq!(critical.unwrap(), 7);
        assert_eq!(scheduler.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_critical_pressure_cancels_pending_low_tasks() {
        let scheduler = PriorityTaskScheduler::new(1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupy the only permit.
        let busy = scheduler.clone();
        let blocker = tokio::spawn(async move {
            busy.submit(TaskPriority::High, async move {
                let _ = release_rx.await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.snapshot().running, 1);

        let low = scheduler.clone();
        let queued_low = tokio::spawn(async move { low.submit(TaskPriority::Low, async { 1 }).await });
        let normal = scheduler.clone();
        let queued_normal =
            tokio::spawn(async move { normal.submit(TaskPriority::Critical, async { 2 }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.snapshot().pending, 2);

        scheduler.on_pressure_change(PressureLevel::Normal, PressureLevel::Critical);
        assert!(matches!(queued_low.await.unwrap(), Err(Error::Cancelled(_))));
        assert_eq!(scheduler.snapshot().pending, 1);

        release_tx.send(()).unwrap();
        assert!(blocker.await.unwrap().is_ok());
        assert_eq!(queued_normal.await.unwrap().unwrap(), 2);

        let snap = scheduler.snapshot();
        assert_eq!(snap.running, 0);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.pressure, PressureLevel::Critical);
    }

    #[tokio::test]
    async fn test_parallelism_bounds_running_tasks() {
        let scheduler = PriorityTaskScheduler::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let s = scheduler.clone();
            let peak = peak.clone();
            let live = live.clone();
            handles.push(tokio::spawn(async move {
                s.submit(TaskPriority::Normal, async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.snapshot().completed, 6);
    }
}
