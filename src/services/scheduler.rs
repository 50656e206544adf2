//! The Scheduler: a single-process registry of `{taskId -> (label, interval,
//! handler)}` (spec.md §4.2). The teacher wires its recurring work through
//! `tokio_cron_scheduler`, which expects cron expressions and has no
//! runtime `UpdateInterval` operation; this spec needs tasks registered and
//! retuned at arbitrary millisecond intervals at runtime, so the ticking is
//! reimplemented directly over `tokio::time::interval` while keeping the
//! teacher's per-task-closure, catch-and-log-panics style
//! (`jobs/mod.rs::start_scheduler`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type TaskHandler = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct TaskEntry {
    label: String,
    interval_ms: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    join_handle: JoinHandle<()>,
}

/// Runtime-registrable recurring task scheduler. Each task runs on its own
/// cadence; a tardy handler postpones its own next tick (never re-enters
/// concurrently) rather than stalling other tasks, since every task owns
/// an independent `tokio::spawn` loop.
pub struct Scheduler {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: RwLock::new(HashMap::new()) }
    }

    /// Registers a task that runs `handler` every `interval_ms`, starting
    /// one interval from now. Replaces any existing task under `task_id`.
    pub fn register<F, Fut>(&self, task_id: &str, label: &str, interval_ms: u64, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.unregister(task_id);

        let interval = Arc::new(AtomicU64::new(interval_ms));
        let running = Arc::new(AtomicBool::new(false));
        let label_owned = label.to_string();
        let task_id_owned = task_id.to_string();

        let loop_interval = interval.clone();
        let loop_running = running.clone();
        let handler: TaskHandler = Arc::new(move || Box::pin(handler()));

        let join_handle = tokio::spawn(async move {
            loop {
                let wait_ms = loop_interval.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;

                if loop_running.swap(true, Ordering::SeqCst) {
                    warn!(task = %task_id_owned, label = %label_owned, "skipping tick, previous run still in progress");
                    continue;
                }

                // Run on its own spawned task so a handler panic surfaces as
                // a JoinError instead of unwinding the scheduler's own loop.
                let handler = handler.clone();
                let run = tokio::spawn(async move { handler().await });
                if let Err(join_err) = run.await {
                    error!(task = %task_id_owned, label = %label_owned, error = %join_err, "scheduled task panicked");
                }

                loop_running.store(false, Ordering::SeqCst);
            }
        });

        self.tasks.write().insert(
            task_id.to_string(),
            TaskEntry {
                label: label.to_string(),
                interval_ms: interval,
                running,
                join_handle,
            },
        );

        info!(task = %task_id, label = %label, interval_ms, "registered scheduled task");
    }

    pub fn unregister(&self, task_id: &str) {
        if let Some(entry) = self.tasks.write().remove(task_id) {
            entry.join_handle.abort();
            info!(task = %task_id, label = %entry.label, "unregistered scheduled task");
        }
    }

    /// Retunes an already-registered task's cadence without restarting its
    /// current in-flight run.
    pub fn update_interval(&self, task_id: &str, new_interval_ms: u64) -> bool {
        let tasks = self.tasks.read();
        match tasks.get(task_id) {
            Some(entry) => {
                entry.interval_ms.store(new_interval_ms, Ordering::Relaxed);
                info!(task = %task_id, new_interval_ms, "updated scheduled task interval");
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> Vec<TaskSummary> {
        self.tasks
            .read()
            .iter()
            .map(|(id, entry)| TaskSummary {
                task_id: id.clone(),
                label: entry.label.clone(),
                interval_ms: entry.interval_ms.load(Ordering::Relaxed),
                currently_running: entry.running.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, entry) in self.tasks.write().drain() {
            entry.join_handle.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task_id: String,
    pub label: String,
    pub interval_ms: u64,
    pub currently_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_handler_on_its_interval() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();

        scheduler.register("test-task", "Test Task", 10, move || {
            let count = counted.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn update_interval_changes_cadence() {
        let scheduler = Scheduler::new();
        scheduler.register("t", "T", 1000, || async {});
        assert!(scheduler.update_interval("t", 10));
        assert!(!scheduler.update_interval("missing", 10));
    }

    #[tokio::test]
    async fn unregister_stops_the_task() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        scheduler.register("t", "T", 5, move || {
            let count = counted.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.unregister("t");
        let seen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
