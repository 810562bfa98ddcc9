//! Background task runtime with per-resource reservations.
//!
//! A task declares the resources it mutates (a repository, a namespace, or
//! the whole registry for reclaim). The runtime grants at most one write
//! reservation per resource; readers never block. Reservations are plain
//! async mutexes keyed by resource name, acquired in sorted order so two
//! tasks can never deadlock on overlapping sets.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Progress record of a dispatched task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub resources: Vec<String>,
    pub state: TaskState,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskRuntime {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    records: RwLock<HashMap<Uuid, TaskRecord>>,
    handles: Mutex<HashMap<Uuid, tokio::task::AbortHandle>>,
}

impl TaskRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, resource: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire write reservations for all resources, waiting as needed.
    pub async fn reserve(&self, resources: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<String> = resources.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for resource in &sorted {
            let lock = self.lock_for(resource).await;
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Acquire reservations without waiting.
    ///
    /// A busy resource surfaces as `TooManyRequests`; the caller's client
    /// decides when to retry, no interval is suggested.
    pub async fn try_reserve(&self, resources: &[String]) -> Result<Vec<OwnedMutexGuard<()>>> {
        let mut sorted: Vec<String> = resources.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for resource in &sorted {
            let lock = self.lock_for(resource).await;
            match lock.try_lock_owned() {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    debug!(%resource, "reservation busy");
                    return Err(AppError::TooManyRequests);
                }
            }
        }
        Ok(guards)
    }

    /// Run a future inline while holding the given reservations.
    #[instrument(name = "task", skip(self, fut), fields(task = %name))]
    pub async fn run_reserved<T, F>(
        &self,
        name: &str,
        resources: Vec<String>,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let id = Uuid::new_v4();
        self.record(id, name, &resources, TaskState::Waiting).await;
        let _guards = self.reserve(&resources).await;
        self.set_state(id, TaskState::Running, None).await;
        match fut.await {
            Ok(value) => {
                self.set_state(id, TaskState::Completed, None).await;
                Ok(value)
            }
            Err(err) => {
                error!(task = name, "task failed: {err}");
                self.set_state(id, TaskState::Failed, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Dispatch a future onto the runtime, reserving its resources first.
    ///
    /// The returned id can be used to cancel the task; a canceled task
    /// drops its reservations and leaves its repositories at the last
    /// committed version.
    pub async fn spawn<F>(self: &Arc<Self>, name: &str, resources: Vec<String>, fut: F) -> Uuid
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.record(id, name, &resources, TaskState::Waiting).await;
        let runtime = Arc::clone(self);
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let _guards = runtime.reserve(&resources).await;
            runtime.set_state(id, TaskState::Running, None).await;
            match fut.await {
                Ok(()) => runtime.set_state(id, TaskState::Completed, None).await,
                Err(err) => {
                    error!(task = %task_name, "task failed: {err}");
                    runtime
                        .set_state(id, TaskState::Failed, Some(err.to_string()))
                        .await
                }
            }
        });
        self.handles.lock().await.insert(id, handle.abort_handle());
        id
    }

    pub async fn cancel(&self, id: Uuid) -> bool {
        let handle = self.handles.lock().await.remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                self.set_state(id, TaskState::Canceled, None).await;
                info!(%id, "task canceled");
                true
            }
            None => false,
        }
    }

    pub async fn task(&self, id: Uuid) -> Option<TaskRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.records.read().await.values().cloned().collect()
    }

    async fn record(&self, id: Uuid, name: &str, resources: &[String], state: TaskState) {
        self.records.write().await.insert(
            id,
            TaskRecord {
                id,
                name: name.to_string(),
                resources: resources.to_vec(),
                state,
                error: None,
            },
        );
    }

    async fn set_state(&self, id: Uuid, state: TaskState, error: Option<String>) {
        if let Some(record) = self.records.write().await.get_mut(&id) {
            // A canceled task stays canceled even if the abort lost the race.
            if record.state != TaskState::Canceled {
                record.state = state;
                record.error = error;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn try_reserve_conflicts_surface_as_too_many_requests() {
        let runtime = TaskRuntime::new();
        let guards = runtime
            .try_reserve(&["repository:alice/img".to_string()])
            .await
            .unwrap();
        let err = runtime
            .try_reserve(&["repository:alice/img".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests));
        drop(guards);
        runtime
            .try_reserve(&["repository:alice/img".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reservations_serialize_conflicting_tasks() {
        let runtime = Arc::new(TaskRuntime::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        // All tasks mutate the same resource; observed concurrency must
        // never exceed one.
        for _ in 0..8 {
            let runtime = Arc::clone(&runtime);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                runtime
                    .run_reserved("test", vec!["repository:r".to_string()], async {
                        let now = counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn disjoint_resources_do_not_block_each_other() {
        let runtime = TaskRuntime::new();
        let _a = runtime.try_reserve(&["repository:a".to_string()]).await.unwrap();
        runtime.try_reserve(&["repository:b".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn spawned_tasks_report_their_outcome() {
        let runtime = Arc::new(TaskRuntime::new());
        let id = runtime
            .spawn("ok", vec!["r1".to_string()], async { Ok(()) })
            .await;
        // Wait for the task to finish.
        for _ in 0..50 {
            if let Some(record) = runtime.task(id).await {
                if record.state == TaskState::Completed {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task did not complete");
    }
}
