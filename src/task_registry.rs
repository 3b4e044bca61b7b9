use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::RuntimeDb;

#[derive(Error, Debug)]
pub enum TaskRegistryError {
    #[error("db error: {0}")]
    Db(String),
}

/// Outcome of one attempt to run a task body under the registry's lock.
pub enum LockedRun {
    /// The lock was acquired and the body ran to completion (possibly
    /// returning an error from the body itself).
    Ran(Result<(), anyhow::Error>),
    /// Another instance holds the lock; this tick was skipped entirely.
    Locked,
}

/// Named singleton lock + last-run metadata for periodic tasks (§3, §4.8).
///
/// `run_locked` is the cross-process mutual-exclusion primitive: the
/// Postgres implementation acquires `SELECT ... FOR UPDATE NOWAIT` and keeps
/// that transaction open for the entire duration of `task`'s body, only
/// committing (lock row update included) once the body has returned. Lock
/// contention (SQLSTATE `55P03`) is reported as `LockedRun::Locked`, not an
/// error - another instance is already running this tick.
#[async_trait]
pub trait TaskRegistryStore: Send + Sync {
    async fn populate_task(&self, task_name: &str) -> Result<bool, TaskRegistryError>;
    async fn run_locked(&self, task_name: &str, task: Arc<dyn PeriodicTask>) -> Result<LockedRun, TaskRegistryError>;
}

pub fn memory() -> Arc<dyn TaskRegistryStore> {
    Arc::new(MemoryTaskRegistryStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn TaskRegistryStore> {
    Arc::new(PostgresTaskRegistryStore { db })
}

#[derive(Default)]
pub struct MemoryTaskRegistryStore {
    inner: Mutex<MemoryTaskRegistryInner>,
}

#[derive(Default, Clone)]
struct TaskRegistryRow {
    last_run: Option<DateTime<Utc>>,
    last_duration_ms: Option<i64>,
    last_error: Option<String>,
}

#[derive(Default)]
struct MemoryTaskRegistryInner {
    rows: HashMap<String, TaskRegistryRow>,
    locked: std::collections::HashSet<String>,
}

#[async_trait]
impl TaskRegistryStore for MemoryTaskRegistryStore {
    async fn populate_task(&self, task_name: &str) -> Result<bool, TaskRegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.contains_key(task_name) {
            return Ok(false);
        }
        inner.rows.insert(task_name.to_string(), TaskRegistryRow::default());
        Ok(true)
    }

    async fn run_locked(&self, task_name: &str, task: Arc<dyn PeriodicTask>) -> Result<LockedRun, TaskRegistryError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.locked.contains(task_name) {
                return Ok(LockedRun::Locked);
            }
            inner.locked.insert(task_name.to_string());
        }

        let start = Utc::now();
        let result = task.run_once_logic().await;
        let duration_ms = (Utc::now() - start).num_milliseconds();
        let last_error = result.as_ref().err().map(|error| error.to_string());

        let mut inner = self.inner.lock().unwrap();
        inner.locked.remove(task_name);
        if let Some(row) = inner.rows.get_mut(task_name) {
            row.last_run = Some(start);
            row.last_duration_ms = Some(duration_ms);
            row.last_error = last_error;
        }
        Ok(LockedRun::Ran(result))
    }
}

pub struct PostgresTaskRegistryStore {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl TaskRegistryStore for PostgresTaskRegistryStore {
    async fn populate_task(&self, task_name: &str) -> Result<bool, TaskRegistryError> {
        let client = self.db.get().await.map_err(|error| TaskRegistryError::Db(error.to_string()))?;
        let affected = client
            .execute(
                "INSERT INTO task_registry (task_name) VALUES ($1) ON CONFLICT DO NOTHING",
                &[&task_name],
            )
            .await
            .map_err(|error| TaskRegistryError::Db(error.to_string()))?;
        Ok(affected == 1)
    }

    async fn run_locked(&self, task_name: &str, task: Arc<dyn PeriodicTask>) -> Result<LockedRun, TaskRegistryError> {
        let mut client = self.db.get().await.map_err(|error| TaskRegistryError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| TaskRegistryError::Db(error.to_string()))?;

        // Held open for the whole task body below; the row lock (and thus
        // cross-process exclusion) only releases on commit/drop after the
        // body has finished and last_run/last_duration/last_error are written.
        match tx.query_opt("SELECT task_name FROM task_registry WHERE task_name = $1 FOR UPDATE NOWAIT", &[&task_name]).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(TaskRegistryError::Db(format!("task registry row for {task_name} missing"))),
            Err(error) => {
                // SQLSTATE 55P03 = lock_not_available: another instance holds the row lock.
                return if error.code().map(|code| code.code()) == Some("55P03") {
                    Ok(LockedRun::Locked)
                } else {
                    Err(TaskRegistryError::Db(error.to_string()))
                };
            }
        }

        let start = Utc::now();
        let result = task.run_once_logic().await;
        let duration_ms = (Utc::now() - start).num_milliseconds();
        let last_error = result.as_ref().err().map(|error| error.to_string());

        tx.execute(
            "UPDATE task_registry SET last_run = $2, last_duration_ms = $3, last_error = $4 WHERE task_name = $1",
            &[&task_name, &start, &duration_ms, &last_error],
        )
        .await
        .map_err(|error| TaskRegistryError::Db(error.to_string()))?;
        tx.commit().await.map_err(|error| TaskRegistryError::Db(error.to_string()))?;

        Ok(LockedRun::Ran(result))
    }
}

/// A periodic charger or consumer body, run under the task registry's lock.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;
    async fn run_once_logic(&self) -> Result<(), anyhow::Error>;
}

/// Shared run-loop: register once, then on every tick try to acquire the
/// registry lock, run the task body in isolation from the registry
/// bookkeeping, and always record last_run/last_duration/last_error even
/// if the body failed (§4.8). `limit = 0` runs forever.
pub async fn run_forever(
    store: Arc<dyn TaskRegistryStore>,
    task: Arc<dyn PeriodicTask>,
    initial_delay: StdDuration,
    loop_sleep: StdDuration,
    error_sleep: StdDuration,
    limit: usize,
) {
    info!(task = task.name(), "starting periodic task");
    tokio::time::sleep(initial_delay).await;
    if let Err(error) = store.populate_task(task.name()).await {
        error!(task = task.name(), reason = %error, "failed to populate task registry row");
        return;
    }

    let mut ticks = 0usize;
    loop {
        let sleep_for = match tick(&store, &task).await {
            TickOutcome::Ran(Ok(())) => loop_sleep,
            TickOutcome::Ran(Err(error)) => {
                warn!(task = task.name(), reason = %error, "periodic task tick failed");
                error_sleep
            }
            TickOutcome::Skipped => loop_sleep,
        };
        ticks += 1;
        if limit > 0 && ticks >= limit {
            break;
        }
        tokio::time::sleep(sleep_for).await;
    }
}

enum TickOutcome {
    Ran(Result<(), anyhow::Error>),
    Skipped,
}

async fn tick(store: &Arc<dyn TaskRegistryStore>, task: &Arc<dyn PeriodicTask>) -> TickOutcome {
    match store.run_locked(task.name(), task.clone()).await {
        Ok(LockedRun::Ran(result)) => TickOutcome::Ran(result),
        Ok(LockedRun::Locked) => {
            info!(task = task.name(), "skipping tick, task registry row is locked elsewhere");
            TickOutcome::Skipped
        }
        Err(error) => {
            error!(task = task.name(), reason = %error, "failed to lock task registry row");
            TickOutcome::Skipped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct SlowTask {
        name: String,
        entered: Arc<Notify>,
        release: Arc<Notify>,
        run_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeriodicTask for SlowTask {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run_once_logic(&self) -> Result<(), anyhow::Error> {
            self.run_count.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_ticks_do_not_both_run_the_task_body() {
        let store = memory();
        store.populate_task("slow").await.unwrap();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let run_count = Arc::new(AtomicUsize::new(0));
        let task: Arc<dyn PeriodicTask> = Arc::new(SlowTask {
            name: "slow".to_string(),
            entered: entered.clone(),
            release: release.clone(),
            run_count: run_count.clone(),
        });

        let first = tokio::spawn({
            let store = store.clone();
            let task = task.clone();
            async move { tick(&store, &task).await }
        });

        // Wait until the first tick is inside the task body (lock held) before
        // racing a second tick against it.
        entered.notified().await;
        let second = tick(&store, &task).await;
        assert!(matches!(second, TickOutcome::Skipped));
        assert_eq!(run_count.load(Ordering::SeqCst), 1, "the second tick must not have run the body");

        release.notify_one();
        let first_outcome = first.await.unwrap();
        assert!(matches!(first_outcome, TickOutcome::Ran(Ok(()))));
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }
}
