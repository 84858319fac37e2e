//! Persistent task queue backed by the shared database.
//!
//! All state transitions happen inside immediate transactions, so concurrent
//! claimers serialize and a completing task can never miss a dependent that
//! needs unblocking. Notifications are published only after the owning
//! transaction commits, and subscribers treat them as best-effort: the
//! scheduler also polls.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Outcome, TaskError, TaskRow, TaskStatus, DEFAULT_PRIORITY};
use crate::db::Db;
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id        INTEGER PRIMARY KEY,
    hostname  TEXT NOT NULL UNIQUE,
    last_seen INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY,
    tenant_id     INTEGER REFERENCES tenants(id),
    parent_id     INTEGER REFERENCES tasks(id),
    task_type     TEXT NOT NULL,
    status        TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 128,
    input         TEXT NOT NULL,
    output        TEXT,
    retryable     INTEGER,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    executor_node INTEGER REFERENCES nodes(id),
    created_at    INTEGER NOT NULL,
    claimed_at    INTEGER,
    completed_at  INTEGER,
    expires_at    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks(status, priority DESC, created_at ASC, id ASC);
CREATE TABLE IF NOT EXISTS task_task_deps (
    task_id    INTEGER NOT NULL REFERENCES tasks(id),
    depends_on INTEGER NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, depends_on)
);
CREATE INDEX IF NOT EXISTS idx_task_deps_reverse ON task_task_deps(depends_on);
CREATE TABLE IF NOT EXISTS task_resources (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    max_concurrency INTEGER
);
CREATE TABLE IF NOT EXISTS task_resource_deps (
    task_id     INTEGER NOT NULL REFERENCES tasks(id),
    resource_id INTEGER NOT NULL REFERENCES task_resources(id),
    PRIMARY KEY (task_id, resource_id)
);
";

/// Which transition a notification reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskNoticeKind {
    /// The task became claimable.
    Available,
    /// The task reached `COMPLETE`.
    Completed,
}

/// A cross-worker notification about a task transition.
///
/// Notices model the database's pub/sub channels: they are published after
/// the transition's transaction commits and may be dropped under load, so
/// consumers always fall back to reading the row.
#[derive(Clone, Copy, Debug)]
pub struct TaskNotice {
    pub task_id: i64,
    pub kind: TaskNoticeKind,
}

/// A task waiting to be enqueued.
pub struct NewTask<'a> {
    pub task_type: &'a str,
    pub input: Value,
    pub tenant_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub priority: i64,
    pub depends_on: &'a [i64],
    pub resources: &'a [&'a str],
}

impl<'a> NewTask<'a> {
    /// A task of the given type with default priority and no relationships.
    pub fn new(task_type: &'a str, input: Value) -> Self {
        NewTask {
            task_type,
            input,
            tenant_id: None,
            parent_id: None,
            priority: DEFAULT_PRIORITY,
            depends_on: &[],
            resources: &[],
        }
    }
}

/// What a sweep pass changed.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Tasks returned to `OPEN`.
    pub reopened: Vec<i64>,
    /// Tasks parked as `DEAD` after exhausting retries.
    pub dead: Vec<i64>,
}

/// The durable task queue.
#[derive(Clone)]
pub struct TaskStore {
    db: Db,
    notices: broadcast::Sender<TaskNotice>,
}

impl TaskStore {
    /// Creates a task store over the given database handle.
    pub fn new(db: Db) -> Self {
        let (notices, _) = broadcast::channel(1024);
        TaskStore { db, notices }
    }

    /// Applies the schema. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        self.db.with(|conn| Ok(conn.execute_batch(SCHEMA)?)).await
    }

    /// Subscribes to post-commit transition notices.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotice> {
        self.notices.subscribe()
    }

    fn publish(&self, notices: Vec<TaskNotice>) {
        for notice in notices {
            // Send only fails when nobody is listening, which is fine.
            let _ = self.notices.send(notice);
        }
    }

    /// Registers (or refreshes) this node and returns its id.
    pub async fn register_node(&self, hostname: &str) -> Result<i64> {
        let hostname = hostname.to_owned();
        self.db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO nodes (hostname, last_seen) VALUES (?1, ?2)
                     ON CONFLICT (hostname) DO UPDATE SET last_seen = excluded.last_seen",
                    params![hostname, now_millis()],
                )?;
                let id = tx.query_row(
                    "SELECT id FROM nodes WHERE hostname = ?1",
                    params![hostname],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await
    }

    /// Refreshes a node's liveness timestamp.
    pub async fn heartbeat(&self, node_id: i64) -> Result<()> {
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE nodes SET last_seen = ?1 WHERE id = ?2",
                    params![now_millis(), node_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Makes sure a resource row exists without touching its cap.
    pub async fn ensure_resource(&self, name: &str) -> Result<()> {
        let name = name.to_owned();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO task_resources (name, max_concurrency) VALUES (?1, NULL)
                     ON CONFLICT DO NOTHING",
                    params![name],
                )?;
                Ok(())
            })
            .await
    }

    /// Creates or updates an admission-control resource.
    pub async fn create_resource(&self, name: &str, max_concurrency: Option<u32>) -> Result<i64> {
        let name = name.to_owned();
        self.db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO task_resources (name, max_concurrency) VALUES (?1, ?2)
                     ON CONFLICT (name) DO UPDATE SET max_concurrency = excluded.max_concurrency",
                    params![name, max_concurrency],
                )?;
                let id = tx.query_row(
                    "SELECT id FROM task_resources WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await
    }

    /// Enqueues a task, recording its dependency edges and resource needs.
    ///
    /// The task starts `OPEN`, or `BLOCKED` when any declared dependency is
    /// not yet complete.
    pub async fn submit(&self, task: NewTask<'_>) -> Result<i64> {
        let task_type = task.task_type.to_owned();
        let input = task.input.to_string();
        let tenant_id = task.tenant_id;
        let parent_id = task.parent_id;
        let priority = task.priority;
        let depends_on = task.depends_on.to_vec();
        let resources: Vec<String> = task.resources.iter().map(|s| s.to_string()).collect();

        let (id, notices) = self
            .db
            .transaction(move |tx| {
                let unmet = count_unmet(tx, &depends_on)?;
                let status = if unmet > 0 {
                    TaskStatus::Blocked
                } else {
                    TaskStatus::Open
                };

                tx.execute(
                    "INSERT INTO tasks
                     (tenant_id, parent_id, task_type, status, priority, input, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        tenant_id,
                        parent_id,
                        task_type,
                        status.as_str(),
                        priority,
                        input,
                        now_millis()
                    ],
                )?;
                let id = tx.last_insert_rowid();

                for dep in &depends_on {
                    tx.execute(
                        "INSERT INTO task_task_deps (task_id, depends_on) VALUES (?1, ?2)
                         ON CONFLICT DO NOTHING",
                        params![id, dep],
                    )?;
                }
                for resource in &resources {
                    tx.execute(
                        "INSERT INTO task_resources (name, max_concurrency) VALUES (?1, NULL)
                         ON CONFLICT DO NOTHING",
                        params![resource],
                    )?;
                    tx.execute(
                        "INSERT INTO task_resource_deps (task_id, resource_id)
                         SELECT ?1, id FROM task_resources WHERE name = ?2
                         ON CONFLICT DO NOTHING",
                        params![id, resource],
                    )?;
                }

                let notices = match status {
                    TaskStatus::Open => vec![TaskNotice {
                        task_id: id,
                        kind: TaskNoticeKind::Available,
                    }],
                    _ => Vec::new(),
                };
                Ok((id, notices))
            })
            .await?;

        self.publish(notices);
        Ok(id)
    }

    /// Enqueues a subtask and makes `parent` depend on it.
    ///
    /// The parent keeps running until it releases itself `Blocked`; from then
    /// on the dependency edge recorded here re-opens it once every subtask
    /// completes.
    pub async fn submit_subtask(
        &self,
        parent: &TaskRow,
        mut task: NewTask<'_>,
    ) -> Result<i64> {
        task.parent_id = Some(parent.id);
        task.tenant_id = task.tenant_id.or(parent.tenant_id);
        let child = self.submit(task).await?;

        self.db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO task_task_deps (task_id, depends_on) VALUES (?1, ?2)
                     ON CONFLICT DO NOTHING",
                    params![parent.id, child],
                )?;
                Ok(())
            })
            .await?;
        Ok(child)
    }

    /// Claims the next runnable task for `node_id`, if any.
    ///
    /// A task is runnable when it is `OPEN` with no executor, every task it
    /// depends on is `COMPLETE`, and no resource it requires is saturated.
    /// Candidates are ordered by priority (highest first), then age, then id.
    /// The select and the claiming update run in one write transaction, so
    /// two nodes can never claim the same task.
    pub async fn claim_next(&self, node_id: i64) -> Result<Option<TaskRow>> {
        self.db
            .transaction(move |tx| {
                let candidate: Option<i64> = tx
                    .query_row(
                        "SELECT t.id FROM tasks t
                         WHERE t.status = 'OPEN' AND t.executor_node IS NULL
                         AND NOT EXISTS (
                             SELECT 1 FROM task_task_deps d
                             JOIN tasks dt ON dt.id = d.depends_on
                             WHERE d.task_id = t.id AND dt.status <> 'COMPLETE')
                         AND NOT EXISTS (
                             SELECT 1 FROM task_resource_deps rd
                             JOIN task_resources r ON r.id = rd.resource_id
                             WHERE rd.task_id = t.id
                               AND r.max_concurrency IS NOT NULL
                               AND (SELECT COUNT(*) FROM tasks t2
                                    JOIN task_resource_deps rd2 ON rd2.task_id = t2.id
                                    WHERE rd2.resource_id = rd.resource_id
                                      AND t2.status = 'IN_PROGRESS')
                                   >= r.max_concurrency)
                         ORDER BY t.priority DESC, t.created_at ASC, t.id ASC
                         LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;

                let id = match candidate {
                    Some(id) => id,
                    None => return Ok(None),
                };

                tx.execute(
                    "UPDATE tasks SET status = 'IN_PROGRESS', executor_node = ?1,
                     claimed_at = ?2 WHERE id = ?3 AND status = 'OPEN'",
                    params![node_id, now_millis(), id],
                )?;
                get_task(tx, id)
            })
            .await
    }

    /// Applies a post-execution outcome to a task.
    ///
    /// Outcomes against tasks that are no longer `IN_PROGRESS` (or
    /// `BACKGROUND`, for completions) are ignored; in particular a task
    /// cancelled mid-flight stays `CANCELLED`.
    pub async fn release(&self, task_id: i64, outcome: Outcome, max_retries: u32) -> Result<()> {
        let notices = self
            .db
            .transaction(move |tx| match outcome {
                Outcome::Complete(output) => complete_tx(tx, task_id, output),
                Outcome::Failed(err) => fail_tx(tx, task_id, &err, max_retries),
                Outcome::Blocked => block_tx(tx, task_id),
                Outcome::Background(ttl) => background_tx(tx, task_id, ttl),
            })
            .await?;
        self.publish(notices);
        Ok(())
    }

    /// Marks a task complete. Shorthand for a `Complete` release.
    pub async fn complete(&self, task_id: i64, output: Value) -> Result<()> {
        self.release(task_id, Outcome::Complete(output), 0).await
    }

    /// Marks a task failed. Shorthand for a `Failed` release.
    pub async fn fail(&self, task_id: i64, error: TaskError, max_retries: u32) -> Result<()> {
        self.release(task_id, Outcome::Failed(error), max_retries)
            .await
    }

    /// Cancels a task administratively.
    ///
    /// In-flight executions are not interrupted; their eventual outcome is
    /// ignored. Returns `false` if the task was already terminal.
    pub async fn cancel(&self, task_id: i64) -> Result<bool> {
        self.db
            .transaction(move |tx| {
                let updated = tx.execute(
                    "UPDATE tasks SET status = 'CANCELLED', completed_at = ?1
                     WHERE id = ?2
                       AND status NOT IN ('COMPLETE', 'ERROR', 'CANCELLED', 'DEAD')",
                    params![now_millis(), task_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Loads a task row.
    pub async fn get(&self, task_id: i64) -> Result<Option<TaskRow>> {
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                get_task(&tx, task_id)
            })
            .await
    }

    /// Recovers tasks whose claims or background parking have gone stale.
    ///
    /// Safe to run on every node: the transitions are idempotent and execute
    /// under the write lock.
    pub async fn sweep(
        &self,
        claim_lease: Duration,
        node_timeout: Duration,
        max_retries: u32,
    ) -> Result<SweepReport> {
        let (report, notices) = self
            .db
            .transaction(move |tx| {
                let now = now_millis();
                let mut report = SweepReport::default();
                let mut notices = Vec::new();

                let claim_cutoff = now - claim_lease.as_millis() as i64;
                let node_cutoff = now - node_timeout.as_millis() as i64;
                let stale: Vec<(i64, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT t.id, t.retry_count FROM tasks t
                         LEFT JOIN nodes n ON n.id = t.executor_node
                         WHERE t.status = 'IN_PROGRESS'
                           AND t.claimed_at < ?1
                           AND (n.id IS NULL OR n.last_seen < ?2)",
                    )?;
                    let rows = stmt.query_map(params![claim_cutoff, node_cutoff], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                for (id, retry_count) in stale {
                    if retry_count < max_retries as i64 {
                        tx.execute(
                            "UPDATE tasks SET status = 'OPEN', retry_count = retry_count + 1,
                             executor_node = NULL, claimed_at = NULL WHERE id = ?1",
                            params![id],
                        )?;
                        report.reopened.push(id);
                        notices.push(TaskNotice {
                            task_id: id,
                            kind: TaskNoticeKind::Available,
                        });
                    } else {
                        tx.execute(
                            "UPDATE tasks SET status = 'DEAD', executor_node = NULL,
                             completed_at = ?1 WHERE id = ?2",
                            params![now, id],
                        )?;
                        report.dead.push(id);
                    }
                }

                let expired: Vec<i64> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM tasks
                         WHERE status = 'BACKGROUND' AND expires_at < ?1",
                    )?;
                    let rows = stmt.query_map(params![now], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                for id in expired {
                    tx.execute(
                        "UPDATE tasks SET status = 'OPEN', executor_node = NULL,
                         claimed_at = NULL, expires_at = NULL WHERE id = ?1",
                        params![id],
                    )?;
                    report.reopened.push(id);
                    notices.push(TaskNotice {
                        task_id: id,
                        kind: TaskNoticeKind::Available,
                    });
                }

                Ok((report, notices))
            })
            .await?;

        if !report.reopened.is_empty() || !report.dead.is_empty() {
            debug!(reopened = report.reopened.len(), dead = report.dead.len(), "sweep pass");
        }
        self.publish(notices);
        Ok(report)
    }

    /// Counts in-progress tasks currently holding a resource.
    pub async fn in_progress_on_resource(&self, name: &str) -> Result<usize> {
        let name = name.to_owned();
        self.db
            .with(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks t
                     JOIN task_resource_deps rd ON rd.task_id = t.id
                     JOIN task_resources r ON r.id = rd.resource_id
                     WHERE r.name = ?1 AND t.status = 'IN_PROGRESS'",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct(stringify!(TaskStore)).finish()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn count_unmet(tx: &Transaction, deps: &[i64]) -> Result<usize> {
    let mut unmet = 0;
    for dep in deps {
        let complete: Option<bool> = tx
            .query_row(
                "SELECT status = 'COMPLETE' FROM tasks WHERE id = ?1",
                params![dep],
                |row| row.get(0),
            )
            .optional()?;
        if !complete.unwrap_or(false) {
            unmet += 1;
        }
    }
    Ok(unmet)
}

fn count_unmet_recorded(tx: &Transaction, task_id: i64) -> Result<i64> {
    let unmet = tx.query_row(
        "SELECT COUNT(*) FROM task_task_deps d
         JOIN tasks dt ON dt.id = d.depends_on
         WHERE d.task_id = ?1 AND dt.status <> 'COMPLETE'",
        params![task_id],
        |row| row.get(0),
    )?;
    Ok(unmet)
}

fn complete_tx(tx: &Transaction, task_id: i64, output: Value) -> Result<Vec<TaskNotice>> {
    let updated = tx.execute(
        "UPDATE tasks SET status = 'COMPLETE', output = ?1, completed_at = ?2,
         executor_node = NULL, expires_at = NULL
         WHERE id = ?3 AND status IN ('IN_PROGRESS', 'BACKGROUND')",
        params![output.to_string(), now_millis(), task_id],
    )?;
    if updated == 0 {
        // Cancelled (or otherwise finalized) while running; the outcome is
        // dropped on the floor by design.
        return Ok(Vec::new());
    }

    let mut notices = vec![TaskNotice {
        task_id,
        kind: TaskNoticeKind::Completed,
    }];

    // Unblocking happens in the same transaction that records completion, so
    // a concurrent completion of a sibling dependency cannot leave the
    // dependent stranded.
    let dependents: Vec<i64> = {
        let mut stmt =
            tx.prepare("SELECT task_id FROM task_task_deps WHERE depends_on = ?1")?;
        let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for dependent in dependents {
        if count_unmet_recorded(tx, dependent)? == 0 {
            let reopened = tx.execute(
                "UPDATE tasks SET status = 'OPEN' WHERE id = ?1 AND status = 'BLOCKED'",
                params![dependent],
            )?;
            if reopened > 0 {
                notices.push(TaskNotice {
                    task_id: dependent,
                    kind: TaskNoticeKind::Available,
                });
            }
        }
    }

    Ok(notices)
}

fn fail_tx(
    tx: &Transaction,
    task_id: i64,
    error: &TaskError,
    max_retries: u32,
) -> Result<Vec<TaskNotice>> {
    let current: Option<(String, i64, String)> = tx
        .query_row(
            "SELECT status, retry_count, task_type FROM tasks WHERE id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (status, retry_count, task_type) = match current {
        Some(row) => row,
        None => return Ok(Vec::new()),
    };
    if status != TaskStatus::InProgress.as_str() && status != TaskStatus::Background.as_str() {
        return Ok(Vec::new());
    }

    if error.retryable && retry_count < max_retries as i64 {
        tx.execute(
            "UPDATE tasks SET status = 'OPEN', retry_count = retry_count + 1,
             retryable = 1, executor_node = NULL, claimed_at = NULL WHERE id = ?1",
            params![task_id],
        )?;
        return Ok(vec![TaskNotice {
            task_id,
            kind: TaskNoticeKind::Available,
        }]);
    }

    let terminal = if error.retryable {
        TaskStatus::Dead
    } else {
        TaskStatus::Error
    };
    tx.execute(
        "UPDATE tasks SET status = ?1, output = ?2, retryable = ?3,
         executor_node = NULL, completed_at = ?4 WHERE id = ?5",
        params![
            terminal.as_str(),
            error.to_output(&task_type).to_string(),
            error.retryable,
            now_millis(),
            task_id
        ],
    )?;
    Ok(Vec::new())
}

fn block_tx(tx: &Transaction, task_id: i64) -> Result<Vec<TaskNotice>> {
    // Subtasks may already have finished by the time the parent parks
    // itself; skip straight back to OPEN in that case.
    let target = if count_unmet_recorded(tx, task_id)? == 0 {
        TaskStatus::Open
    } else {
        TaskStatus::Blocked
    };
    let updated = tx.execute(
        "UPDATE tasks SET status = ?1, executor_node = NULL, claimed_at = NULL
         WHERE id = ?2 AND status = 'IN_PROGRESS'",
        params![target.as_str(), task_id],
    )?;

    if updated > 0 && target == TaskStatus::Open {
        return Ok(vec![TaskNotice {
            task_id,
            kind: TaskNoticeKind::Available,
        }]);
    }
    Ok(Vec::new())
}

fn background_tx(tx: &Transaction, task_id: i64, ttl: Duration) -> Result<Vec<TaskNotice>> {
    let expires_at = now_millis() + ttl.as_millis() as i64;
    tx.execute(
        "UPDATE tasks SET status = 'BACKGROUND', executor_node = NULL,
         claimed_at = NULL, expires_at = ?1
         WHERE id = ?2 AND status = 'IN_PROGRESS'",
        params![expires_at, task_id],
    )?;
    Ok(Vec::new())
}

fn get_task(tx: &Transaction, task_id: i64) -> Result<Option<TaskRow>> {
    let row = tx
        .query_row(
            "SELECT id, tenant_id, parent_id, task_type, status, priority, input, output,
                    retryable, retry_count, executor_node, created_at, claimed_at,
                    completed_at, expires_at
             FROM tasks WHERE id = ?1",
            params![task_id],
            read_task,
        )
        .optional()?;
    Ok(row)
}

fn read_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    let status: String = row.get(4)?;
    let input: String = row.get(6)?;
    let output: Option<String> = row.get(7)?;

    Ok(TaskRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        parent_id: row.get(2)?,
        task_type: row.get(3)?,
        status: status.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
        priority: row.get(5)?,
        input: serde_json::from_str(&input).unwrap_or(Value::Null),
        output: output.and_then(|text| serde_json::from_str(&text).ok()),
        retryable: row.get(8)?,
        retry_count: row.get(9)?,
        executor_node: row.get(10)?,
        created_at: millis_to_datetime(row.get(11)?),
        claimed_at: row.get::<_, Option<i64>>(12)?.map(millis_to_datetime),
        completed_at: row.get::<_, Option<i64>>(13)?.map(millis_to_datetime),
        expires_at: row.get::<_, Option<i64>>(14)?.map(millis_to_datetime),
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    async fn test_store() -> (TaskStore, i64) {
        let db = Db::open_in_memory().unwrap();
        Index::new(db.clone()).init().await.unwrap();
        let store = TaskStore::new(db);
        store.init().await.unwrap();
        let node = store.register_node("test-node").await.unwrap();
        (store, node)
    }

    #[tokio::test]
    async fn claim_follows_priority_then_age_then_id() {
        let (store, node) = test_store().await;
        let low = store
            .submit(NewTask {
                priority: 10,
                ..NewTask::new("t", Value::Null)
            })
            .await
            .unwrap();
        let high = store
            .submit(NewTask {
                priority: 200,
                ..NewTask::new("t", Value::Null)
            })
            .await
            .unwrap();
        let high_later = store
            .submit(NewTask {
                priority: 200,
                ..NewTask::new("t", Value::Null)
            })
            .await
            .unwrap();

        assert_eq!(store.claim_next(node).await.unwrap().unwrap().id, high);
        assert_eq!(store.claim_next(node).await.unwrap().unwrap().id, high_later);
        assert_eq!(store.claim_next(node).await.unwrap().unwrap().id, low);
        assert!(store.claim_next(node).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dependency_blocks_until_complete() {
        let (store, node) = test_store().await;
        let a = store.submit(NewTask::new("a", Value::Null)).await.unwrap();
        let b = store
            .submit(NewTask {
                depends_on: &[a],
                ..NewTask::new("b", Value::Null)
            })
            .await
            .unwrap();

        assert_eq!(
            store.get(b).await.unwrap().unwrap().status,
            TaskStatus::Blocked
        );

        // Only A is claimable.
        let claimed = store.claim_next(node).await.unwrap().unwrap();
        assert_eq!(claimed.id, a);
        assert!(store.claim_next(node).await.unwrap().is_none());

        store.complete(a, Value::Null).await.unwrap();
        let b_row = store.get(b).await.unwrap().unwrap();
        assert_eq!(b_row.status, TaskStatus::Open);

        let claimed = store.claim_next(node).await.unwrap().unwrap();
        assert_eq!(claimed.id, b);
        store.complete(b, Value::Null).await.unwrap();

        let a_row = store.get(a).await.unwrap().unwrap();
        let b_row = store.get(b).await.unwrap().unwrap();
        assert!(b_row.completed_at.unwrap() >= a_row.completed_at.unwrap());
    }

    #[tokio::test]
    async fn resource_cap_limits_concurrency() {
        let (store, node) = test_store().await;
        store.create_resource("gpu", Some(1)).await.unwrap();

        for _ in 0..2 {
            store
                .submit(NewTask {
                    resources: &["gpu"],
                    ..NewTask::new("t", Value::Null)
                })
                .await
                .unwrap();
        }

        let first = store.claim_next(node).await.unwrap().unwrap();
        // The second task exists and is OPEN, but the resource is saturated.
        assert!(store.claim_next(node).await.unwrap().is_none());
        assert_eq!(store.in_progress_on_resource("gpu").await.unwrap(), 1);

        store.complete(first.id, Value::Null).await.unwrap();
        assert!(store.claim_next(node).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retryable_failure_reopens_then_dies() {
        let (store, node) = test_store().await;
        let id = store.submit(NewTask::new("flaky", Value::Null)).await.unwrap();

        let max_retries = 1;
        let claimed = store.claim_next(node).await.unwrap().unwrap();
        store
            .fail(claimed.id, TaskError::retryable("transient"), max_retries)
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Open);
        assert_eq!(row.retry_count, 1);

        let claimed = store.claim_next(node).await.unwrap().unwrap();
        store
            .fail(claimed.id, TaskError::retryable("transient again"), max_retries)
            .await
            .unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Dead
        );
    }

    #[tokio::test]
    async fn terminal_failure_records_output() {
        let (store, node) = test_store().await;
        let id = store.submit(NewTask::new("doomed", Value::Null)).await.unwrap();
        store.claim_next(node).await.unwrap().unwrap();
        store
            .fail(id, TaskError::terminal("no such tenant"), 3)
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Error);
        let output = row.output.unwrap();
        assert_eq!(output["message"], "no such tenant");
        assert_eq!(output["retryable"], false);
    }

    #[tokio::test]
    async fn cancel_wins_over_late_completion() {
        let (store, node) = test_store().await;
        let id = store.submit(NewTask::new("t", Value::Null)).await.unwrap();
        store.claim_next(node).await.unwrap().unwrap();

        assert!(store.cancel(id).await.unwrap());
        store.complete(id, Value::from("late")).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Cancelled);
        assert!(row.output.is_none());
    }

    #[tokio::test]
    async fn background_expiry_reopens() {
        let (store, node) = test_store().await;
        let id = store.submit(NewTask::new("t", Value::Null)).await.unwrap();
        store.claim_next(node).await.unwrap().unwrap();
        store
            .release(id, Outcome::Background(Duration::from_millis(0)), 3)
            .await
            .unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Background
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = store
            .sweep(Duration::from_secs(300), Duration::from_secs(600), 3)
            .await
            .unwrap();
        assert_eq!(report.reopened, vec![id]);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Open
        );
    }

    #[tokio::test]
    async fn stale_claim_from_dead_node_is_recovered() {
        let (store, node) = test_store().await;
        let id = store.submit(NewTask::new("t", Value::Null)).await.unwrap();
        store.claim_next(node).await.unwrap().unwrap();

        // Zero lease and node timeout make the claim immediately stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = store
            .sweep(Duration::from_millis(1), Duration::from_millis(1), 3)
            .await
            .unwrap();
        assert_eq!(report.reopened, vec![id]);

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Open);
        assert_eq!(row.retry_count, 1);
        assert!(row.executor_node.is_none());
    }

    #[tokio::test]
    async fn subtask_reopens_blocked_parent() {
        let (store, node) = test_store().await;
        let parent_id = store.submit(NewTask::new("parent", Value::Null)).await.unwrap();
        let parent = store.claim_next(node).await.unwrap().unwrap();

        let child = store
            .submit_subtask(&parent, NewTask::new("child", Value::Null))
            .await
            .unwrap();
        store
            .release(parent_id, Outcome::Blocked, 3)
            .await
            .unwrap();
        assert_eq!(
            store.get(parent_id).await.unwrap().unwrap().status,
            TaskStatus::Blocked
        );

        let claimed = store.claim_next(node).await.unwrap().unwrap();
        assert_eq!(claimed.id, child);
        assert_eq!(claimed.parent_id, Some(parent_id));
        store.complete(child, Value::Null).await.unwrap();

        assert_eq!(
            store.get(parent_id).await.unwrap().unwrap().status,
            TaskStatus::Open
        );
    }

    #[tokio::test]
    async fn notifications_follow_transitions() {
        let (store, node) = test_store().await;
        let mut rx = store.subscribe();

        let id = store.submit(NewTask::new("t", Value::Null)).await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.task_id, id);
        assert_eq!(notice.kind, TaskNoticeKind::Available);

        store.claim_next(node).await.unwrap().unwrap();
        store.complete(id, Value::Null).await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.task_id, id);
        assert_eq!(notice.kind, TaskNoticeKind::Completed);
    }
}
