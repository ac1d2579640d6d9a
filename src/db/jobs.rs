//! Job run persistence.
//!
//! `job_runs` holds the current state of each job; `job_run_events` is an
//! append-only status history. Terminal transitions are guarded by the
//! current status, so `completed` and `failed` are written at most once.

use anyhow::{Result, anyhow};
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, types::Type};
use tokio_rusqlite::{Connection, params};
use uuid::Uuid;

use crate::core::{BackupJob, FinalizeSummary, JobRunEvent, JobRunRecord, JobRunWithHistory, JobStatus};

const SELECT_RECORD: &str = "SELECT id, status, total_devices, processed_devices, result,
        error_message, created_at, started_at, completed_at
     FROM job_runs";

pub async fn create(conn: &Connection, job: &BackupJob) -> Result<JobRunRecord> {
    let job_id = job.job_id.clone();
    let total = job.total_devices() as i64;
    let parameters = serde_json::to_string(job)?;

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO job_runs (id, status, total_devices, parameters)
             VALUES (?1, 'pending', ?2, ?3)",
            params![&job_id, total, &parameters],
        )?;

        insert_event(&tx, &job_id, JobStatus::Pending, Some("Job created"))?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    get(conn, job.job_id.clone())
        .await?
        .ok_or_else(|| anyhow!("Job run {} vanished after insert", job.job_id))
}

/// `pending → running`. Returns false if the job was not pending.
pub async fn mark_running(conn: &Connection, job_id: String) -> Result<bool> {
    transition(
        conn,
        job_id,
        "UPDATE job_runs SET status = 'running', started_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND status = 'pending'",
        JobStatus::Running,
        None,
    )
    .await
}

/// `pending → failed`. Returns false if the job had already left `pending`.
pub async fn mark_failed(conn: &Connection, job_id: String, message: String) -> Result<bool> {
    fail(conn, job_id, message, JobStatus::Pending).await
}

/// `running → failed`, for a job whose summary could not be recorded.
/// Returns false if the job was not running.
pub async fn fail_running(conn: &Connection, job_id: String, message: String) -> Result<bool> {
    fail(conn, job_id, message, JobStatus::Running).await
}

async fn fail(conn: &Connection, job_id: String, message: String, from: JobStatus) -> Result<bool> {
    let changed = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let changed = tx.execute(
                "UPDATE job_runs SET status = 'failed', error_message = ?2,
                    completed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status = ?3",
                params![&job_id, &message, from.as_str()],
            )?;
            if changed > 0 {
                insert_event(&tx, &job_id, JobStatus::Failed, Some(&message))?;
            }
            tx.commit()?;
            Ok::<usize, rusqlite::Error>(changed)
        })
        .await?;

    Ok(changed > 0)
}

/// `running → completed`, storing the summary. Returns false if the job was not running.
pub async fn complete(
    conn: &Connection,
    job_id: String,
    summary: &FinalizeSummary,
    processed_devices: usize,
) -> Result<bool> {
    let result = serde_json::to_string(summary)?;
    let description = format!(
        "{} backed up, {} failed",
        summary.backed_up_count, summary.failed_count
    );
    let processed = processed_devices as i64;

    let changed = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let changed = tx.execute(
                "UPDATE job_runs SET status = 'completed', result = ?2, processed_devices = ?3,
                    completed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status = 'running'",
                params![&job_id, &result, processed],
            )?;
            if changed > 0 {
                insert_event(&tx, &job_id, JobStatus::Completed, Some(&description))?;
            }
            tx.commit()?;
            Ok::<usize, rusqlite::Error>(changed)
        })
        .await?;

    Ok(changed > 0)
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<JobRunRecord>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(&format!("{SELECT_RECORD} WHERE id = ?1"))?;
        let record = stmt.query_row(params![job_id], map_record).optional()?;
        Ok::<_, rusqlite::Error>(record)
    })
    .await
    .map_err(|e| anyhow!("Failed to get job run: {}", e))
}

pub async fn get_with_history(conn: &Connection, job_id: String) -> Result<Option<JobRunWithHistory>> {
    let Some(record) = get(conn, job_id.clone()).await? else {
        return Ok(None);
    };

    let history = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT status, description, created_at FROM job_run_events
                 WHERE job_run_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![job_id], |row| {
                Ok(JobRunEvent {
                    status: parse_status(row, 0)?,
                    description: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?;
            let history = rows.collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(history)
        })
        .await
        .map_err(|e| anyhow!("Failed to get job run history: {}", e))?;

    Ok(Some(JobRunWithHistory { record, history }))
}

pub async fn list(
    conn: &Connection,
    limit: u32,
    offset: u32,
    status: Option<JobStatus>,
) -> Result<Vec<JobRunRecord>> {
    conn.call(move |c| {
        let rows = match status {
            Some(status) => {
                let mut stmt = c.prepare(&format!(
                    "{SELECT_RECORD} WHERE status = ?1 ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str(), limit, offset], map_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = c.prepare(&format!(
                    "{SELECT_RECORD} ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(params![limit, offset], map_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
    .map_err(|e| anyhow!("Failed to list job runs: {}", e))
}

async fn transition(
    conn: &Connection,
    job_id: String,
    sql: &'static str,
    status: JobStatus,
    description: Option<String>,
) -> Result<bool> {
    let changed = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let changed = tx.execute(sql, params![&job_id])?;
            if changed > 0 {
                insert_event(&tx, &job_id, status, description.as_deref())?;
            }
            tx.commit()?;
            Ok::<usize, rusqlite::Error>(changed)
        })
        .await?;

    Ok(changed > 0)
}

fn insert_event(
    tx: &rusqlite::Transaction<'_>,
    job_id: &str,
    status: JobStatus,
    description: Option<&str>,
) -> rusqlite::Result<()> {
    let log_id = Uuid::now_v7().to_string();
    tx.execute(
        "INSERT INTO job_run_events (id, job_run_id, status, description)
         VALUES (?1, ?2, ?3, ?4)",
        params![log_id, job_id, status.as_str(), description],
    )?;
    Ok(())
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    JobStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown job status {raw:?}").into(),
        )
    })
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<JobRunRecord> {
    let result: Option<String> = row.get(4)?;
    let result = result
        .map(|raw| serde_json::from_str::<FinalizeSummary>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(JobRunRecord {
        id: row.get(0)?,
        status: parse_status(row, 1)?,
        total_devices: row.get::<_, i64>(2)? as usize,
        processed_devices: row.get::<_, i64>(3)? as usize,
        result,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn job(id: &str, devices: &[&str]) -> BackupJob {
        BackupJob {
            job_id: id.to_string(),
            device_ids: devices.iter().map(|d| d.to_string()).collect(),
            repository_id: 1,
            credential_id: 1,
            parallelism: 1,
            write_timestamp: false,
            timestamp_field_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let conn = db::init_in_memory().await.unwrap();
        let record = create(&conn, &job("job-1", &["a", "b"])).await.unwrap();

        assert_eq!(record.id, "job-1");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.total_devices, 2);
        assert_eq!(record.processed_devices, 0);
        assert!(record.result.is_none());

        assert!(get(&conn, "missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_is_only_reachable_from_pending() {
        let conn = db::init_in_memory().await.unwrap();
        create(&conn, &job("job-1", &["a"])).await.unwrap();

        assert!(mark_running(&conn, "job-1".into()).await.unwrap());
        assert!(!mark_running(&conn, "job-1".into()).await.unwrap());
        assert!(!mark_failed(&conn, "job-1".into(), "boom".into()).await.unwrap());

        let record = get(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_states_are_write_once() {
        let conn = db::init_in_memory().await.unwrap();
        create(&conn, &job("job-1", &[])).await.unwrap();

        assert!(mark_failed(&conn, "job-1".into(), "No devices".into()).await.unwrap());
        assert!(!mark_failed(&conn, "job-1".into(), "again".into()).await.unwrap());
        assert!(!mark_running(&conn, "job-1".into()).await.unwrap());

        let history = get_with_history(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(history.record.status, JobStatus::Failed);
        assert_eq!(history.record.error_message.as_deref(), Some("No devices"));
        let statuses: Vec<_> = history.history.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![JobStatus::Pending, JobStatus::Failed]);
    }

    #[tokio::test]
    async fn test_fail_running_only_moves_running_jobs() {
        let conn = db::init_in_memory().await.unwrap();
        create(&conn, &job("job-1", &["a"])).await.unwrap();

        assert!(!fail_running(&conn, "job-1".into(), "lost".into()).await.unwrap());
        mark_running(&conn, "job-1".into()).await.unwrap();
        assert!(fail_running(&conn, "job-1".into(), "lost".into()).await.unwrap());
        assert!(!fail_running(&conn, "job-1".into(), "again".into()).await.unwrap());

        let history = get_with_history(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(history.record.status, JobStatus::Failed);
        assert_eq!(history.record.error_message.as_deref(), Some("lost"));
        assert!(history.record.completed_at.is_some());
        let statuses: Vec<_> = history.history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let conn = db::init_in_memory().await.unwrap();
        create(&conn, &job("job-1", &["a"])).await.unwrap();
        create(&conn, &job("job-2", &["a"])).await.unwrap();
        mark_running(&conn, "job-2".into()).await.unwrap();

        let all = list(&conn, 50, 0, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let running = list(&conn, 50, 0, Some(JobStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "job-2");

        let page = list(&conn, 1, 1, None).await.unwrap();
        assert_eq!(page.len(), 1);
    }
}
