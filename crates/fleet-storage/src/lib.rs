use chrono::{DateTime, SecondsFormat, Utc};
use fleet_core::event::{EventCategory, EventRecord};
use fleet_core::job::{Destination, Job, JobStatus, ScheduleType, ScheduledJob};
use fleet_core::store::{EventSink, JobRepository, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const FLEET_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("connection lock poisoned")]
    Poisoned,
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// SQLite-backed job repository and event sink. The connection is guarded by a
/// mutex so the store can be shared across tasks.
pub struct FleetStore {
    conn: Mutex<Connection>,
}

impl FleetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > FLEET_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: FLEET_SCHEMA_VERSION,
            });
        }

        let conn = self.conn()?;
        if current < 1 {
            conn.execute_batch(include_str!("../migrations/0001_fleet_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            conn.execute_batch(include_str!("../migrations/0002_event_history.sql"))?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn save_job(&self, job: &Job) -> Result<(), StorageError> {
        let ignore_patterns_json = serde_json::to_string(&job.ignore_patterns)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "
            INSERT INTO jobs (
                id,
                name,
                source_agent,
                source_path,
                sync_type,
                schedule_type,
                status,
                is_multi_destination,
                rescan_interval_s,
                ignore_patterns_json,
                created_at,
                last_run,
                next_run
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                source_agent=excluded.source_agent,
                source_path=excluded.source_path,
                sync_type=excluded.sync_type,
                schedule_type=excluded.schedule_type,
                status=excluded.status,
                is_multi_destination=excluded.is_multi_destination,
                rescan_interval_s=excluded.rescan_interval_s,
                ignore_patterns_json=excluded.ignore_patterns_json,
                last_run=excluded.last_run,
                next_run=excluded.next_run
            ",
            params![
                job.id,
                job.name,
                job.source_agent,
                job.source_path,
                job.sync_type,
                job.schedule_type.as_str(),
                job.status.as_str(),
                job.is_multi_destination,
                job.rescan_interval_s as i64,
                ignore_patterns_json,
                format_timestamp(&job.created_at),
                job.last_run.as_ref().map(format_timestamp),
                job.next_run.as_ref().map(format_timestamp),
            ],
        )?;
        write_destinations(&tx, &job.id, &job.destinations)?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_job(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [job_id],
                job_from_row,
            )
            .optional()?;
        match job {
            Some(mut job) => {
                job.destinations = load_destinations(&conn, &job.id)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    pub fn load_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let conn = self.conn()?;
        let mut statement =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC"))?;
        let mut jobs = statement
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for job in &mut jobs {
            job.destinations = load_destinations(&conn, &job.id)?;
        }
        Ok(jobs)
    }

    pub fn set_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "UPDATE jobs SET status = ?2 WHERE id = ?1",
            params![job_id, status.as_str()],
        )?;
        Ok(changes > 0)
    }

    pub fn set_destinations(
        &self,
        job_id: &str,
        destinations: &[Destination],
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changes = tx.execute(
            "UPDATE jobs SET is_multi_destination = ?2 WHERE id = ?1",
            params![job_id, destinations.len() > 1],
        )?;
        if changes == 0 {
            return Ok(false);
        }
        write_destinations(&tx, job_id, destinations)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn remove_job(&self, job_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM job_destinations WHERE job_id = ?1", [job_id])?;
        let changes = tx.execute("DELETE FROM jobs WHERE id = ?1", [job_id])?;
        tx.commit()?;
        Ok(changes > 0)
    }

    fn scheduled_where(&self, clause: &str, now: Option<&str>) -> Result<Vec<ScheduledJob>, StorageError> {
        let conn = self.conn()?;
        let sql = format!(
            "
            SELECT id, source_agent, schedule_type, last_run, next_run
            FROM jobs
            WHERE status = 'active' AND schedule_type != 'continuous' AND {clause}
            ORDER BY next_run ASC, id ASC
            "
        );
        let mut statement = conn.prepare(&sql)?;
        let map_row = |row: &Row<'_>| -> rusqlite::Result<ScheduledJob> {
            Ok(ScheduledJob {
                job_id: row.get(0)?,
                source_agent: row.get(1)?,
                schedule_type: ScheduleType::from(row.get::<_, String>(2)?.as_str()),
                last_run: optional_timestamp(row, 3)?,
                next_run: optional_timestamp(row, 4)?,
            })
        };
        let rows = match now {
            Some(now) => statement
                .query_map([now], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => statement
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StorageError> {
        let now = format_timestamp(&now);
        self.scheduled_where("next_run IS NOT NULL AND next_run <= ?1", Some(&now))
    }

    pub fn scheduled_missing_next_run(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        self.scheduled_where("next_run IS NULL", None)
    }

    pub fn update_schedule(
        &self,
        job_id: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changes = match last_run {
            Some(last_run) => conn.execute(
                "UPDATE jobs SET last_run = ?2, next_run = ?3 WHERE id = ?1",
                params![
                    job_id,
                    format_timestamp(&last_run),
                    next_run.as_ref().map(format_timestamp)
                ],
            )?,
            None => conn.execute(
                "UPDATE jobs SET next_run = ?2 WHERE id = ?1",
                params![job_id, next_run.as_ref().map(format_timestamp)],
            )?,
        };
        Ok(changes > 0)
    }

    pub fn insert_event_record(&self, record: &EventRecord) -> Result<(), StorageError> {
        let data_json = serde_json::to_string(&record.data)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO agent_events (
                event_id,
                agent_id,
                event_type,
                category,
                folder_id,
                ts,
                data_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                record.event_id as i64,
                record.agent_id,
                record.event_type,
                record.category.as_str(),
                record.folder_id,
                format_timestamp(&record.timestamp),
                data_json,
            ],
        )?;
        Ok(())
    }

    pub fn event_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "
            SELECT event_id, agent_id, event_type, category, folder_id, ts, data_json
            FROM agent_events
            WHERE agent_id = ?1
            ORDER BY row_id DESC
            LIMIT ?2
            ",
        )?;
        let mut records = statement
            .query_map(params![agent_id, limit as i64], |row| {
                let category = match row.get::<_, String>(3)?.as_str() {
                    "state_change" => EventCategory::StateChange,
                    "transfer_progress" => EventCategory::TransferProgress,
                    _ => EventCategory::Generic,
                };
                let data_json: String = row.get(6)?;
                let data = serde_json::from_str(&data_json).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                Ok(EventRecord {
                    event_id: row.get::<_, i64>(0)? as u64,
                    agent_id: row.get(1)?,
                    event_type: row.get(2)?,
                    category,
                    folder_id: row.get(4)?,
                    timestamp: required_timestamp(row, 5)?,
                    data,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }
}

impl JobRepository for FleetStore {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        Ok(self.save_job(job)?)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.load_job(job_id)?)
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.load_jobs()?)
    }

    fn update_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        if !self.set_status(job_id, status)? {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn replace_destinations(
        &self,
        job_id: &str,
        destinations: &[Destination],
    ) -> Result<(), StoreError> {
        if !self.set_destinations(job_id, destinations)? {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.remove_job(job_id)?)
    }

    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        Ok(self.scheduled_due(now)?)
    }

    fn unscheduled_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        Ok(self.scheduled_missing_next_run()?)
    }

    fn set_next_run(&self, job_id: &str, next_run: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.update_schedule(job_id, None, Some(next_run))? {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn record_run(
        &self,
        job_id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if !self.update_schedule(job_id, Some(last_run), next_run)? {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }
}

impl EventSink for FleetStore {
    fn record_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        Ok(self.insert_event_record(record)?)
    }

    fn event_history(&self, agent_id: &str, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        Ok(FleetStore::event_history(self, agent_id, limit)?)
    }
}

const JOB_COLUMNS: &str = "id, name, source_agent, source_path, sync_type, schedule_type, status, \
     is_multi_destination, rescan_interval_s, ignore_patterns_json, created_at, last_run, next_run";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status = row
        .get::<_, String>(6)?
        .parse::<JobStatus>()
        .map_err(|err| conversion_error(6, err))?;
    let ignore_patterns_json: String = row.get(9)?;
    let ignore_patterns: Vec<String> =
        serde_json::from_str(&ignore_patterns_json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
        })?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        source_agent: row.get(2)?,
        source_path: row.get(3)?,
        sync_type: row.get(4)?,
        schedule_type: ScheduleType::from(row.get::<_, String>(5)?.as_str()),
        status,
        destinations: Vec::new(),
        is_multi_destination: row.get(7)?,
        rescan_interval_s: row.get::<_, i64>(8)? as u64,
        ignore_patterns,
        created_at: required_timestamp(row, 10)?,
        last_run: optional_timestamp(row, 11)?,
        next_run: optional_timestamp(row, 12)?,
    })
}

fn load_destinations(conn: &Connection, job_id: &str) -> Result<Vec<Destination>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT agent_id, path, status, last_sync_at, files_synced, bytes_synced
        FROM job_destinations
        WHERE job_id = ?1
        ORDER BY position ASC
        ",
    )?;
    let rows = statement
        .query_map([job_id], |row| {
            Ok(Destination {
                agent_id: row.get(0)?,
                path: row.get(1)?,
                status: row.get(2)?,
                last_sync_at: optional_timestamp(row, 3)?,
                files_synced: row.get::<_, i64>(4)? as u64,
                bytes_synced: row.get::<_, i64>(5)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write_destinations(
    conn: &Connection,
    job_id: &str,
    destinations: &[Destination],
) -> Result<(), StorageError> {
    conn.execute("DELETE FROM job_destinations WHERE job_id = ?1", [job_id])?;
    for (position, dest) in destinations.iter().enumerate() {
        conn.execute(
            "
            INSERT INTO job_destinations (
                job_id,
                position,
                agent_id,
                path,
                status,
                last_sync_at,
                files_synced,
                bytes_synced
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                job_id,
                position as i64,
                dest.agent_id,
                dest.path,
                dest.status,
                dest.last_sync_at.as_ref().map(format_timestamp),
                dest.files_synced as i64,
                dest.bytes_synced as i64,
            ],
        )?;
    }
    Ok(())
}

/// Fixed-width UTC timestamps so lexical comparison in SQL matches time order.
fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn conversion_error(index: usize, err: impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(StorageError::Serialization(err.to_string())),
    )
}

fn required_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(index)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn optional_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(index)?
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}
