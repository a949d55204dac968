// src/store.rs
//
// =============================================================================
// GPUFLOW: STATE STORE
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite using the "Hybrid Relational" pattern.
// - High-traffic fields (status, priority, timestamps) are columns.
// - The complete entity is a JSON blob alongside them.
// - Job status writes are guarded by an optimistic `version` check so two
//   loops can never transition the same job twice.
// - Terminal job rows are immutable: a guarded write against a terminal
//   row reports a conflict instead of mutating.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::{
    HealthState, Instance, Job, JobStatus, JobSummary, JobTemplate, ProviderKind,
    ProviderSettings, QueueMetrics, ResourceQuota,
};
use crate::error::{OrchestratorError, Result};

// -----------------------------------------------------------------------------
// Timestamp helpers (epoch milliseconds in columns)
// -----------------------------------------------------------------------------

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(ms)
}

fn from_ms(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v).single().unwrap_or_else(Utc::now)
}

// -----------------------------------------------------------------------------
// View models
// -----------------------------------------------------------------------------

/// One audited configuration change.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub changed_at: DateTime<Utc>,
    pub old_value: Option<String>,
    pub new_value: String,
}

// -----------------------------------------------------------------------------
// JobStore
// -----------------------------------------------------------------------------

pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the schema if it doesn't exist.
    /// Busy timeout handles contention between the scheduler, runners and
    /// status readers; DELETE journaling keeps the file self-contained.
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                user_id         TEXT NOT NULL,
                status          TEXT NOT NULL,
                priority        INTEGER NOT NULL,
                created_at_ms   INTEGER NOT NULL,
                updated_at_ms   INTEGER NOT NULL,
                started_at_ms   INTEGER,
                completed_at_ms INTEGER,
                backoff_until_ms INTEGER,
                instance_id     TEXT,
                actual_cost_usd REAL,
                version         INTEGER NOT NULL DEFAULT 0,
                full_json       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_queue
                ON jobs(status, priority, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_jobs_user_status
                ON jobs(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_jobs_instance
                ON jobs(instance_id);

            CREATE TABLE IF NOT EXISTS instances (
                id                   TEXT PRIMARY KEY,
                provider             TEXT NOT NULL,
                provider_instance_id TEXT NOT NULL,
                status               TEXT NOT NULL,
                created_at_ms        INTEGER NOT NULL,
                stopped_at_ms        INTEGER,
                full_json            TEXT NOT NULL,
                UNIQUE(provider, provider_instance_id)
            );
            CREATE INDEX IF NOT EXISTS idx_instances_provider_status
                ON instances(provider, status);
            CREATE INDEX IF NOT EXISTS idx_instances_created
                ON instances(created_at_ms);

            CREATE TABLE IF NOT EXISTS templates (
                id        TEXT PRIMARY KEY,
                name      TEXT NOT NULL UNIQUE,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quotas (
                user_id   TEXT PRIMARY KEY,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS provider_settings (
                provider  TEXT PRIMARY KEY,
                enabled   INTEGER NOT NULL,
                priority  INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config_history (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                config_key    TEXT NOT NULL,
                changed_at_ms INTEGER NOT NULL,
                old_value     TEXT,
                new_value     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_config_history_key
                ON config_history(config_key, changed_at_ms);
            COMMIT;",
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| OrchestratorError::Database(format!("open {:?}: {e}", self.path)))?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Ok(conn)
    }

    // -------------------------------------------------------------------------
    // JOBS: writes
    // -------------------------------------------------------------------------

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(job)?;
        conn.execute(
            "INSERT INTO jobs (id, user_id, status, priority, created_at_ms, updated_at_ms,
                               started_at_ms, completed_at_ms, backoff_until_ms, instance_id,
                               actual_cost_usd, version, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id.to_string(),
                job.user_id.to_string(),
                job.status.as_str(),
                job.priority as i64,
                ms(job.created_at),
                ms(job.updated_at),
                opt_ms(job.started_at),
                opt_ms(job.completed_at),
                opt_ms(job.backoff_until),
                job.instance_id.map(|i| i.to_string()),
                job.actual_cost_usd,
                job.version,
                json,
            ],
        )?;
        Ok(())
    }

    /// Guarded write: succeeds only if the stored version matches and the
    /// stored status is not terminal. Returns false on conflict; the caller
    /// reloads and decides. Bumps `job.version` on success.
    pub fn update_job_guarded(&self, job: &mut Job) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT status, version FROM jobs WHERE id = ?1",
                params![job.id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let (cur_status, cur_version) = match row {
            Some(v) => v,
            None => return Ok(false),
        };
        if cur_version != job.version || JobStatus::parse(&cur_status)?.is_terminal() {
            return Ok(false);
        }

        job.version += 1;
        job.updated_at = Utc::now();
        let json = serde_json::to_string(job)?;

        tx.execute(
            "UPDATE jobs SET user_id=?2, status=?3, priority=?4, updated_at_ms=?5,
                             started_at_ms=?6, completed_at_ms=?7, backoff_until_ms=?8,
                             instance_id=?9, actual_cost_usd=?10, version=?11, full_json=?12
             WHERE id=?1",
            params![
                job.id.to_string(),
                job.user_id.to_string(),
                job.status.as_str(),
                job.priority as i64,
                ms(job.updated_at),
                opt_ms(job.started_at),
                opt_ms(job.completed_at),
                opt_ms(job.backoff_until),
                job.instance_id.map(|i| i.to_string()),
                job.actual_cost_usd,
                job.version,
                json,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // JOBS: reads
    // -------------------------------------------------------------------------

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn list_jobs(
        &self,
        user_id: Uuid,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let mut push = |json: String| {
            // Skip records a newer schema cannot read instead of failing
            // the whole listing.
            match serde_json::from_str::<Job>(&json) {
                Ok(job) => out.push(job),
                Err(e) => log::warn!("skipping unreadable job record: {e}"),
            }
        };
        match status {
            Some(st) => {
                let mut stmt = conn.prepare(
                    "SELECT full_json FROM jobs WHERE user_id=?1 AND status=?2
                     ORDER BY created_at_ms DESC LIMIT ?3 OFFSET ?4",
                )?;
                let rows = stmt.query_map(
                    params![user_id.to_string(), st.as_str(), limit, offset],
                    |r| r.get::<_, String>(0),
                )?;
                for r in rows {
                    push(r?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT full_json FROM jobs WHERE user_id=?1
                     ORDER BY created_at_ms DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows =
                    stmt.query_map(params![user_id.to_string(), limit, offset], |r| {
                        r.get::<_, String>(0)
                    })?;
                for r in rows {
                    push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Dispatch candidates: QUEUED jobs whose backoff has elapsed, in
    /// stored-priority order. Aging on top of this is the scheduler's job.
    pub fn load_queued(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs
             WHERE status = 'queued'
               AND (backoff_until_ms IS NULL OR backoff_until_ms <= ?1)
             ORDER BY priority ASC, created_at_ms ASC",
        )?;
        let rows = stmt.query_map(params![ms(now)], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(job) = serde_json::from_str::<Job>(&r?) {
                out.push(job);
            }
        }
        Ok(out)
    }

    /// QUEUED jobs created before the cutoff (cleanup sweep).
    pub fn load_queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs WHERE status='queued' AND created_at_ms < ?1",
        )?;
        let rows = stmt.query_map(params![ms(cutoff)], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(job) = serde_json::from_str::<Job>(&r?) {
                out.push(job);
            }
        }
        Ok(out)
    }

    /// Jobs currently holding an instance (ASSIGNED or RUNNING).
    pub fn load_in_flight(&self) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs WHERE status IN ('assigned', 'running')",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(job) = serde_json::from_str::<Job>(&r?) {
                out.push(job);
            }
        }
        Ok(out)
    }

    pub fn count_queued(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status='queued'",
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn count_active_global(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('assigned','running')",
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn count_user_active(&self, user_id: Uuid) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE user_id=?1 AND status IN ('queued','assigned','running')",
            params![user_id.to_string()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Live instances on one provider, regardless of owner.
    pub fn count_live_instances_on(&self, provider: ProviderKind) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instances
             WHERE provider=?1 AND status NOT IN ('stopped','terminated','failed')",
            params![provider.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Live instances a user holds on one provider (through job ownership).
    pub fn count_user_instances_on(&self, user_id: Uuid, provider: ProviderKind) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs j
             JOIN instances i ON j.instance_id = i.id
             WHERE j.user_id=?1 AND i.provider=?2
               AND i.status NOT IN ('stopped','terminated','failed')",
            params![user_id.to_string(), provider.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Today's consumption: GPU-hours over COMPLETED jobs, dollars over all
    /// terminal jobs with a settled cost.
    pub fn daily_usage(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<(f64, f64)> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs
             WHERE user_id=?1 AND completed_at_ms >= ?2",
        )?;
        let rows = stmt.query_map(params![user_id.to_string(), ms(since)], |r| {
            r.get::<_, String>(0)
        })?;

        let mut gpu_hours = 0.0;
        let mut cost = 0.0;
        for r in rows {
            let Ok(job) = serde_json::from_str::<Job>(&r?) else {
                continue;
            };
            if job.status == JobStatus::Completed {
                gpu_hours += job.runtime_hours() * job.gpu_count as f64;
            }
            if let Some(c) = job.actual_cost_usd {
                cost += c;
            }
        }
        Ok((gpu_hours, cost))
    }

    pub fn status_counts(&self) -> Result<HashMap<JobStatus, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut out = HashMap::new();
        for r in rows {
            let (s, n) = r?;
            out.insert(JobStatus::parse(&s)?, n as u64);
        }
        Ok(out)
    }

    pub fn queue_metrics(&self) -> Result<QueueMetrics> {
        let conn = self.conn()?;
        let avg_wait: Option<f64> = conn.query_row(
            "SELECT AVG((started_at_ms - created_at_ms) / 60000.0)
             FROM jobs WHERE status='completed' AND started_at_ms IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let avg_exec: Option<f64> = conn.query_row(
            "SELECT AVG((completed_at_ms - started_at_ms) / 60000.0)
             FROM jobs WHERE status='completed'
               AND started_at_ms IS NOT NULL AND completed_at_ms IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let total_cost: Option<f64> = conn.query_row(
            "SELECT SUM(actual_cost_usd) FROM jobs WHERE actual_cost_usd IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(QueueMetrics {
            average_wait_minutes: avg_wait.unwrap_or(0.0),
            average_execution_minutes: avg_exec.unwrap_or(0.0),
            total_cost_usd: total_cost.unwrap_or(0.0),
        })
    }

    pub fn running_summaries(&self) -> Result<Vec<JobSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs WHERE status='running'
             ORDER BY started_at_ms DESC",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(job) = serde_json::from_str::<Job>(&r?) {
                out.push(JobSummary::from(&job));
            }
        }
        Ok(out)
    }

    pub fn queued_preview(&self, limit: u32) -> Result<Vec<JobSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs WHERE status='queued'
             ORDER BY priority ASC, created_at_ms ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(job) = serde_json::from_str::<Job>(&r?) {
                out.push(JobSummary::from(&job));
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // INSTANCES
    // -------------------------------------------------------------------------

    pub fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(instance)?;
        conn.execute(
            "INSERT INTO instances (id, provider, provider_instance_id, status,
                                    created_at_ms, stopped_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                instance.id.to_string(),
                instance.provider.as_str(),
                instance.provider_instance_id,
                instance.status.as_str(),
                ms(instance.created_at),
                opt_ms(instance.stopped_at),
                json,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                OrchestratorError::Database(format!(
                    "duplicate instance ({}, {})",
                    instance.provider, instance.provider_instance_id
                ))
            }
            other => OrchestratorError::from(other),
        })?;
        Ok(())
    }

    pub fn update_instance(&self, instance: &Instance) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(instance)?;
        conn.execute(
            "UPDATE instances SET status=?2, stopped_at_ms=?3, full_json=?4 WHERE id=?1",
            params![
                instance.id.to_string(),
                instance.status.as_str(),
                opt_ms(instance.stopped_at),
                json,
            ],
        )?;
        Ok(())
    }

    pub fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM instances WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn list_instances(&self, limit: u32) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM instances ORDER BY created_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(i) = serde_json::from_str::<Instance>(&r?) {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Live instances whose owning job is gone or already terminal.
    pub fn find_orphan_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM instances i
             WHERE i.status NOT IN ('stopped','terminated','failed')
               AND NOT EXISTS (
                   SELECT 1 FROM jobs j
                   WHERE j.instance_id = i.id
                     AND j.status IN ('assigned','running')
               )",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(i) = serde_json::from_str::<Instance>(&r?) {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Drop terminal instance rows stopped before the cutoff. Jobs are never
    /// deleted; their `instance_id` simply stops resolving.
    pub fn delete_instances_stopped_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM instances
             WHERE status IN ('stopped','terminated','failed')
               AND stopped_at_ms IS NOT NULL AND stopped_at_ms < ?1",
            params![ms(cutoff)],
        )?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // TEMPLATES
    // -------------------------------------------------------------------------

    pub fn insert_template(&self, template: &JobTemplate) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(template)?;
        conn.execute(
            "INSERT INTO templates (id, name, full_json) VALUES (?1, ?2, ?3)",
            params![template.id.to_string(), template.name, json],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                OrchestratorError::Validation(format!(
                    "template '{}' already exists",
                    template.name
                ))
            }
            other => OrchestratorError::from(other),
        })?;
        Ok(())
    }

    pub fn get_template(&self, name: &str) -> Result<Option<JobTemplate>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM templates WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn list_templates(&self) -> Result<Vec<JobTemplate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT full_json FROM templates ORDER BY name")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(t) = serde_json::from_str::<JobTemplate>(&r?) {
                out.push(t);
            }
        }
        Ok(out)
    }

    pub fn record_template_use(&self, name: &str, when: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let json: Option<String> = tx
            .query_row(
                "SELECT full_json FROM templates WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(j) = json {
            let mut t: JobTemplate = serde_json::from_str(&j)?;
            t.usage_count += 1;
            t.last_used_at = Some(when);
            tx.execute(
                "UPDATE templates SET full_json=?2 WHERE name=?1",
                params![name, serde_json::to_string(&t)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // QUOTAS
    // -------------------------------------------------------------------------

    pub fn get_quota(&self, user_id: Uuid) -> Result<Option<ResourceQuota>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM quotas WHERE user_id = ?1",
                params![user_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_quota(&self, quota: &ResourceQuota) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO quotas (user_id, full_json) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET full_json=excluded.full_json",
            params![quota.user_id.to_string(), serde_json::to_string(quota)?],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PROVIDER SETTINGS (+ audit history)
    // -------------------------------------------------------------------------

    /// Upsert, recording the change in config_history when the row differs.
    pub fn upsert_provider_settings(&self, settings: &ProviderSettings) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let key = settings.provider.as_str();
        let old: Option<String> = tx
            .query_row(
                "SELECT full_json FROM provider_settings WHERE provider = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;

        let new_json = serde_json::to_string(settings)?;
        if old.as_deref() != Some(new_json.as_str()) {
            tx.execute(
                "INSERT INTO config_history (config_key, changed_at_ms, old_value, new_value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    format!("provider/{key}"),
                    ms(Utc::now()),
                    old,
                    new_json,
                ],
            )?;
        }

        tx.execute(
            "INSERT INTO provider_settings (provider, enabled, priority, full_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider) DO UPDATE SET
                enabled=excluded.enabled,
                priority=excluded.priority,
                full_json=excluded.full_json",
            params![key, settings.enabled, settings.priority as i64, new_json],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_provider_settings(&self, provider: ProviderKind) -> Result<Option<ProviderSettings>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM provider_settings WHERE provider = ?1",
                params![provider.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn list_provider_settings(&self) -> Result<Vec<ProviderSettings>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT full_json FROM provider_settings ORDER BY priority ASC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(s) = serde_json::from_str::<ProviderSettings>(&r?) {
                out.push(s);
            }
        }
        Ok(out)
    }

    /// Stamp the latest health probe onto the settings row. Health flaps are
    /// operational noise, not configuration changes, so no history entry.
    pub fn record_health(
        &self,
        provider: ProviderKind,
        state: HealthState,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let json: Option<String> = tx
            .query_row(
                "SELECT full_json FROM provider_settings WHERE provider = ?1",
                params![provider.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(j) = json {
            let mut s: ProviderSettings = serde_json::from_str(&j)?;
            s.health_status = state;
            s.last_health_check = Some(when);
            tx.execute(
                "UPDATE provider_settings SET full_json=?2 WHERE provider=?1",
                params![provider.as_str(), serde_json::to_string(&s)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Audit trail for one configuration key, newest first.
    pub fn config_history(&self, key: &str, limit: u32) -> Result<Vec<ConfigChange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT changed_at_ms, old_value, new_value FROM config_history
             WHERE config_key = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![key, limit], |r| {
            Ok(ConfigChange {
                changed_at: from_ms(r.get(0)?),
                old_value: r.get(1)?,
                new_value: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Keep only the newest `keep` history rows per key.
    pub fn compact_config_history(&self, keep: u32) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM config_history WHERE id NOT IN (
                 SELECT id FROM config_history ch
                 WHERE (
                     SELECT COUNT(*) FROM config_history newer
                     WHERE newer.config_key = ch.config_key AND newer.id >= ch.id
                 ) <= ?1
             )",
            params![keep],
        )?;
        Ok(n)
    }

}
