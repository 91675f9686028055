//! Postgres-backed `StoreGateway` — the production implementation.
//!
//! Plain `sqlx::query`/`query_as` the way the teacher's `db::Database` talks
//! to its tables; no query builder or ORM. Schema is created idempotently on
//! connect (`ensure_schema`) the same way `db/observability.rs` co-locates a
//! `CREATE TABLE IF NOT EXISTS` with the query code that needs it, since this
//! crate ships no separate migrations directory.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::{DispatcherError, Result};
use crate::model::{
    AckMap, CommandKind, GoalState, GoalStateMap, Heartbeat, OutgoingCommand, QueuedCommand, RunDoc,
    RunModeDoc, RunRate, RunTag,
};

use super::{AggregateSnapshot, ErrorType, LogPriority, StoreGateway};

pub struct PostgresStore {
    pool: PgPool,
    /// Separate connection for the `runs` table, mirroring the original's
    /// `MongoConnect` keeping control and runs as distinct connections
    /// (`RUNS_DATABASE_URL`/`RUNS_DATABASE_COLLECTION`). Everything else
    /// this crate tracks — goal state, heartbeats, commands, logs — lives
    /// on `pool`.
    runs_pool: PgPool,
    /// `write_log`'s rate-limit state, owned by the store per `spec.md`
    /// §4.1 ("write_log... with rate-limiting"). An in-memory map guarded by
    /// a blocking `Mutex` is enough: `write_log` never holds it across an
    /// `.await`.
    last_log_at: Mutex<HashMap<ErrorType, DateTime<Utc>>>,
}

impl PostgresStore {
    /// Connects `database_url` for everything and `runs_database_url` for
    /// the `runs` table specifically. Pass the same URL for both to run a
    /// single Postgres instance, as most deployments do.
    pub async fn connect(database_url: &str, runs_database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let runs_pool = if runs_database_url == database_url {
            pool.clone()
        } else {
            PgPoolOptions::new()
                .max_connections(5)
                .connect(runs_database_url)
                .await?
        };
        let store = PostgresStore {
            pool,
            runs_pool,
            last_log_at: Mutex::new(HashMap::new()),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS node_status (
                id BIGSERIAL PRIMARY KEY,
                host TEXT NOT NULL,
                status INT NOT NULL,
                rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                buffer_size BIGINT NOT NULL DEFAULT 0,
                pll INT NOT NULL DEFAULT 0,
                mode TEXT,
                number BIGINT,
                recorded_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS incoming_commands (
                id BIGSERIAL PRIMARY KEY,
                detector TEXT NOT NULL,
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                user_name TEXT NOT NULL,
                written_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outgoing_commands (
                id BIGSERIAL PRIMARY KEY,
                command TEXT NOT NULL,
                detector TEXT NOT NULL,
                mode TEXT NOT NULL,
                user_name TEXT NOT NULL,
                hosts TEXT[] NOT NULL,
                acknowledged JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL,
                options_override JSONB
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS command_queue (
                id BIGSERIAL PRIMARY KEY,
                command TEXT NOT NULL,
                detector TEXT NOT NULL,
                mode TEXT NOT NULL,
                user_name TEXT NOT NULL,
                hosts TEXT[] NOT NULL,
                options_override JSONB,
                due_at TIMESTAMPTZ NOT NULL,
                has_controller_host BOOLEAN NOT NULL DEFAULT false
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS run_mode_options (
                name TEXT PRIMARY KEY,
                includes TEXT[] NOT NULL DEFAULT '{}',
                doc JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                number BIGINT PRIMARY KEY,
                detectors TEXT[] NOT NULL,
                user_name TEXT NOT NULL,
                mode TEXT NOT NULL,
                daq_config JSONB NOT NULL,
                start TIMESTAMPTZ,
                \"end\" TIMESTAMPTZ,
                tags JSONB NOT NULL DEFAULT '[]',
                comments JSONB NOT NULL DEFAULT '[]',
                rate JSONB,
                bootstrax_state JSONB,
                data JSONB NOT NULL DEFAULT '[]'
            )",
        )
        .execute(&self.runs_pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS aggregate_status (
                id BIGSERIAL PRIMARY KEY,
                detector TEXT NOT NULL,
                status INT NOT NULL,
                number BIGINT,
                mode TEXT,
                rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                buffer_bytes BIGINT NOT NULL DEFAULT 0,
                pll_unlocks INT NOT NULL DEFAULT 0,
                recorded_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dispatcher_log (
                id BIGSERIAL PRIMARY KEY,
                user_name TEXT NOT NULL,
                message TEXT NOT NULL,
                priority INT NOT NULL,
                error_type TEXT NOT NULL,
                logged_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // `(detector, command)` -> most recently published outgoing command
        // id, used for ack lookups. Per Open Question (a) in `spec.md` §9,
        // this table is deliberately named correctly (`command_ack_lookup`),
        // not the source's misspelled `outoing_commands` collection.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS command_ack_lookup (
                detector TEXT NOT NULL,
                command TEXT NOT NULL,
                outgoing_id BIGINT NOT NULL,
                PRIMARY KEY (detector, command)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

}

#[async_trait]
impl StoreGateway for PostgresStore {
    async fn read_goal_state(&self) -> Result<GoalStateMap> {
        // Most recent document per (detector, key): a DISTINCT ON ordered by
        // written_at descending, mirroring the original's "latest write wins"
        // semantics (`spec.md` §6).
        let rows = sqlx::query(
            "SELECT DISTINCT ON (detector, field) detector, field, value, user_name, written_at
             FROM incoming_commands
             ORDER BY detector, field, written_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        struct Partial {
            active: Option<bool>,
            mode: Option<String>,
            user: Option<String>,
            comment: Option<String>,
            stop_after: Option<i64>,
            finish_run_on_stop: Option<bool>,
            written_at: Option<DateTime<Utc>>,
        }
        let mut partials: HashMap<String, Partial> = HashMap::new();

        for row in rows {
            let detector: String = row.try_get("detector")?;
            let field: String = row.try_get("field")?;
            let value: String = row.try_get("value")?;
            let written_at: DateTime<Utc> = row.try_get("written_at")?;
            let entry = partials.entry(detector).or_insert(Partial {
                active: None,
                mode: None,
                user: None,
                comment: None,
                stop_after: None,
                finish_run_on_stop: None,
                written_at: None,
            });
            match field.as_str() {
                "active" => entry.active = Some(value == "true"),
                "mode" => entry.mode = Some(value),
                "user" => entry.user = Some(value),
                "comment" => entry.comment = Some(value),
                "stop_after" => entry.stop_after = value.parse().ok(),
                "finish_run_on_stop" => entry.finish_run_on_stop = Some(value == "true"),
                _ => continue,
            }
            // The detector's `user` is that of the most recently written key
            // overall (`spec.md` §4.1), so track the newest `written_at` too.
            if entry.written_at.map(|t| written_at > t).unwrap_or(true) {
                entry.written_at = Some(written_at);
            }
        }

        let mut out = GoalStateMap::new();
        for (detector, p) in partials {
            let (Some(active), Some(mode), Some(user), Some(written_at)) =
                (p.active, p.mode, p.user, p.written_at)
            else {
                continue;
            };
            out.insert(
                detector,
                GoalState {
                    active,
                    mode,
                    user,
                    comment: p.comment,
                    stop_after: p.stop_after,
                    finish_run_on_stop: p.finish_run_on_stop.unwrap_or(false),
                    written_at,
                },
            );
        }
        Ok(out)
    }

    async fn read_heartbeats(
        &self,
        expected_hosts: &[String],
        _now: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (host) host, status, rate, buffer_size, pll, mode, number, recorded_at
             FROM node_status
             WHERE host = ANY($1)
             ORDER BY host, recorded_at DESC",
        )
        .bind(expected_hosts)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Heartbeat {
                    host: row.try_get("host")?,
                    status_raw: row.try_get("status")?,
                    rate: row.try_get("rate")?,
                    buffer_size: row.try_get("buffer_size")?,
                    pll: row.try_get("pll")?,
                    mode: row.try_get("mode")?,
                    number: row.try_get("number")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn read_run_mode(&self, name: &str) -> Result<RunModeDoc> {
        // Attempt-the-first-row emptiness check per Open Question (b): no
        // `cursor.count()` equivalent, just `fetch_optional`.
        let base_row = sqlx::query("SELECT doc, includes FROM run_mode_options WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatcherError::ModeNotFound(name.to_string()))?;
        let base_doc: serde_json::Value = base_row.try_get("doc")?;
        let includes: Vec<String> = base_row.try_get("includes")?;

        let mut resolved = Vec::with_capacity(includes.len());
        for inc in &includes {
            let row = sqlx::query("SELECT doc FROM run_mode_options WHERE name = $1")
                .bind(inc)
                .fetch_optional(&self.pool)
                .await?;
            resolved.push((inc.clone(), row.map(|r| r.try_get::<serde_json::Value, _>("doc")).transpose()?));
        }

        let merged = crate::run_mode::merge_run_mode_docs(name, base_doc, resolved)?;
        crate::run_mode::parse_run_mode_doc(name, merged)
    }

    async fn allocate_run_number(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(number) AS max_number FROM runs")
            .fetch_one(&self.runs_pool)
            .await?;
        let max_number: Option<i64> = row.try_get("max_number")?;
        Ok(Some(max_number.map_or(0, |m| m + 1)))
    }

    async fn publish_command(&self, cmd: &OutgoingCommand) -> Result<i64> {
        let ack_json = serde_json::to_value(&cmd.acknowledged).unwrap_or(serde_json::json!({}));
        let row = sqlx::query(
            "INSERT INTO outgoing_commands
             (command, detector, mode, user_name, hosts, acknowledged, created_at, options_override)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(cmd.command.to_string())
        .bind(&cmd.detector)
        .bind(&cmd.mode)
        .bind(&cmd.user)
        .bind(&cmd.hosts)
        .bind(ack_json)
        .bind(cmd.created_at)
        .bind(&cmd.options_override)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn write_ack_lookup(&self, detector: &str, command: CommandKind, id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO command_ack_lookup (detector, command, outgoing_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (detector, command) DO UPDATE SET outgoing_id = EXCLUDED.outgoing_id",
        )
        .bind(detector)
        .bind(command.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_ack(&self, detector: &str, command: CommandKind) -> Result<Option<AckMap>> {
        let row = sqlx::query(
            "SELECT oc.acknowledged FROM command_ack_lookup cal
             JOIN outgoing_commands oc ON oc.id = cal.outgoing_id
             WHERE cal.detector = $1 AND cal.command = $2",
        )
        .bind(detector)
        .bind(command.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(r) => {
                let v: serde_json::Value = r.try_get("acknowledged")?;
                Ok(serde_json::from_value(v).ok())
            }
        }
    }

    async fn read_tracked_commands(
        &self,
        detector: &str,
    ) -> Result<Vec<(CommandKind, DateTime<Utc>, AckMap)>> {
        let rows = sqlx::query(
            "SELECT cal.command, oc.created_at, oc.acknowledged FROM command_ack_lookup cal
             JOIN outgoing_commands oc ON oc.id = cal.outgoing_id
             WHERE cal.detector = $1",
        )
        .bind(detector)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::new();
        for row in rows {
            let command: String = row.try_get("command")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            let ack_json: serde_json::Value = row.try_get("acknowledged")?;
            let ack: AckMap = serde_json::from_value(ack_json).unwrap_or_default();
            out.push((parse_command_kind(&command), created_at, ack));
        }
        Ok(out)
    }

    async fn read_ack_time(
        &self,
        detector: &str,
        command: CommandKind,
        host: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read_ack(detector, command)
            .await?
            .and_then(|m| m.get(host).copied().flatten()))
    }

    async fn create_run_doc(&self, doc: &RunDoc) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs
             (number, detectors, user_name, mode, daq_config, start, \"end\", tags, comments, rate, bootstrax_state, data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, $11)",
        )
        .bind(doc.number)
        .bind(&doc.detectors)
        .bind(&doc.user)
        .bind(&doc.mode)
        .bind(serde_json::to_value(&doc.daq_config).unwrap())
        .bind(doc.start)
        .bind(doc.end)
        .bind(serde_json::to_value(&doc.tags).unwrap())
        .bind(serde_json::to_value(&doc.comments).unwrap())
        .bind(doc.rate.map(|r| serde_json::to_value(r).unwrap()))
        .bind(serde_json::to_value(&doc.data).unwrap())
        .execute(&self.runs_pool)
        .await?;
        Ok(())
    }

    async fn set_run_end(&self, number: i64, end_time: DateTime<Utc>, messy: bool) -> Result<()> {
        if messy {
            let tag = serde_json::to_value(RunTag {
                name: "messy".to_string(),
                user: "dispatcher".to_string(),
                date: end_time,
            })
            .unwrap();
            sqlx::query("UPDATE runs SET \"end\" = $1, tags = tags || $2::jsonb WHERE number = $3")
                .bind(end_time)
                .bind(serde_json::json!([tag]))
                .bind(number)
                .execute(&self.runs_pool)
                .await?;
        } else {
            sqlx::query("UPDATE runs SET \"end\" = $1 WHERE number = $2")
                .bind(end_time)
                .bind(number)
                .execute(&self.runs_pool)
                .await?;
        }
        Ok(())
    }

    async fn annotate_run_rate(&self, number: i64, rate: RunRate) -> Result<()> {
        sqlx::query("UPDATE runs SET rate = $1 WHERE number = $2")
            .bind(serde_json::to_value(rate).unwrap())
            .bind(number)
            .execute(&self.runs_pool)
            .await?;
        Ok(())
    }

    async fn set_run_start(&self, number: i64, start_time: DateTime<Utc>, messy: bool) -> Result<()> {
        if messy {
            let tag = serde_json::to_value(RunTag {
                name: "messy".to_string(),
                user: "dispatcher".to_string(),
                date: start_time,
            })
            .unwrap();
            sqlx::query("UPDATE runs SET start = $1, tags = tags || $2::jsonb WHERE number = $3")
                .bind(start_time)
                .bind(serde_json::json!([tag]))
                .bind(number)
                .execute(&self.runs_pool)
                .await?;
        } else {
            sqlx::query("UPDATE runs SET start = $1 WHERE number = $2")
                .bind(start_time)
                .bind(number)
                .execute(&self.runs_pool)
                .await?;
        }
        Ok(())
    }

    async fn get_run_start(&self, number: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT start FROM runs WHERE number = $1")
            .bind(number)
            .fetch_optional(&self.runs_pool)
            .await?;
        Ok(row.and_then(|r| r.try_get::<Option<DateTime<Utc>>, _>("start").ok().flatten()))
    }

    async fn write_aggregate_snapshot(&self, snap: &AggregateSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO aggregate_status
             (detector, status, number, mode, rate, buffer_bytes, pll_unlocks, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&snap.detector)
        .bind(Self::status_to_raw(snap.status))
        .bind(snap.run_number)
        .bind(&snap.mode)
        .bind(snap.rate)
        .bind(snap.buffer_bytes)
        .bind(snap.pll_unlocks)
        .bind(snap.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn aggregate_run_rate(&self, run_number: i64) -> Result<Option<RunRate>> {
        let row = sqlx::query(
            "SELECT AVG(rate) AS avg_rate, MAX(rate) AS max_rate FROM aggregate_status WHERE number = $1",
        )
        .bind(run_number)
        .fetch_one(&self.pool)
        .await?;
        let avg: Option<f64> = row.try_get("avg_rate")?;
        let max: Option<f64> = row.try_get("max_rate")?;
        Ok(match (avg, max) {
            (Some(avg), Some(max)) => Some(RunRate { avg, max }),
            _ => None,
        })
    }

    async fn write_log(&self, message: &str, priority: LogPriority, error_type: ErrorType) -> Result<()> {
        let now = Utc::now();
        {
            let mut last = self.last_log_at.lock().unwrap();
            if let Some(min_interval) = error_type.min_interval() {
                if let Some(&prev) = last.get(&error_type) {
                    if now - prev < min_interval {
                        return Ok(());
                    }
                }
            }
            last.insert(error_type, now);
        }
        sqlx::query(
            "INSERT INTO dispatcher_log (user_name, message, priority, error_type, logged_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind("dispatcher")
        .bind(message)
        .bind(priority as i32)
        .bind(error_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_durable(&self, cmd: &QueuedCommand) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO command_queue (command, detector, mode, user_name, hosts, options_override, due_at, has_controller_host)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(cmd.command.to_string())
        .bind(&cmd.detector)
        .bind(&cmd.mode)
        .bind(&cmd.user)
        .bind(&cmd.hosts)
        .bind(&cmd.options_override)
        .bind(cmd.due_at)
        .bind(cmd.has_controller_host)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn dequeue_durable(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM command_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_durable_queue(&self) -> Result<Vec<(i64, QueuedCommand)>> {
        let rows = sqlx::query(
            "SELECT id, command, detector, mode, user_name, hosts, options_override, due_at, has_controller_host
             FROM command_queue ORDER BY due_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let command_str: String = row.try_get("command")?;
                let command = parse_command_kind(&command_str);
                Ok((
                    row.try_get::<i64, _>("id")?,
                    QueuedCommand {
                        command,
                        detector: row.try_get("detector")?,
                        mode: row.try_get("mode")?,
                        user: row.try_get("user_name")?,
                        hosts: row.try_get("hosts")?,
                        options_override: row.try_get("options_override")?,
                        due_at: row.try_get("due_at")?,
                        has_controller_host: row.try_get("has_controller_host")?,
                    },
                ))
            })
            .collect()
    }
}

fn parse_command_kind(s: &str) -> CommandKind {
    match s {
        "arm" => CommandKind::Arm,
        "start" => CommandKind::Start,
        _ => CommandKind::Stop,
    }
}

impl PostgresStore {
    fn status_to_raw(status: crate::model::Status) -> i32 {
        match status {
            crate::model::Status::Idle => 0,
            crate::model::Status::Arming => 1,
            crate::model::Status::Armed => 2,
            crate::model::Status::Running => 3,
            crate::model::Status::Error => 4,
            crate::model::Status::Timeout => 5,
            crate::model::Status::Unknown => 6,
        }
    }
}
