use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS};
use crate::model::{Command, Device, Reading};
use crate::store::{Store, Touch, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 5;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct CommandRow {
    id: Uuid,
    device_id: String,
    payload: String,
    state: String,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    acknowledged_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    result: Option<String>,
}

impl TryFrom<CommandRow> for Command {
    type Error = Error;

    fn try_from(row: CommandRow) -> Result<Self> {
        Ok(Command {
            id: row.id,
            device_id: row.device_id,
            payload: row.payload,
            state: row.state.parse()?,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            acknowledged_at: row.acknowledged_at,
            expired_at: row.expired_at,
            expires_at: row.expires_at,
            result: row.result,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TouchRow {
    previous_seen: Option<DateTime<Utc>>,
    current_seen: DateTime<Utc>,
}

const COMMAND_COLUMNS: &str = "id, device_id, payload, state, created_at, delivered_at, \
     acknowledged_at, expired_at, expires_at, result";

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_readings_inner(&self, batch: &[Reading]) -> Result<()> {
        let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
        let sensor_types: Vec<&str> = batch.iter().map(|r| r.sensor_type.as_str()).collect();
        let values: Vec<f64> = batch.iter().map(|r| r.value).collect();
        let units: Vec<&str> = batch.iter().map(|r| r.unit.as_str()).collect();
        let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|r| r.timestamp).collect();

        // a single statement, so the batch lands entirely or not at all
        let query = r#"
            INSERT INTO readings (device_id, sensor_type, value, unit, ts)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::float8[], $4::text[], $5::timestamptz[])
            "#;

        sqlx::query(query)
            .bind(&device_ids)
            .bind(&sensor_types)
            .bind(&values)
            .bind(&units)
            .bind(&timestamps)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_transitions_inner(&self, transitions: &[Transition]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for Transition { from, command } in transitions {
            // compare-and-swap on the state this process read
            let updated = sqlx::query(
                r#"
                UPDATE commands
                SET state = $2, delivered_at = $3, acknowledged_at = $4, expired_at = $5, result = $6
                WHERE id = $1 AND state = $7
                "#,
            )
            .bind(command.id)
            .bind(command.state.as_str())
            .bind(command.delivered_at)
            .bind(command.acknowledged_at)
            .bind(command.expired_at)
            .bind(&command.result)
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() != 1 {
                tx.rollback().await?;
                return Err(Error::InvalidState(format!(
                    "command {} is no longer {}",
                    command.id, from
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_device(&self, device: &Device) -> Result<()> {
        with_retry("insert_device", || async move {
            sqlx::query(
                r#"
                INSERT INTO devices (device_id, organization_id, api_key, last_seen_at, deleted_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&device.device_id)
            .bind(&device.organization_id)
            .bind(&device.api_key)
            .bind(device.last_seen_at)
            .bind(device.deleted_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        with_retry("get_device", || async move {
            let device = sqlx::query_as::<_, Device>(
                "SELECT device_id, organization_id, api_key, last_seen_at, deleted_at \
                 FROM devices WHERE device_id = $1",
            )
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok::<_, Error>(device)
        })
        .await
    }

    async fn find_device_by_key(&self, api_key: &str) -> Result<Option<Device>> {
        with_retry("find_device_by_key", || async move {
            let device = sqlx::query_as::<_, Device>(
                "SELECT device_id, organization_id, api_key, last_seen_at, deleted_at \
                 FROM devices WHERE api_key = $1",
            )
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok::<_, Error>(device)
        })
        .await
    }

    async fn touch_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<Option<Touch>> {
        with_retry("touch_device", || async move {
            // GREATEST ignores NULL, which covers the never-seen case
            let row = sqlx::query_as::<_, TouchRow>(
                r#"
                WITH prev AS (
                    SELECT device_id, last_seen_at FROM devices WHERE device_id = $1 FOR UPDATE
                )
                UPDATE devices d
                SET last_seen_at = GREATEST(prev.last_seen_at, $2)
                FROM prev
                WHERE d.device_id = prev.device_id
                RETURNING prev.last_seen_at AS previous_seen, d.last_seen_at AS current_seen
                "#,
            )
            .bind(device_id)
            .bind(seen_at)
            .fetch_optional(&self.pool)
            .await?;
            Ok::<_, Error>(row.map(|r| Touch {
                previous: r.previous_seen,
                current: r.current_seen,
            }))
        })
        .await
    }

    async fn insert_command(&self, command: &Command) -> Result<()> {
        with_retry("insert_command", || async move {
            sqlx::query(
                r#"
                INSERT INTO commands (id, device_id, payload, state, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(command.id)
            .bind(&command.device_id)
            .bind(&command.payload)
            .bind(command.state.as_str())
            .bind(command.created_at)
            .bind(command.expires_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>> {
        let query = format!("SELECT {} FROM commands WHERE id = $1", COMMAND_COLUMNS);
        let query = query.as_str();
        let row = with_retry("get_command", || async move {
            let row = sqlx::query_as::<_, CommandRow>(query)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok::<_, Error>(row)
        })
        .await?;
        row.map(Command::try_from).transpose()
    }

    async fn open_commands(&self, device_id: &str) -> Result<Vec<Command>> {
        // seq breaks ties between commands created in the same instant
        let query = format!(
            "SELECT {} FROM commands \
             WHERE device_id = $1 AND state IN ('pending', 'delivered') \
             ORDER BY seq ASC",
            COMMAND_COLUMNS
        );
        let query = query.as_str();
        let rows = with_retry("open_commands", || async move {
            let rows = sqlx::query_as::<_, CommandRow>(query)
                .bind(device_id)
                .fetch_all(&self.pool)
                .await?;
            Ok::<_, Error>(rows)
        })
        .await?;
        rows.into_iter().map(Command::try_from).collect()
    }

    async fn save_transitions(&self, transitions: &[Transition]) -> Result<()> {
        if transitions.is_empty() {
            return Ok(());
        }
        with_retry("save_transitions", || self.save_transitions_inner(transitions)).await
    }

    async fn devices_with_due_commands(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        with_retry("devices_with_due_commands", || async move {
            let devices: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT DISTINCT device_id FROM commands
                WHERE state IN ('pending', 'delivered') AND expires_at <= $1
                "#,
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok::<_, Error>(devices)
        })
        .await
    }

    async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        with_retry("insert_readings", || self.insert_readings_inner(readings)).await?;
        let elapsed = start.elapsed().as_secs_f64();
        INGEST_LATENCY_SECONDS.observe(elapsed);
        debug!("Inserted {} readings in {:.3}s", readings.len(), elapsed);
        Ok(())
    }

    async fn count_readings(&self, device_id: &str) -> Result<usize> {
        with_retry("count_readings", || async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings WHERE device_id = $1")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?;
            Ok::<_, Error>(count as usize)
        })
        .await
    }
}

/// Runs `op` again on transient database errors with exponential backoff.
/// Constraint violations are the caller's fault and surface as `InvalidArgument`;
/// anything else still failing after the last attempt surfaces as `Unavailable`.
async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(Error::Database(db_err)) => {
                if is_constraint_violation(&db_err) {
                    warn!("Database {} rejected: {}", op, db_err);
                    return Err(Error::InvalidArgument(format!("{} rejected: {}", op, db_err)));
                }
                if attempts >= MAX_ATTEMPTS || !is_transient_error(&db_err) {
                    error!(
                        "Database {} failed permanently after {} attempts: {}",
                        op, attempts, db_err
                    );
                    return Err(Error::Unavailable(format!("database {} failed: {}", op, db_err)));
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "Database {} failed (attempt {}/{}), retrying in {}ms: {}",
                    op, attempts, MAX_ATTEMPTS, wait_ms, db_err
                );
                DB_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_constraint_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                || db_err.is_foreign_key_violation()
                || db_err.is_check_violation()
        }
        _ => false,
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" // serialization_failure
            })
        }
        _ => false,
    }
}
