//! Database probes: run one query and validate its first row.
//!
//! Each attempt opens its own connection and drops it before returning, so
//! nothing outlives the probe on any exit path.

#![allow(missing_docs)]

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::core::errors::{LzrError, Result};
use crate::health::engine::AttemptOutcome;
use crate::health::probe::{DatabaseProbe, DbEngine, QueryCheck};
use crate::health::secrets::{SecretSource, resolve_connection};

/// A single value read from the first row of a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl ScalarValue {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(raw) => raw.trim().parse().ok(),
            Self::Null | Self::Timestamp(_) => None,
        }
    }

    /// Interpret as a point in time: native timestamps, RFC 3339 or
    /// `YYYY-MM-DD HH:MM:SS[.f]` text (UTC), or integer epoch seconds.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Integer(secs) => DateTime::from_timestamp(*secs, 0),
            Self::Text(raw) => {
                let raw = raw.trim();
                DateTime::parse_from_rfc3339(raw)
                    .map(|ts| ts.with_timezone(&Utc))
                    .ok()
                    .or_else(|| {
                        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                            .ok()
                            .map(|naive| naive.and_utc())
                    })
            }
            Self::Null | Self::Float(_) => None,
        }
    }
}

/// Column names plus the first column of the first row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryRow {
    pub columns: Vec<String>,
    pub first: Option<ScalarValue>,
}

/// A connection able to run one read query.
pub trait QueryExecutor: Send {
    fn query_first(&mut self, sql: &str) -> Result<QueryRow>;
}

/// Which engine serves `url`, honoring an explicit override.
pub fn detect_engine(url: &str, explicit: Option<DbEngine>) -> Result<DbEngine> {
    if let Some(engine) = explicit {
        return Ok(engine);
    }
    let lowered = url.trim().to_ascii_lowercase();
    if lowered.starts_with("sqlite:") || lowered.starts_with("file:") {
        Ok(DbEngine::Sqlite)
    } else if lowered.starts_with("postgres://") || lowered.starts_with("postgresql://") {
        Ok(DbEngine::Postgres)
    } else if lowered.starts_with("mysql://") {
        Ok(DbEngine::Mysql)
    } else if lowered.starts_with("mongodb://") || lowered.starts_with("mongodb+srv://") {
        Ok(DbEngine::Mongodb)
    } else {
        Err(LzrError::validation(
            "cannot infer database engine from connection string; set `type`",
        ))
    }
}

/// Open a connection for `url`.
pub fn connect(url: &str, engine: DbEngine, timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    match engine {
        DbEngine::Sqlite => connect_sqlite(url, timeout),
        DbEngine::Postgres => connect_postgres(url, timeout),
        DbEngine::Mysql => connect_mysql(url, timeout),
        DbEngine::Mongodb => connect_mongodb(url, timeout),
    }
}

/// Validate `row` against `check` at time `now`.
#[must_use]
pub fn evaluate(check: &QueryCheck, row: &QueryRow, now: DateTime<Utc>) -> AttemptOutcome {
    match check {
        QueryCheck::Range { min, max } => {
            let Some(value) = row.first.as_ref().and_then(ScalarValue::as_f64) else {
                return AttemptOutcome::failed(format!(
                    "expected a numeric value in [{min}, {max}], got {:?}",
                    row.first
                ));
            };
            if *min <= value && value <= *max {
                AttemptOutcome::passed(format!("value {value} within [{min}, {max}]"))
            } else {
                AttemptOutcome::failed(format!("value {value} outside [{min}, {max}]"))
            }
        }
        QueryCheck::Columns { expected } => {
            let missing: Vec<&str> = expected
                .iter()
                .filter(|col| !row.columns.iter().any(|have| have == *col))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                AttemptOutcome::passed(format!("all {} expected columns present", expected.len()))
            } else {
                AttemptOutcome::failed(format!("missing columns: {}", missing.join(", ")))
            }
        }
        QueryCheck::Recency { max_age } => {
            let Some(ts) = row.first.as_ref().and_then(ScalarValue::as_timestamp) else {
                return AttemptOutcome::failed(format!(
                    "expected a timestamp, got {:?}",
                    row.first
                ));
            };
            let age = (now - ts).num_milliseconds().max(0);
            #[allow(clippy::cast_precision_loss)]
            let age_secs = age as f64 / 1000.0;
            let mut outcome = if age_secs < max_age.as_secs_f64() {
                AttemptOutcome::passed(format!(
                    "newest record is {age_secs:.0}s old (limit {}s)",
                    max_age.as_secs()
                ))
            } else {
                AttemptOutcome::failed(format!(
                    "newest record is {age_secs:.0}s old, exceeds {}s",
                    max_age.as_secs()
                ))
            };
            outcome.observed_age_seconds = Some(age_secs);
            outcome
        }
    }
}

/// One attempt of a database probe.
pub fn run_attempt(
    probe: &DatabaseProbe,
    secrets: &dyn SecretSource,
    timeout: Duration,
    now: impl Fn() -> DateTime<Utc>,
) -> AttemptOutcome {
    let row = resolve_connection(&probe.connection, secrets).and_then(|url| {
        let engine = detect_engine(&url, probe.engine)?;
        let mut conn = connect(&url, engine, timeout)?;
        conn.query_first(&probe.sql)
    });
    match row {
        Ok(row) => evaluate(&probe.check, &row, now()),
        Err(e) => AttemptOutcome::failed(e.to_string()),
    }
}

// ──────────────────── sqlite ────────────────────

#[cfg(feature = "sqlite")]
struct SqliteExecutor {
    conn: rusqlite::Connection,
}

#[cfg(feature = "sqlite")]
fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

#[cfg(feature = "sqlite")]
fn connect_sqlite(url: &str, timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    use rusqlite::{Connection, OpenFlags};

    let path = sqlite_path(url);
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| LzrError::transient("database", format!("open {path}: {e}")))?;
    conn.busy_timeout(timeout)?;
    Ok(Box::new(SqliteExecutor { conn }))
}

#[cfg(not(feature = "sqlite"))]
fn connect_sqlite(_url: &str, _timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    Err(LzrError::validation("sqlite probes require the `sqlite` feature"))
}

#[cfg(feature = "sqlite")]
impl QueryExecutor for SqliteExecutor {
    fn query_first(&mut self, sql: &str) -> Result<QueryRow> {
        use rusqlite::types::ValueRef;

        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.is_empty() {
            return Ok(QueryRow::default());
        }
        let mut rows = stmt.query([])?;
        let first = match rows.next()? {
            Some(row) => Some(match row.get_ref(0)? {
                ValueRef::Null => ScalarValue::Null,
                ValueRef::Integer(v) => ScalarValue::Integer(v),
                ValueRef::Real(v) => ScalarValue::Float(v),
                ValueRef::Text(bytes) => ScalarValue::Text(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(bytes) => ScalarValue::Text(format!("<{} byte blob>", bytes.len())),
            }),
            None => None,
        };
        Ok(QueryRow { columns, first })
    }
}

// ──────────────────── postgres ────────────────────

#[cfg(feature = "postgres")]
struct PostgresExecutor {
    client: postgres::Client,
}

#[cfg(feature = "postgres")]
fn connect_postgres(url: &str, timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    let mut config: postgres::Config = url
        .parse()
        .map_err(|e| LzrError::validation(format!("invalid postgres connection string: {e}")))?;
    config.connect_timeout(timeout);
    let mut client = config
        .connect(postgres::NoTls)
        .map_err(|e| LzrError::transient("database", format!("connect: {e}")))?;
    client
        .batch_execute(&format!(
            "SET statement_timeout = {}",
            timeout.as_millis().max(1)
        ))
        .map_err(|e| LzrError::transient("database", format!("set statement_timeout: {e}")))?;
    Ok(Box::new(PostgresExecutor { client }))
}

#[cfg(not(feature = "postgres"))]
fn connect_postgres(_url: &str, _timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    Err(LzrError::validation(
        "postgres probes require the `postgres` feature",
    ))
}

#[cfg(feature = "postgres")]
impl QueryExecutor for PostgresExecutor {
    fn query_first(&mut self, sql: &str) -> Result<QueryRow> {
        let query_err = |e: postgres::Error| LzrError::transient("database", format!("query: {e}"));
        let stmt = self.client.prepare(sql).map_err(query_err)?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = self.client.query(&stmt, &[]).map_err(query_err)?;
        let first = match rows.first() {
            Some(row) if !columns.is_empty() => Some(pg_scalar(row).map_err(query_err)?),
            _ => None,
        };
        Ok(QueryRow { columns, first })
    }
}

#[cfg(feature = "postgres")]
fn pg_scalar(row: &postgres::Row) -> std::result::Result<ScalarValue, postgres::Error> {
    use postgres::types::Type;

    let ty = row.columns()[0].type_().clone();
    let value = if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(0)?.map(|v| ScalarValue::Integer(i64::from(v)))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(0)?.map(|v| ScalarValue::Integer(i64::from(v)))
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(0)?.map(ScalarValue::Integer)
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(0)?.map(|v| ScalarValue::Float(f64::from(v)))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(0)?.map(ScalarValue::Float)
    } else if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(0)?.map(|v| ScalarValue::Integer(i64::from(v)))
    } else if ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(0)?.map(ScalarValue::Timestamp)
    } else if ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(0)?
            .map(|naive| ScalarValue::Timestamp(naive.and_utc()))
    } else {
        // NUMERIC and friends: cast in SQL (e.g. `::float8`) to compare numerically.
        row.try_get::<_, Option<String>>(0)
            .unwrap_or_else(|_| Some(format!("<unsupported type {ty}>")))
            .map(ScalarValue::Text)
    };
    Ok(value.unwrap_or(ScalarValue::Null))
}

// ──────────────────── mysql ────────────────────

#[cfg(feature = "mysql")]
struct MysqlExecutor {
    conn: mysql::Conn,
}

#[cfg(feature = "mysql")]
fn connect_mysql(url: &str, timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    let opts = mysql::Opts::from_url(url)
        .map_err(|e| LzrError::validation(format!("invalid mysql connection string: {e}")))?;
    let opts = mysql::OptsBuilder::from_opts(opts)
        .tcp_connect_timeout(Some(timeout))
        .read_timeout(Some(timeout))
        .write_timeout(Some(timeout));
    let conn = mysql::Conn::new(opts)
        .map_err(|e| LzrError::transient("database", format!("connect: {e}")))?;
    Ok(Box::new(MysqlExecutor { conn }))
}

#[cfg(not(feature = "mysql"))]
fn connect_mysql(_url: &str, _timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    Err(LzrError::validation("mysql probes require the `mysql` feature"))
}

#[cfg(feature = "mysql")]
impl QueryExecutor for MysqlExecutor {
    fn query_first(&mut self, sql: &str) -> Result<QueryRow> {
        use mysql::prelude::Queryable;

        let query_err = |e: mysql::Error| LzrError::transient("database", format!("query: {e}"));
        let mut result = self.conn.query_iter(sql).map_err(query_err)?;
        let columns: Vec<String> = result
            .columns()
            .as_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let first = match result.next() {
            Some(row) if !columns.is_empty() => {
                let row = row.map_err(query_err)?;
                Some(row.as_ref(0).map_or(ScalarValue::Null, mysql_scalar))
            }
            _ => None,
        };
        Ok(QueryRow { columns, first })
    }
}

#[cfg(feature = "mysql")]
#[allow(clippy::cast_precision_loss)]
fn mysql_scalar(value: &mysql::Value) -> ScalarValue {
    use mysql::Value;

    match value {
        Value::NULL => ScalarValue::Null,
        Value::Int(v) => ScalarValue::Integer(*v),
        Value::UInt(v) => i64::try_from(*v).map_or(ScalarValue::Float(*v as f64), ScalarValue::Integer),
        Value::Float(v) => ScalarValue::Float(f64::from(*v)),
        Value::Double(v) => ScalarValue::Float(*v),
        // The text protocol returns numbers and datetimes as bytes too.
        Value::Bytes(bytes) => ScalarValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            chrono::NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|date| {
                    date.and_hms_micro_opt(u32::from(*hour), u32::from(*minute), u32::from(*second), *micros)
                })
                .map_or(ScalarValue::Null, |naive| ScalarValue::Timestamp(naive.and_utc()))
        }
        other @ Value::Time(..) => ScalarValue::Text(format!("{other:?}")),
    }
}

// ──────────────────── mongodb ────────────────────

#[cfg(feature = "mongodb")]
struct MongoExecutor {
    client: mongodb::sync::Client,
}

/// Append driver timeouts to a MongoDB URI unless the caller set them.
#[must_use]
pub fn mongodb_uri_with_timeouts(url: &str, timeout: Duration) -> String {
    let millis = timeout.as_millis().max(1);
    let mut uri = url.to_string();
    for option in ["connectTimeoutMS", "serverSelectionTimeoutMS"] {
        if uri.contains(option) {
            continue;
        }
        let separator = if uri.contains('?') {
            "&"
        } else if uri.split_once("://").is_some_and(|(_, rest)| rest.contains('/')) {
            "?"
        } else {
            "/?"
        };
        uri = format!("{uri}{separator}{option}={millis}");
    }
    uri
}

#[cfg(feature = "mongodb")]
fn connect_mongodb(url: &str, timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    let client = mongodb::sync::Client::with_uri_str(mongodb_uri_with_timeouts(url, timeout))
        .map_err(|e| LzrError::validation(format!("invalid mongodb connection string: {e}")))?;
    Ok(Box::new(MongoExecutor { client }))
}

#[cfg(not(feature = "mongodb"))]
fn connect_mongodb(_url: &str, _timeout: Duration) -> Result<Box<dyn QueryExecutor>> {
    Err(LzrError::validation("mongodb probes require the `mongodb` feature"))
}

#[cfg(feature = "mongodb")]
impl QueryExecutor for MongoExecutor {
    /// Columns are the reply's keys; the value is the first field other
    /// than `ok`, or `ok` itself for status-only replies such as `ping`.
    fn query_first(&mut self, command: &str) -> Result<QueryRow> {
        let parsed: serde_json::Value = serde_json::from_str(command)
            .map_err(|e| LzrError::validation(format!("mongodb command is not JSON: {e}")))?;
        let document = mongodb::bson::to_document(&parsed)
            .map_err(|e| LzrError::validation(format!("mongodb command is not a document: {e}")))?;
        let database = self
            .client
            .default_database()
            .unwrap_or_else(|| self.client.database("admin"));
        let reply = database
            .run_command(document)
            .run()
            .map_err(|e| LzrError::transient("database", format!("command: {e}")))?;

        let columns: Vec<String> = reply.keys().cloned().collect();
        let first = reply
            .iter()
            .find(|(key, _)| key.as_str() != "ok")
            .or_else(|| reply.iter().next())
            .map(|(_, value)| bson_scalar(value));
        Ok(QueryRow { columns, first })
    }
}

#[cfg(feature = "mongodb")]
#[allow(clippy::cast_precision_loss)]
fn bson_scalar(value: &mongodb::bson::Bson) -> ScalarValue {
    use mongodb::bson::Bson;

    match value {
        Bson::Null | Bson::Undefined => ScalarValue::Null,
        Bson::Int32(v) => ScalarValue::Integer(i64::from(*v)),
        Bson::Int64(v) => ScalarValue::Integer(*v),
        Bson::Double(v) => ScalarValue::Float(*v),
        Bson::Boolean(v) => ScalarValue::Integer(i64::from(*v)),
        Bson::String(v) => ScalarValue::Text(v.clone()),
        Bson::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis())
            .map_or(ScalarValue::Null, ScalarValue::Timestamp),
        other => ScalarValue::Text(other.to_string()),
    }
}
