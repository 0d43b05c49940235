//! Row codec: how a [`Job`] is laid out in the `jobs` table.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use hostq_core::{Job, JobId, JobState};

use super::error::StoreError;

/// Fixed-width UTC format; sorts lexicographically in time order and stays
/// comparable with legacy `CURRENT_TIMESTAMP` values (`YYYY-MM-DD HH:MM:SS`).
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TS_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TS_PARSE_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::decode(format!("invalid timestamp {raw:?}: {e}")))
}

fn decode_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| decode_ts(&s))
        .transpose()
}

/// Payloads are JSON text; legacy rows may hold arbitrary text.
fn decode_payload(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

pub(crate) fn encode_payload(value: &Value) -> String {
    value.to_string()
}

/// `target_port` of NULL or 0 is the legacy wildcard.
pub(crate) fn encode_port(port: Option<u16>) -> Option<i64> {
    port.filter(|p| *p > 0).map(i64::from)
}

fn decode_port(raw: Option<i64>) -> Option<u16> {
    raw.filter(|p| *p > 0 && *p <= i64::from(u16::MAX))
        .map(|p| p as u16)
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::decode(format!("column {name}: {e}")))
}

fn non_negative(name: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::decode(format!("column {name}: {value} out of range")))
}

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let job_id: String = column(row, "job_id")?;
    let job_id: JobId = job_id
        .parse()
        .map_err(|e| StoreError::decode(format!("column job_id: {e}")))?;
    let state: String = column(row, "state")?;
    let state: JobState = state
        .parse()
        .map_err(|e| StoreError::decode(format!("column state: {e}")))?;
    let enqueue_ts: String = column(row, "enqueue_ts")?;

    Ok(Job {
        job_id,
        method: column(row, "method")?,
        params: decode_payload(column(row, "params_json")?),
        rpc_id: column(row, "rpc_id")?,
        idempotency_key: column(row, "idempotency_key")?,
        priority: i32::try_from(column::<i64>(row, "priority")?)
            .map_err(|_| StoreError::decode("column priority out of range"))?,
        timeout_sec: non_negative("timeout_sec", column(row, "timeout_sec")?)?,
        attempts: non_negative("attempts", column(row, "attempts")?)?,
        max_attempts: non_negative("max_attempts", column(row, "max_attempts")?)?,
        target_port: decode_port(column(row, "target_port")?),
        state,
        enqueue_ts: decode_ts(&enqueue_ts)?,
        claim_ts: decode_opt_ts(column(row, "claim_ts")?)?,
        start_ts: decode_opt_ts(column(row, "start_ts")?)?,
        heartbeat_ts: decode_opt_ts(column(row, "heartbeat_ts")?)?,
        finish_ts: decode_opt_ts(column(row, "finish_ts")?)?,
        result: column::<Option<String>>(row, "result_json")?.map(decode_payload),
        error_code: column(row, "error_code")?,
        error_msg: column(row, "error_msg")?,
    })
}
