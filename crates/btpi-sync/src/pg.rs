//! PostgreSQL query source over a single `sqlx::PgConnection`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{
    PgConnectOptions, PgConnection, PgRow, PgTypeKind, PgValueFormat, PgValueRef, Postgres,
};
use sqlx::{Column, Connection, Decode, Row, Type, TypeInfo, ValueRef};
use uuid::Uuid;

use crate::config::DatabaseSettings;
use crate::{ExecutorError, QueryConnection, QuerySource};

#[derive(Debug, Clone)]
pub struct PgQuerySource {
    options: PgConnectOptions,
    target: String,
}

impl PgQuerySource {
    pub fn from_settings(settings: &DatabaseSettings) -> Result<Self, ExecutorError> {
        let options = match &settings.url {
            Some(url) => url
                .parse::<PgConnectOptions>()
                .map_err(|source| ExecutorError::Connect {
                    target: "configured database url".to_string(),
                    source,
                })?,
            None => PgConnectOptions::new()
                .host(&settings.server)
                .port(settings.port)
                .username(&settings.user)
                .password(&settings.password)
                .database(&settings.database),
        };
        let target = format!(
            "database {} on server {}",
            options.get_database().unwrap_or("<default>"),
            options.get_host()
        );
        Ok(Self { options, target })
    }
}

#[async_trait]
impl QuerySource for PgQuerySource {
    fn describe(&self) -> String {
        self.target.clone()
    }

    async fn connect(&self, timeout: Duration) -> Result<Box<dyn QueryConnection>, ExecutorError> {
        let conn = tokio::time::timeout(timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| ExecutorError::ConnectTimeout {
                target: self.target.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|source| ExecutorError::Connect {
                target: self.target.clone(),
                source,
            })?;
        Ok(Box::new(PgQueryConnection { conn }))
    }
}

pub struct PgQueryConnection {
    conn: PgConnection,
}

#[async_trait]
impl QueryConnection for PgQueryConnection {
    async fn fetch_rows(&mut self, sql: &str) -> Result<Vec<Map<String, Value>>, ExecutorError> {
        let rows = sqlx::query(sql).fetch_all(&mut self.conn).await?;
        rows.iter()
            .map(|row| row_to_json(row).map_err(ExecutorError::from))
            .collect()
    }

    async fn close(self: Box<Self>) -> Result<(), ExecutorError> {
        self.conn.close().await.map_err(ExecutorError::from)
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Converts one row to a JSON object whose keys follow column order.
pub fn row_to_json(row: &PgRow) -> Result<Map<String, Value>, sqlx::Error> {
    let mut out = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_info = raw.type_info().into_owned();
            match type_info.name().to_ascii_uppercase().as_str() {
                "BOOL" => Value::Bool(row.try_get::<bool, _>(idx)?),
                "INT2" => Value::from(row.try_get::<i16, _>(idx)?),
                "INT4" => Value::from(row.try_get::<i32, _>(idx)?),
                "INT8" => Value::from(row.try_get::<i64, _>(idx)?),
                "OID" => Value::from(row.try_get::<Oid, _>(idx)?.0),
                "FLOAT4" => float(f64::from(row.try_get::<f32, _>(idx)?)),
                "FLOAT8" => float(row.try_get::<f64, _>(idx)?),
                "NUMERIC" => numeric_json(row, idx, &raw),
                "JSON" | "JSONB" => row.try_get::<Value, _>(idx)?,
                "TIMESTAMPTZ" => Value::String(row.try_get::<DateTime<Utc>, _>(idx)?.to_rfc3339()),
                "TIMESTAMP" => Value::String(
                    row.try_get::<NaiveDateTime, _>(idx)?
                        .format("%Y-%m-%dT%H:%M:%S%.f")
                        .to_string(),
                ),
                "DATE" => Value::String(row.try_get::<NaiveDate, _>(idx)?.to_string()),
                "TIME" => Value::String(row.try_get::<NaiveTime, _>(idx)?.to_string()),
                "INTERVAL" => Value::String(iso_duration(&row.try_get::<PgInterval, _>(idx)?)),
                "UUID" => Value::String(row.try_get::<Uuid, _>(idx)?.to_string()),
                "BYTEA" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(idx)?)),
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
                    Value::String(row.try_get_unchecked::<String, _>(idx)?)
                }
                name if name.ends_with("[]") => array_json(row, idx, name.trim_end_matches("[]")),
                _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => {
                    Value::String(row.try_get_unchecked::<String, _>(idx)?)
                }
                _ => Value::Null,
            }
        };
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

fn numeric_json(row: &PgRow, idx: usize, raw: &PgValueRef<'_>) -> Value {
    if let Ok(d) = row.try_get::<Decimal, _>(idx) {
        return match d.to_f64().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(d.to_string()),
        };
    }
    // NaN, the infinities and magnitudes past Decimal's range.
    let text = match raw.format() {
        PgValueFormat::Text => raw.as_str().ok().map(str::to_string),
        PgValueFormat::Binary => raw.as_bytes().ok().and_then(numeric_text),
    };
    match text {
        Some(text) => match text.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(text),
        },
        None => Value::Null,
    }
}

/// Renders a binary NUMERIC the way Postgres prints it.
fn numeric_text(bytes: &[u8]) -> Option<String> {
    let word = |i: usize| {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = usize::try_from(word(0)?).ok()?;
    let weight = i32::from(word(1)?);
    let sign = word(2)? as u16;
    let dscale = usize::from(word(3)? as u16);
    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Option<Vec<i16>>>()?;
    // base-10000 digit at `pos`, counted from the most significant group
    let digit = |pos: i32| {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for pos in 1..=weight {
            out.push_str(&format!("{:04}", digit(pos)));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut pos = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

/// ISO 8601 duration, e.g. `P1Y2M3DT4H5M6.5S`.
fn iso_duration(interval: &PgInterval) -> String {
    let years = interval.months / 12;
    let months = interval.months % 12;
    let micros = interval.microseconds;
    let hours = micros / 3_600_000_000;
    let minutes = (micros % 3_600_000_000) / 60_000_000;
    let seconds = (micros % 60_000_000) as f64 / 1_000_000.0;
    format!(
        "P{years}Y{months}M{}DT{hours}H{minutes}M{seconds}S",
        interval.days
    )
}

fn array_of<T>(row: &PgRow, idx: usize, to_json: impl Fn(T) -> Value) -> Option<Value>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    let items = row.try_get_unchecked::<Vec<Option<T>>, _>(idx).ok()?;
    Some(Value::Array(
        items
            .into_iter()
            .map(|item| item.map(&to_json).unwrap_or(Value::Null))
            .collect(),
    ))
}

/// One-dimensional arrays of the common element types; anything else is null.
fn array_json(row: &PgRow, idx: usize, element: &str) -> Value {
    let decoded = match element {
        "BOOL" => array_of::<bool>(row, idx, Value::Bool),
        "INT2" => array_of::<i16>(row, idx, Value::from),
        "INT4" => array_of::<i32>(row, idx, Value::from),
        "INT8" => array_of::<i64>(row, idx, Value::from),
        "FLOAT4" => array_of::<f32>(row, idx, |v| float(f64::from(v))),
        "FLOAT8" => array_of::<f64>(row, idx, float),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => array_of::<String>(row, idx, Value::String),
        "UUID" => array_of::<Uuid>(row, idx, |v| Value::String(v.to_string())),
        "DATE" => array_of::<NaiveDate>(row, idx, |v| Value::String(v.to_string())),
        "TIMESTAMPTZ" => array_of::<DateTime<Utc>>(row, idx, |v| Value::String(v.to_rfc3339())),
        "JSONB" => array_of::<Value>(row, idx, |v| v),
        _ => None,
    };
    decoded.unwrap_or(Value::Null)
}
