use crate::{Connection, ConnectionHandle, ConnectionProvider, Error, Query, QueryResult, Row};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgHasArrayType, PgPool, PgRow, Postgres};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection as _, Row as _, TypeInfo};
use std::sync::Arc;

impl ConnectionProvider for PgPool {
    fn acquire(&self) -> BoxFuture<'static, Result<ConnectionHandle, Error>> {
        let pool = self.clone();

        async move {
            let conn = pool
                .acquire()
                .await
                .map_err(|err| Error::Connection(err.to_string()))?;
            Ok(ConnectionHandle::new(Pooled(conn)))
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let pool = self.clone();
        async move { pool.close().await }.boxed()
    }
}

struct Pooled(PoolConnection<Postgres>);

impl Connection for Pooled {
    fn submit<'c>(&'c mut self, query: &'c Query) -> BoxFuture<'c, Result<QueryResult, Error>> {
        submit(&mut self.0, query)
    }

    fn open_cursor<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Row, Error>> {
        open_cursor(&mut self.0, query)
    }

    fn discard(self: Box<Self>) {
        // Detached connections are closed rather than returned to the pool.
        let Pooled(conn) = *self;
        std::mem::drop(conn.detach());
    }
}

/// Dedicated is a single long-lived connection, used by one query, stream
/// or transaction at a time. Acquisition waits for the current user's
/// handle to be released.
#[derive(Clone)]
pub struct Dedicated {
    conn: Arc<tokio::sync::Mutex<Option<PgConnection>>>,
}

impl Dedicated {
    pub async fn connect(options: &PgConnectOptions) -> Result<Self, Error> {
        let conn = PgConnection::connect_with(options)
            .await
            .map_err(|err| Error::Connection(err.to_string()))?;

        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(Some(conn))),
        })
    }
}

impl ConnectionProvider for Dedicated {
    fn acquire(&self) -> BoxFuture<'static, Result<ConnectionHandle, Error>> {
        let conn = self.conn.clone();

        async move {
            let guard = conn.lock_owned().await;
            if guard.is_none() {
                return Err(ended());
            }
            Ok(ConnectionHandle::new(Locked(guard)))
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let conn = self.conn.clone();

        async move {
            let Some(conn) = conn.lock().await.take() else {
                return;
            };
            if let Err(err) = conn.close().await {
                tracing::warn!(%err, "failed to gracefully close dedicated connection");
            }
        }
        .boxed()
    }
}

struct Locked(tokio::sync::OwnedMutexGuard<Option<PgConnection>>);

impl Connection for Locked {
    fn submit<'c>(&'c mut self, query: &'c Query) -> BoxFuture<'c, Result<QueryResult, Error>> {
        match (*self.0).as_mut() {
            Some(conn) => submit(conn, query),
            None => futures::future::ready(Err(ended())).boxed(),
        }
    }

    fn open_cursor<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Row, Error>> {
        match (*self.0).as_mut() {
            Some(conn) => open_cursor(conn, query),
            None => futures::stream::once(futures::future::ready(Err(ended()))).boxed(),
        }
    }

    fn discard(mut self: Box<Self>) {
        // The client is ended, and later acquisitions fail.
        std::mem::drop(self.0.take());
    }
}

fn ended() -> Error {
    Error::Connection("client connection has ended".to_string())
}

fn submit<'c>(conn: &'c mut PgConnection, query: &'c Query) -> BoxFuture<'c, Result<QueryResult, Error>> {
    async move {
        let mut results = bind(sqlx::query(query.text()), query.params()).fetch_many(conn);
        let mut out = QueryResult::default();

        while let Some(item) = results.try_next().await? {
            match item {
                sqlx::Either::Left(done) => out.row_count += done.rows_affected(),
                sqlx::Either::Right(row) => out.rows.push(decode_row(&row)?),
            }
        }
        Ok(out)
    }
    .boxed()
}

fn open_cursor<'c>(conn: &'c mut PgConnection, query: &'c Query) -> BoxStream<'c, Result<Row, Error>> {
    bind(sqlx::query(query.text()), query.params())
        .fetch(conn)
        .map(|row| decode_row(&row?))
        .boxed()
}

fn bind<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(n) => query.bind(n),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(param)),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, Error> {
    let mut out = Row::new();

    for column in row.columns() {
        let kind = Kind::of(column.type_info().name());
        let value = decode_column(row, column.ordinal(), kind)?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Kind is how a column of a given Postgres type is decoded into JSON.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    Scalar(Scalar),
    Array(Scalar),
    Void,
    // Any other type, which is passed through as its raw value.
    Raw,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Scalar {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Text,
    Json,
    Uuid,
    Timestamptz,
    Timestamp,
    Date,
    Time,
    Interval,
    Bytea,
    Inet,
}

impl Kind {
    fn of(type_name: &str) -> Self {
        if type_name == "VOID" {
            return Kind::Void;
        }
        match type_name.strip_suffix("[]") {
            Some(element) => Scalar::of(element).map_or(Kind::Raw, Kind::Array),
            None => Scalar::of(type_name).map_or(Kind::Raw, Kind::Scalar),
        }
    }
}

impl Scalar {
    fn of(type_name: &str) -> Option<Self> {
        Some(match type_name {
            "BOOL" => Scalar::Bool,
            "INT2" => Scalar::Int2,
            "INT4" => Scalar::Int4,
            "INT8" => Scalar::Int8,
            "OID" => Scalar::Oid,
            "FLOAT4" => Scalar::Float4,
            "FLOAT8" => Scalar::Float8,
            "NUMERIC" => Scalar::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => Scalar::Text,
            "JSON" | "JSONB" => Scalar::Json,
            "UUID" => Scalar::Uuid,
            "TIMESTAMPTZ" => Scalar::Timestamptz,
            "TIMESTAMP" => Scalar::Timestamp,
            "DATE" => Scalar::Date,
            "TIME" => Scalar::Time,
            "INTERVAL" => Scalar::Interval,
            "BYTEA" => Scalar::Bytea,
            "INET" | "CIDR" => Scalar::Inet,
            _ => return None,
        })
    }
}

fn decode_column(row: &PgRow, index: usize, kind: Kind) -> Result<Value, sqlx::Error> {
    match kind {
        Kind::Void => Ok(Value::Null),
        Kind::Raw => decode_raw(row, index),
        Kind::Scalar(scalar) => decode_scalar(row, index, scalar),
        Kind::Array(scalar) => decode_array(row, index, scalar),
    }
}

fn decode_scalar(row: &PgRow, index: usize, scalar: Scalar) -> Result<Value, sqlx::Error> {
    use sqlx::postgres::types::{Oid, PgInterval};
    use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use sqlx::types::{ipnetwork::IpNetwork, BigDecimal, Uuid};

    match scalar {
        Scalar::Bool => get::<bool>(row, index, Value::Bool),
        Scalar::Int2 => get::<i16>(row, index, Value::from),
        Scalar::Int4 => get::<i32>(row, index, Value::from),
        Scalar::Int8 => get::<i64>(row, index, Value::from),
        Scalar::Oid => get::<Oid>(row, index, |oid| Value::from(oid.0)),
        Scalar::Float4 => get::<f32>(row, index, Value::from),
        Scalar::Float8 => get::<f64>(row, index, Value::from),
        Scalar::Numeric => get::<BigDecimal>(row, index, to_string),
        Scalar::Text => get::<String>(row, index, Value::String),
        Scalar::Json => get::<Value>(row, index, |value| value),
        Scalar::Uuid => get::<Uuid>(row, index, to_string),
        Scalar::Timestamptz => get::<DateTime<Utc>>(row, index, |ts| Value::String(ts.to_rfc3339())),
        Scalar::Timestamp => get::<NaiveDateTime>(row, index, to_string),
        Scalar::Date => get::<NaiveDate>(row, index, to_string),
        Scalar::Time => get::<NaiveTime>(row, index, to_string),
        Scalar::Interval => get::<PgInterval>(row, index, |interval| {
            interval_value(interval.months, interval.days, interval.microseconds)
        }),
        Scalar::Bytea => get::<Vec<u8>>(row, index, |bytes| bytea_value(&bytes)),
        Scalar::Inet => get::<IpNetwork>(row, index, to_string),
    }
}

// Arrays are decoded for element types which sqlx reads as arrays.
// Others are passed through raw.
fn decode_array(row: &PgRow, index: usize, element: Scalar) -> Result<Value, sqlx::Error> {
    use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
    use sqlx::types::{BigDecimal, Uuid};

    match element {
        Scalar::Bool => get_array::<bool>(row, index, Value::Bool),
        Scalar::Int2 => get_array::<i16>(row, index, Value::from),
        Scalar::Int4 => get_array::<i32>(row, index, Value::from),
        Scalar::Int8 => get_array::<i64>(row, index, Value::from),
        Scalar::Float4 => get_array::<f32>(row, index, Value::from),
        Scalar::Float8 => get_array::<f64>(row, index, Value::from),
        Scalar::Numeric => get_array::<BigDecimal>(row, index, to_string),
        Scalar::Text => get_array::<String>(row, index, Value::String),
        Scalar::Uuid => get_array::<Uuid>(row, index, to_string),
        Scalar::Timestamptz => get_array::<DateTime<Utc>>(row, index, |ts| Value::String(ts.to_rfc3339())),
        Scalar::Timestamp => get_array::<NaiveDateTime>(row, index, to_string),
        Scalar::Date => get_array::<NaiveDate>(row, index, to_string),
        _ => decode_raw(row, index),
    }
}

// Pass through a value of a type without a JSON decoding:
// text-format values as strings, and binary-format values as bytea-style hex.
fn decode_raw(row: &PgRow, index: usize) -> Result<Value, sqlx::Error> {
    use sqlx::postgres::PgValueFormat;
    use sqlx::ValueRef;

    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let value = match raw.format() {
        PgValueFormat::Text => raw.as_str().map(|text| Value::String(text.to_string())),
        PgValueFormat::Binary => raw.as_bytes().map(bytea_value),
    };
    value.map_err(|source| sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source,
    })
}

fn get<'r, T>(row: &'r PgRow, index: usize, map: impl FnOnce(T) -> Value) -> Result<Value, sqlx::Error>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    Ok(row.try_get::<Option<T>, _>(index)?.map_or(Value::Null, map))
}

fn get_array<T>(row: &PgRow, index: usize, map: impl Fn(T) -> Value) -> Result<Value, sqlx::Error>
where
    T: for<'a> sqlx::Decode<'a, Postgres> + sqlx::Type<Postgres> + PgHasArrayType,
{
    let Some(elements) = row.try_get::<Option<Vec<Option<T>>>, _>(index)? else {
        return Ok(Value::Null);
    };
    Ok(Value::Array(
        elements
            .into_iter()
            .map(|element| element.map_or(Value::Null, &map))
            .collect(),
    ))
}

fn to_string<T: std::fmt::Display>(value: T) -> Value {
    Value::String(value.to_string())
}

// Bytes are rendered as Postgres renders bytea: `\x` followed by hex.
fn bytea_value(bytes: &[u8]) -> Value {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    Value::String(out)
}

fn interval_value(months: i32, days: i32, microseconds: i64) -> Value {
    serde_json::json!({
        "months": months,
        "days": days,
        "microseconds": microseconds,
    })
}
