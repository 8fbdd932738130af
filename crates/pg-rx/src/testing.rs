//! Scripted, in-memory connections for exercising sequences without a database.
use crate::{Connection, ConnectionHandle, ConnectionProvider, Error, Query, QueryResult, Row};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// FakeProvider hands out FakeConnections which share its statement log,
/// and counts acquisitions and releases of their handles.
#[derive(Clone, Default)]
pub(crate) struct FakeProvider {
    fail_acquire: bool,
    fail_rollback: bool,
    log: Arc<Mutex<Vec<String>>>,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl FakeProvider {
    /// A FakeProvider whose acquisitions fail with a connection error.
    pub fn failing_acquire() -> Self {
        Self {
            fail_acquire: true,
            ..Default::default()
        }
    }

    /// A FakeProvider whose connections fail to ROLLBACK.
    pub fn failing_rollback() -> Self {
        Self {
            fail_rollback: true,
            ..Default::default()
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();

        ConnectionHandle::new(FakeConnection {
            log: self.log.clone(),
            fail_rollback: self.fail_rollback,
        })
        .with_release_hook(move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for FakeProvider {
    fn acquire(&self) -> BoxFuture<'static, Result<ConnectionHandle, Error>> {
        let outcome = if self.fail_acquire {
            Err(Error::Connection(
                "error communicating with database: Connection refused (os error 111)".to_string(),
            ))
        } else {
            Ok(self.handle())
        };
        futures::future::ready(outcome).boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(()).boxed()
    }
}

struct FakeConnection {
    log: Arc<Mutex<Vec<String>>>,
    fail_rollback: bool,
}

// Scripted outcome of a statement.
enum Script {
    Rows(Vec<Row>),
    RowsThenError(Vec<Row>, Error),
    Stall,
}

impl FakeConnection {
    fn evaluate(&self, query: &Query) -> Script {
        let text = query.text().trim();
        self.log.lock().unwrap().push(text.to_string());

        match text {
            "BEGIN" | "COMMIT" => return Script::Rows(Vec::new()),
            "ROLLBACK" if self.fail_rollback => {
                return Script::RowsThenError(Vec::new(), Error::query("could not roll back"))
            }
            "ROLLBACK" => return Script::Rows(Vec::new()),
            "SELECT * FROM not_a_table" => {
                return Script::RowsThenError(
                    Vec::new(),
                    Error::Query {
                        message: r#"relation "not_a_table" does not exist"#.to_string(),
                        code: Some("42P01".to_string()),
                    },
                )
            }
            _ => (),
        }

        if text.starts_with("SELECT pg_sleep(") {
            return Script::Stall;
        }
        if let Some(count) = text
            .strip_prefix("SELECT n FROM generate_series(1, ")
            .and_then(|rest| rest.strip_suffix(") n"))
            .and_then(|count| count.parse::<i64>().ok())
        {
            return Script::Rows(series(count));
        }
        if let Some(count) = text
            .strip_prefix("SELECT n FROM broken_series(")
            .and_then(|rest| rest.strip_suffix(") n"))
            .and_then(|count| count.parse::<i64>().ok())
        {
            return Script::RowsThenError(series(count), Error::query("division by zero"));
        }
        // SELECT <integer or parameter>[::int] AS count
        if let Some(expr) = text
            .strip_prefix("SELECT ")
            .and_then(|rest| rest.strip_suffix(" AS count"))
        {
            let expr = expr.trim_end_matches("::int");
            let value = match expr.strip_prefix('$') {
                Some(index) => index
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| query.params().get(index.checked_sub(1)?))
                    .and_then(Value::as_i64),
                None => expr.parse::<i64>().ok(),
            };
            if let Some(value) = value {
                return Script::Rows(vec![row("count", value)]);
            }
        }

        let near = text.split_whitespace().next().unwrap_or_default();
        Script::RowsThenError(
            Vec::new(),
            Error::Query {
                message: format!("syntax error at or near \"{near}\""),
                code: Some("42601".to_string()),
            },
        )
    }
}

impl Connection for FakeConnection {
    fn submit<'c>(&'c mut self, query: &'c Query) -> BoxFuture<'c, Result<QueryResult, Error>> {
        let script = self.evaluate(query);

        async move {
            match script {
                Script::Rows(rows) => Ok(QueryResult {
                    row_count: rows.len() as u64,
                    rows,
                }),
                Script::RowsThenError(_, err) => Err(err),
                Script::Stall => futures::future::pending().await,
            }
        }
        .boxed()
    }

    fn open_cursor<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Row, Error>> {
        match self.evaluate(query) {
            Script::Rows(rows) => futures::stream::iter(rows.into_iter().map(Ok)).boxed(),
            Script::RowsThenError(rows, err) => futures::stream::iter(rows.into_iter().map(Ok))
                .chain(futures::stream::once(async move { Err(err) }))
                .boxed(),
            Script::Stall => futures::stream::pending().boxed(),
        }
    }

    fn discard(self: Box<Self>) {
        self.log.lock().unwrap().push("<discarded>".to_string());
    }
}

fn row(column: &str, value: i64) -> Row {
    let mut row = Row::new();
    row.insert(column.to_string(), json!(value));
    row
}

fn series(count: i64) -> Vec<Row> {
    (1..=count).map(|n| row("n", n)).collect()
}
