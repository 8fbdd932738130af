use crate::sequence::{Phase, SingleShot};
use crate::{ConnectionHandle, ConnectionProvider, Error};
use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A Row is a record of column names and their values.
pub type Row = serde_json::Map<String, Value>;

/// QueryResult is the complete result of a single-result query.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub row_count: u64,
    pub rows: Vec<Row>,
}

/// Query is SQL text and its ordered positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    text: String,
    params: Vec<Value>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Result<Self, Error> {
        Self::with_params(text, Vec::new())
    }

    pub fn with_params(text: impl Into<String>, params: Vec<Value>) -> Result<Self, Error> {
        let text = text.into();

        if text.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        Ok(Self { text, params })
    }

    // A query of non-empty static text.
    pub(crate) fn fixed(text: &'static str) -> Self {
        Self {
            text: text.to_string(),
            params: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Statement is implemented by values which render into a Query.
/// Query builders implement it to be usable wherever SQL text is.
pub trait Statement {
    fn into_query(self, params: Vec<Value>) -> Result<Query, Error>;
}

impl Statement for Query {
    fn into_query(mut self, params: Vec<Value>) -> Result<Query, Error> {
        self.params.extend(params);
        Ok(self)
    }
}

impl Statement for &str {
    fn into_query(self, params: Vec<Value>) -> Result<Query, Error> {
        Query::with_params(self, params)
    }
}

impl Statement for String {
    fn into_query(self, params: Vec<Value>) -> Result<Query, Error> {
        Query::with_params(self, params)
    }
}

/// A JSON query value is either SQL text, or a query config object
/// having a "text" string and optional "values" array.
impl Statement for Value {
    fn into_query(self, params: Vec<Value>) -> Result<Query, Error> {
        match self {
            Value::String(text) => Query::with_params(text, params),
            Value::Object(mut obj) => {
                let Some(Value::String(text)) = obj.remove("text") else {
                    return Err(Error::InvalidQueryObject(Value::Object(obj).to_string()));
                };
                let mut values = match obj.remove("values") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(values)) => values,
                    Some(other) => {
                        return Err(Error::InvalidQueryObject(format!(
                            "query values must be an array, not {other}"
                        )))
                    }
                };
                values.extend(params);
                Query::with_params(text, values)
            }
            other => Err(Error::InvalidQueryObject(other.to_string())),
        }
    }
}

/// Run a query on a connection handle which the returned sequence takes
/// ownership of. The query is submitted when the sequence is first polled.
/// The handle is released exactly once, before the sequence yields its
/// result or error, or when the sequence is cancelled or dropped.
pub fn run(handle: ConnectionHandle, query: Query) -> QuerySequence {
    QuerySequence {
        inner: Inner::Started(SingleShot::new(submit_and_release(handle, query))),
    }
}

/// Execute a query on a borrowed handle, which is not released.
pub fn execute<'a>(handle: &'a mut ConnectionHandle, query: &'a Query) -> SingleShot<'a, QueryResult> {
    SingleShot::new(async move {
        tracing::debug!(handle = handle.id(), %query, "executing query");
        handle.connection()?.submit(query).await
    })
}

async fn submit_and_release(mut handle: ConnectionHandle, query: Query) -> Result<QueryResult, Error> {
    tracing::debug!(handle = handle.id(), %query, "submitting query");

    let result = match handle.connection() {
        Ok(conn) => conn.submit(&query).await,
        Err(err) => Err(err),
    };
    handle.release();

    if let Err(err) = &result {
        tracing::debug!(%err, %query, "query failed");
    }
    result
}

/// QuerySequence is a Stream which yields the QueryResult of a single query,
/// or its Error, and then ends.
///
/// A QuerySequence built by a Database is deferred: it holds its Query and
/// acquires a connection only once polled. A deferred sequence which is given
/// to a transaction is instead bound to the transaction's own connection.
pub struct QuerySequence {
    inner: Inner,
}

enum Inner {
    Deferred(Query, Arc<dyn ConnectionProvider>),
    Started(SingleShot<'static, QueryResult>),
}

impl QuerySequence {
    pub(crate) fn deferred(query: Query, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            inner: Inner::Deferred(query, provider),
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            inner: Inner::Started(SingleShot::failed(err)),
        }
    }

    /// Take the Query of a deferred sequence, which hasn't acquired a connection.
    /// Sequences which have already started are returned as Err.
    pub fn into_query(self) -> Result<Query, Self> {
        match self.inner {
            Inner::Deferred(query, _) => Ok(query),
            inner => Err(Self { inner }),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.inner, Inner::Deferred(..))
    }

    /// Cancel this sequence. A started query is cancelled and its
    /// connection released, and nothing further is yielded.
    pub fn cancel(&mut self) -> bool {
        match &mut self.inner {
            Inner::Deferred(..) => {
                self.inner = Inner::Started(SingleShot::cancelled());
                true
            }
            Inner::Started(shot) => shot.cancel(),
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.inner {
            Inner::Deferred(..) => Phase::Pending,
            Inner::Started(shot) => shot.phase(),
        }
    }
}

impl Stream for QuerySequence {
    type Item = Result<QueryResult, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.inner {
                Inner::Started(shot) => return shot.poll_next_unpin(cx),
                Inner::Deferred(query, provider) => {
                    let (query, provider) = (query.clone(), provider.clone());

                    this.inner = Inner::Started(SingleShot::new(async move {
                        let handle = provider.acquire().await?;
                        submit_and_release(handle, query).await
                    }));
                }
            }
        }
    }
}

impl FusedStream for QuerySequence {
    fn is_terminated(&self) -> bool {
        match &self.inner {
            Inner::Deferred(..) => false,
            Inner::Started(shot) => shot.is_terminated(),
        }
    }
}

impl std::fmt::Debug for QuerySequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Deferred(query, _) => f.debug_tuple("Deferred").field(query).finish(),
            Inner::Started(shot) => f.debug_tuple("Started").field(&shot.phase()).finish(),
        }
    }
}
