use crate::{ConnectionHandle, Error, Query, Row};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{FutureExt, SinkExt, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamOptions {
    /// Number of rows which may be read ahead of the consumer.
    pub batch_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamPhase {
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

/// Stream the rows of a query over a connection handle, which the
/// returned sequence takes ownership of.
pub fn stream(handle: ConnectionHandle, query: Query, options: StreamOptions) -> RowSequence {
    RowSequence::new(options, move |tx| pump(handle, query, tx))
}

/// RowSequence is a Stream of the rows of a streaming query.
///
/// Rows are yielded in arrival order, followed by either the end of the
/// stream or a single Error (never both). The cursor's connection is released
/// exactly once, as the cursor finishes and before its terminal signal is
/// observed. Cancelling or dropping the sequence before then closes the
/// cursor and releases the connection as well.
///
/// Releasing ahead of the terminal signal is intended: a consumer which
/// reacts to the end of a stream may immediately reacquire the connection
/// from a single-connection provider.
pub struct RowSequence {
    rows: mpsc::Receiver<Row>,
    // Drives the cursor, sending rows into `rows`. None once finished.
    cursor: Option<BoxFuture<'static, Result<(), Error>>>,
    // Terminal outcome of the cursor, held until buffered rows are yielded.
    outcome: Option<Result<(), Error>>,
    phase: StreamPhase,
}

impl RowSequence {
    pub(crate) fn new<F, Fut>(options: StreamOptions, cursor: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Row>) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        // mpsc capacity is the buffer plus one slot for the (single) sender.
        let (tx, rx) = mpsc::channel(options.batch_size.saturating_sub(1));

        Self {
            rows: rx,
            cursor: Some(cursor(tx).boxed()),
            outcome: None,
            phase: StreamPhase::Streaming,
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self::new(StreamOptions::default(), move |_tx| {
            futures::future::ready(Err(err))
        })
    }

    /// Cancel the stream, closing its cursor and releasing its connection.
    /// Returns true if this call cancelled it.
    pub fn cancel(&mut self) -> bool {
        if self.phase != StreamPhase::Streaming {
            return false;
        }
        self.cursor = None;
        self.outcome = None;
        self.rows.close();
        self.phase = StreamPhase::Cancelled;
        true
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    fn finish(&mut self) -> Option<Result<Row, Error>> {
        match self.outcome.take() {
            Some(Ok(())) => {
                self.phase = StreamPhase::Completed;
                None
            }
            Some(Err(err)) => {
                self.phase = StreamPhase::Errored;
                Some(Err(err))
            }
            None => None,
        }
    }
}

impl Stream for RowSequence {
    type Item = Result<Row, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.phase != StreamPhase::Streaming {
            return Poll::Ready(None);
        }

        loop {
            // Yield rows which were already read before anything else.
            match this.rows.poll_next_unpin(cx) {
                Poll::Ready(Some(row)) => return Poll::Ready(Some(Ok(row))),
                Poll::Ready(None) if this.cursor.is_none() => return Poll::Ready(this.finish()),
                Poll::Ready(None) | Poll::Pending => (),
            }

            let Some(cursor) = this.cursor.as_mut() else {
                return Poll::Pending;
            };
            match cursor.as_mut().poll(cx) {
                Poll::Ready(outcome) => {
                    // Dropping the finished cursor drops its sender,
                    // and we loop to drain remaining rows.
                    this.cursor = None;
                    this.outcome = Some(outcome);
                }
                // The cursor may have sent rows before blocking.
                Poll::Pending => {
                    return match this.rows.poll_next_unpin(cx) {
                        Poll::Ready(Some(row)) => Poll::Ready(Some(Ok(row))),
                        _ => Poll::Pending,
                    };
                }
            }
        }
    }
}

impl FusedStream for RowSequence {
    fn is_terminated(&self) -> bool {
        self.phase != StreamPhase::Streaming
    }
}

/// Forward rows of the query into `tx`, and release the handle once
/// the cursor is finished. This is the single release point of a stream.
pub(crate) async fn pump(
    mut handle: ConnectionHandle,
    query: Query,
    mut tx: mpsc::Sender<Row>,
) -> Result<(), Error> {
    tracing::debug!(handle = handle.id(), %query, "opening cursor");

    let outcome = forward(&mut handle, &query, &mut tx).await;
    handle.release();

    match &outcome {
        Ok(rows) => tracing::debug!(rows, %query, "cursor finished"),
        Err(err) => tracing::debug!(%err, %query, "cursor failed"),
    }
    outcome.map(|_rows| ())
}

async fn forward(
    handle: &mut ConnectionHandle,
    query: &Query,
    tx: &mut mpsc::Sender<Row>,
) -> Result<usize, Error> {
    let mut cursor = handle.connection()?.open_cursor(query);
    let mut count = 0;

    while let Some(row) = cursor.try_next().await? {
        if tx.send(row).await.is_err() {
            break; // Receiver was closed.
        }
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::FakeProvider;
    use serde_json::json;

    fn rows_of(provider: &FakeProvider, sql: &str, batch_size: usize) -> RowSequence {
        stream(
            provider.handle(),
            Query::new(sql).unwrap(),
            StreamOptions { batch_size },
        )
    }

    #[tokio::test]
    async fn test_single_row_then_completion() {
        let provider = FakeProvider::default();
        let mut rows = rows_of(&provider, "SELECT 9 AS count", 100);

        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row["count"], json!(9));

        assert!(rows.next().await.is_none());
        assert_eq!(rows.phase(), StreamPhase::Completed);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn test_missing_relation_errors_without_completion() {
        let provider = FakeProvider::default();
        let mut rows = rows_of(&provider, "SELECT * FROM not_a_table", 100);

        let err = rows.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), r#"relation "not_a_table" does not exist"#);
        assert_eq!(rows.phase(), StreamPhase::Errored);
        assert_eq!(provider.releases(), 1);

        assert!(rows.next().await.is_none());
        assert_eq!(rows.phase(), StreamPhase::Errored);
    }

    #[tokio::test]
    async fn test_rows_preserve_order_with_small_batches() {
        for batch_size in [0, 1, 3, 100] {
            let provider = FakeProvider::default();
            let rows: Vec<i64> = rows_of(&provider, "SELECT n FROM generate_series(1, 25) n", batch_size)
                .map(|row| row.unwrap()["n"].as_i64().unwrap())
                .collect()
                .await;

            assert_eq!(rows, (1..=25).collect::<Vec<_>>());
            assert_eq!(provider.releases(), 1);
        }
    }

    #[tokio::test]
    async fn test_rows_then_error() {
        let provider = FakeProvider::default();
        let mut rows = rows_of(&provider, "SELECT n FROM broken_series(3) n", 100);

        let mut seen = Vec::new();
        let err = loop {
            match rows.next().await.unwrap() {
                Ok(row) => seen.push(row["n"].clone()),
                Err(err) => break err,
            }
        };
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(err.to_string(), "division by zero");
        assert!(rows.next().await.is_none());
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_releases_once() {
        let provider = FakeProvider::default();
        let mut rows = rows_of(&provider, "SELECT n FROM generate_series(1, 1000) n", 2);

        assert_eq!(rows.next().await.unwrap().unwrap()["n"], json!(1));
        assert_eq!(provider.releases(), 0);

        assert!(rows.cancel());
        assert_eq!(provider.releases(), 1);
        assert_eq!(rows.phase(), StreamPhase::Cancelled);
        assert!(rows.next().await.is_none());
        assert!(!rows.cancel());

        std::mem::drop(rows);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn test_drop_of_stalled_cursor_releases() {
        let provider = FakeProvider::default();
        let mut rows = rows_of(&provider, "SELECT pg_sleep(60)", 100);

        assert!(futures::poll!(rows.next()).is_pending());
        std::mem::drop(rows);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn test_failed_stream() {
        let mut rows = RowSequence::failed(Error::Connection("refused".to_string()));
        assert!(matches!(rows.next().await, Some(Err(Error::Connection(_)))));
        assert!(rows.next().await.is_none());
    }
}
