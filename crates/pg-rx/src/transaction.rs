use crate::error::TransactionError;
use crate::query::{self, QuerySequence};
use crate::sequence::SingleShot;
use crate::{ConnectionHandle, Error, Query, QueryResult};
use futures::{Stream, TryStreamExt};
use std::collections::VecDeque;

/// TransactionSequence yields the result of a committed transaction,
/// or the TransactionError of one which was rolled back.
pub type TransactionSequence = SingleShot<'static, QueryResult>;

/// Step is a unit of work within a transaction.
pub enum Step {
    /// A statement executed on the transaction's connection.
    Literal(String),
    /// A query sequence. Deferred sequences are bound to the transaction's
    /// connection. Started sequences are subscribed to as they are, and must
    /// not be waiting on the transaction's own dedicated connection.
    Prebuilt(QuerySequence),
    /// A function of the previous step's result, returning the step to run.
    /// It must not return Noop.
    Continuation(Box<dyn FnOnce(&QueryResult) -> Step + Send>),
    /// Nothing is run, and the previous result is carried forward.
    Noop,
}

impl Step {
    pub fn continuation<F>(f: F) -> Self
    where
        F: FnOnce(&QueryResult) -> Step + Send + 'static,
    {
        Step::Continuation(Box::new(f))
    }
}

impl From<&str> for Step {
    fn from(text: &str) -> Self {
        Step::Literal(text.to_string())
    }
}

impl From<String> for Step {
    fn from(text: String) -> Self {
        Step::Literal(text)
    }
}

impl From<QuerySequence> for Step {
    fn from(seq: QuerySequence) -> Self {
        Step::Prebuilt(seq)
    }
}

impl<S: Into<Step>> From<Option<S>> for Step {
    fn from(step: Option<S>) -> Self {
        step.map(Into::into).unwrap_or(Step::Noop)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            Step::Prebuilt(seq) => f.debug_tuple("Prebuilt").field(seq).finish(),
            Step::Continuation(_) => f.write_str("Continuation"),
            Step::Noop => f.write_str("Noop"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Running(usize),
    Committed,
    RolledBack,
}

/// TransactionState runs a bracketed list of steps,
/// `[BEGIN, ...steps, COMMIT]`, over a single connection.
///
/// Steps run strictly in order: a step starts only after the previous
/// step yielded its first result. Only that first result is threaded to
/// the next step and recorded as the transaction's last response.
/// If any step fails, a ROLLBACK is issued and the failing step's error
/// is returned.
pub struct TransactionState {
    steps: VecDeque<Step>,
    // Index of the next step to run.
    cursor: usize,
    // Index of the closing COMMIT.
    commit: usize,
    last_response: Option<QueryResult>,
    phase: Phase,
}

enum Action {
    Execute(Query),
    Subscribe(QuerySequence),
    Skip,
}

impl TransactionState {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let mut bracketed = VecDeque::from([Step::Literal("BEGIN".to_string())]);
        bracketed.extend(steps);
        bracketed.push_back(Step::Literal("COMMIT".to_string()));

        Self {
            commit: bracketed.len() - 1,
            steps: bracketed,
            cursor: 0,
            last_response: None,
            phase: Phase::NotStarted,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Result of the most recent step which ran before COMMIT.
    pub fn last_response(&self) -> Option<&QueryResult> {
        self.last_response.as_ref()
    }

    /// Run all steps on `handle`. On success, the result of the last step
    /// before COMMIT is returned. On failure the transaction is rolled back
    /// and an Error::Transaction wrapping the failing step's error is returned.
    ///
    /// The handle is marked as being within a transaction until COMMIT or
    /// ROLLBACK completes. If this future is dropped before then, the open
    /// transaction is rolled back when the handle is released, or by the
    /// next transaction run on the handle.
    pub async fn run(&mut self, handle: &mut ConnectionHandle) -> Result<QueryResult, Error> {
        if self.phase != Phase::NotStarted {
            return Err(Error::InvalidStep {
                index: self.cursor,
                reason: format!("transaction cannot be run again once {:?}", self.phase),
            });
        }
        if handle.in_transaction() {
            tracing::debug!(handle = handle.id(), "rolling back abandoned transaction");
            rollback(handle).await?;
            handle.set_in_transaction(false);
        }
        handle.set_in_transaction(true);

        match self.run_steps(handle).await {
            Ok(()) => {
                handle.set_in_transaction(false);
                self.phase = Phase::Committed;
                tracing::debug!(handle = handle.id(), steps = self.cursor, "committed transaction");
                Ok(self.last_response.take().unwrap_or_default())
            }
            Err(cause) => {
                self.last_response = None;
                self.steps.clear();

                let rollback = match rollback(handle).await {
                    Ok(()) => {
                        handle.set_in_transaction(false);
                        None
                    }
                    Err(err) => {
                        tracing::warn!(%err, %cause, "failed to roll back transaction");
                        Some(err)
                    }
                };
                self.phase = Phase::RolledBack;
                tracing::debug!(handle = handle.id(), step = self.cursor, %cause, "rolled back transaction");

                Err(Error::Transaction(Box::new(TransactionError { cause, rollback })))
            }
        }
    }

    async fn run_steps(&mut self, handle: &mut ConnectionHandle) -> Result<(), Error> {
        while let Some(step) = self.steps.pop_front() {
            let index = self.cursor;
            self.phase = Phase::Running(index);

            let action = {
                let empty = QueryResult::default();
                let previous = self.last_response.as_ref().unwrap_or(&empty);
                resolve(index, step, previous)?
            };

            let result = match action {
                Action::Execute(query) => first(query::execute(handle, &query)).await?,
                Action::Subscribe(seq) => first(seq).await?,
                Action::Skip => None,
            };
            tracing::debug!(index, produced = result.is_some(), "completed transaction step");

            if let (Some(result), true) = (result, index < self.commit) {
                self.last_response = Some(result);
            }
            self.cursor += 1;
        }
        Ok(())
    }
}

/// Resolve a Step into the Action which runs it, invoking continuations
/// with the previous result until a concrete step is reached.
fn resolve(index: usize, mut step: Step, previous: &QueryResult) -> Result<Action, Error> {
    let mut continued = false;

    loop {
        match step {
            Step::Literal(text) => {
                return Query::new(text).map(Action::Execute).map_err(|err| Error::InvalidStep {
                    index,
                    reason: err.to_string(),
                })
            }
            Step::Prebuilt(seq) => {
                return Ok(match seq.into_query() {
                    Ok(query) => Action::Execute(query),
                    Err(seq) => Action::Subscribe(seq),
                })
            }
            Step::Continuation(f) => {
                step = f(previous);
                continued = true;
            }
            Step::Noop if continued => {
                return Err(Error::InvalidStep {
                    index,
                    reason: "continuation did not return a statement or query".to_string(),
                })
            }
            Step::Noop => return Ok(Action::Skip),
        }
    }
}

// Take the first result of a step, dropping (and thus cancelling) the rest.
async fn first<S>(mut seq: S) -> Result<Option<QueryResult>, Error>
where
    S: Stream<Item = Result<QueryResult, Error>> + Unpin,
{
    seq.try_next().await
}

async fn rollback(handle: &mut ConnectionHandle) -> Result<(), Error> {
    let query = Query::fixed("ROLLBACK");
    query::execute(handle, &query).try_next().await?;
    Ok(())
}
