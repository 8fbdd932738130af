#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Acquisition or mid-use failure of a database connection.
    #[error("connection error: {0}")]
    Connection(String),
    /// An error returned by the database for a statement.
    /// The server's message is preserved verbatim.
    #[error("{message}")]
    Query {
        message: String,
        code: Option<String>,
    },
    #[error("query text is missing or empty")]
    EmptyQuery,
    #[error("invalid query object: {0}")]
    InvalidQueryObject(String),
    #[error("invalid transaction step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },
    #[error("connection handle was already released")]
    Released,
    #[error(transparent)]
    Transaction(Box<TransactionError>),
}

/// TransactionError is the error observed by callers of a failed transaction.
/// It carries the error which failed the transaction, and the error of the
/// compensating ROLLBACK if that also failed. It displays as its cause.
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct TransactionError {
    pub cause: Error,
    pub rollback: Option<Error>,
}

impl Error {
    pub fn query(message: impl Into<String>) -> Self {
        Error::Query {
            message: message.into(),
            code: None,
        }
    }

    /// SQLSTATE code of a database error, if known.
    pub fn code(&self) -> Option<&str> {
        match self.cause() {
            Error::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// The error which originally caused this one.
    /// For a failed transaction, this is the failing step's error.
    pub fn cause(&self) -> &Error {
        match self {
            Error::Transaction(txn) => txn.cause.cause(),
            other => other,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            return Error::Query {
                message: db.message().to_string(),
                code: db.code().map(|code| code.into_owned()),
            };
        }
        if matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Configuration(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        ) {
            Error::Connection(err.to_string())
        } else {
            Error::query(err.to_string())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transaction_error_displays_its_cause() {
        let err = Error::Transaction(Box::new(TransactionError {
            cause: Error::Query {
                message: "syntax error at or near \"not\"".to_string(),
                code: Some("42601".to_string()),
            },
            rollback: Some(Error::Connection("connection reset".to_string())),
        }));

        assert_eq!(err.to_string(), "syntax error at or near \"not\"");
        assert_eq!(err.code(), Some("42601"));
        assert!(matches!(err.cause(), Error::Query { .. }));
    }

    #[test]
    fn test_pool_errors_are_connection_errors() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, Error::Connection(_)));

        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::Query { code: None, .. }));
    }
}
