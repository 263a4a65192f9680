use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid `{field}`: {reason}")]
    Validation { field: String, reason: String },
    #[error("search subsystem unavailable for `{command}`: {detail}")]
    SearchUnavailable { command: String, detail: String },
    #[error("index `{name}` already exists")]
    IndexAlreadyExists { name: String },
    #[error("index conflict on `{collection}`: {detail}")]
    IndexConflict { collection: String, detail: String },
    #[error("permission `{permission}` denied")]
    Forbidden { permission: String },
    #[error("session {session} has no open transaction")]
    SessionClosed { session: Uuid },
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Failures a caller may retry with backoff. Nothing in this crate retries on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Db(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Error::DeadlineExceeded => true,
            Error::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Deployment problems that must halt startup instead of being retried.
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Configuration(_) | Error::SearchUnavailable { .. } => true,
            Error::Context { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// SQLSTATE reported by Postgres, if this error came from the server.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            Error::Db(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            Error::Context { source, .. } => source.sql_state(),
            _ => None,
        }
    }
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_sees_through_context() {
        let err: Result<()> = Err(Error::DeadlineExceeded);
        let wrapped = err.context("loading pets").unwrap_err();
        assert!(wrapped.is_transient());
        assert!(!wrapped.is_configuration());

        let err: Result<()> = Err(Error::SearchUnavailable {
            command: "createSearchIndexes".into(),
            detail: "extension missing".into(),
        });
        let wrapped = err.context("provisioning").unwrap_err();
        assert!(wrapped.is_configuration());
        assert!(!wrapped.is_transient());
    }

    #[test]
    fn validation_is_local() {
        let err = Error::validation("pageSize", "must not be negative");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "invalid `pageSize`: must not be negative");
    }
}
