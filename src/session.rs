use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::{Error, Result};

pub(crate) type PgTransaction = Transaction<'static, Postgres>;

/// Opaque handle to one logical unit of work.
///
/// A handle is begun, committed and aborted by whoever owns the request
/// (see [`crate::Store::begin_session`]). Collections only borrow the
/// transaction behind it for the duration of a single driver call.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    started_at: DateTime<Utc>,
    detached: bool,
    tx: Mutex<Option<PgTransaction>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("started_at", &self.inner.started_at)
            .field("detached", &self.inner.detached)
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn from_transaction(tx: PgTransaction) -> Self {
        Self::build(Some(tx), false)
    }

    /// A session without a backing transaction, for in-memory stores.
    pub fn detached() -> Self {
        Self::build(None, true)
    }

    fn build(tx: Option<PgTransaction>, detached: bool) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
                detached,
                tx: Mutex::new(tx),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached
    }

    /// True when both handles refer to the same unit of work.
    pub fn same_as(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Lock the transaction for one statement sequence. Calls on the same
    /// session are serialised here, which keeps writes ordered as issued.
    pub(crate) async fn transaction(&self) -> MutexGuard<'_, Option<PgTransaction>> {
        self.inner.tx.lock().await
    }

    pub async fn commit(&self) -> Result<()> {
        let tx = self.inner.tx.lock().await.take();
        match tx {
            Some(tx) => {
                tx.commit().await?;
                tracing::debug!(target: "kennel::session", session = %self.id(), "session committed");
                Ok(())
            }
            None if self.inner.detached => Ok(()),
            None => Err(Error::SessionClosed { session: self.id() }),
        }
    }

    pub async fn abort(&self) -> Result<()> {
        let tx = self.inner.tx.lock().await.take();
        match tx {
            Some(tx) => {
                tx.rollback().await?;
                tracing::debug!(target: "kennel::session", session = %self.id(), "session rolled back");
                Ok(())
            }
            None if self.inner.detached => Ok(()),
            None => Err(Error::SessionClosed { session: self.id() }),
        }
    }
}
