use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Error, Result, session::SessionHandle};

/// Source of the session a call should join, if any.
pub trait SessionProvider {
    fn current_session(&self) -> Option<&SessionHandle>;
}

/// Cancellation and deadline handed down to every driver call.
#[derive(Clone, Debug, Default)]
pub struct CallSignal {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallSignal {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut`, giving up early when the token fires or the deadline passes.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(Error::DeadlineExceeded);
                }
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(Error::DeadlineExceeded),
                    out = fut => out,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Error::Cancelled),
                    out = fut => out,
                }
            }
        }
    }
}

/// Per-request state threaded explicitly through every collection call.
///
/// Nothing here is global: two requests holding different contexts can never
/// observe each other's session.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub session: Option<SessionHandle>,
    pub signal: CallSignal,
    pub correlation_id: Option<Uuid>,
    pub caller: Option<String>,
}

impl RequestContext {
    pub fn builder() -> RequestContextBuilder {
        RequestContextBuilder::default()
    }

    /// A context without a session, for background and startup work.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn signal(&self) -> &CallSignal {
        &self.signal
    }

    /// Same request, joined to `session`.
    pub fn with_session(&self, session: SessionHandle) -> Self {
        Self {
            session: Some(session),
            ..self.clone()
        }
    }

    /// Same request, with no session.
    pub fn without_session(&self) -> Self {
        Self {
            session: None,
            ..self.clone()
        }
    }
}

impl SessionProvider for RequestContext {
    fn current_session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }
}

#[derive(Default)]
pub struct RequestContextBuilder {
    session: Option<SessionHandle>,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
    correlation_id: Option<Uuid>,
    caller: Option<String>,
}

impl RequestContextBuilder {
    pub fn session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn build(self) -> RequestContext {
        RequestContext {
            session: self.session,
            signal: CallSignal::new(self.cancel.unwrap_or_default(), self.deadline),
            correlation_id: self.correlation_id,
            caller: self.caller,
        }
    }
}
