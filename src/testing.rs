//! Stub collaborators for tests and local tooling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    Error, Result,
    pipeline::{AccessFilter, AuthorizationContext, Authorizer},
    projector::EntityDescriptor,
    query::Predicate,
    search::{IndexKind, SearchAdmin, SearchCommand, SearchIndexStatus, SearchReply},
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Build {
    Running,
    Ready,
    Failed,
}

#[derive(Default)]
struct AdminState {
    /// `(collection, name)` → kind and build phase.
    indexes: BTreeMap<(String, String), (IndexKind, Build)>,
    commands: Vec<Value>,
    creates: usize,
    drops: usize,
    unavailable: bool,
    racing: Vec<String>,
}

/// In-memory search subsystem that counts the commands it receives.
///
/// New indexes report `queryable: false` until [`Self::finish_builds`].
#[derive(Clone, Default)]
pub struct CountingSearchAdmin {
    state: Arc<Mutex<AdminState>>,
}

impl CountingSearchAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AdminState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pretend `name` already exists and is built.
    pub fn with_existing(self, collection: &str, name: &str, kind: IndexKind) -> Self {
        self.state()
            .indexes
            .insert((collection.to_string(), name.to_string()), (kind, Build::Ready));
        self
    }

    /// Pretend a build of `name` was started and then failed, leaving an
    /// unusable index behind.
    pub fn with_failed(self, collection: &str, name: &str, kind: IndexKind) -> Self {
        self.state()
            .indexes
            .insert((collection.to_string(), name.to_string()), (kind, Build::Failed));
        self
    }

    /// Reject every creation as a store tier without search support.
    pub fn unavailable(self) -> Self {
        self.state().unavailable = true;
        self
    }

    /// Report `name` as missing when listed but existing when created,
    /// as when another instance provisions it in between.
    pub fn racing_on(self, name: &str) -> Self {
        self.state().racing.push(name.to_string());
        self
    }

    pub fn create_calls(&self) -> usize {
        self.state().creates
    }

    pub fn drop_calls(&self) -> usize {
        self.state().drops
    }

    /// Every command received, as its command document.
    pub fn commands(&self) -> Vec<Value> {
        self.state().commands.clone()
    }

    pub fn finish_builds(&self) {
        for (_, build) in self.state().indexes.values_mut() {
            if *build == Build::Running {
                *build = Build::Ready;
            }
        }
    }
}

#[async_trait]
impl SearchAdmin for CountingSearchAdmin {
    async fn execute(&self, command: &SearchCommand) -> Result<SearchReply> {
        let mut state = self.state();
        state.commands.push(command.to_document());
        match command {
            SearchCommand::Create {
                collection,
                definitions,
                ..
            } => {
                state.creates += 1;
                if state.unavailable {
                    return Err(Error::SearchUnavailable {
                        command: command.name().to_string(),
                        detail: "command not supported by this store tier".to_string(),
                    });
                }
                let mut names = Vec::new();
                for def in definitions {
                    let key = (collection.clone(), def.name.clone());
                    let settled = state
                        .indexes
                        .get(&key)
                        .is_some_and(|(_, build)| *build != Build::Failed);
                    if state.racing.contains(&def.name) || settled {
                        return Err(Error::IndexAlreadyExists {
                            name: def.name.clone(),
                        });
                    }
                    state.indexes.insert(key, (def.kind, Build::Running));
                    names.push(def.name.clone());
                }
                Ok(SearchReply::Created(names))
            }
            SearchCommand::List { collection, name } => Ok(SearchReply::Listed(
                state
                    .indexes
                    .iter()
                    .filter(|((c, n), _)| c == collection && name.as_ref().is_none_or(|want| want == n))
                    .map(|((_, n), (kind, build))| SearchIndexStatus {
                        name: n.clone(),
                        kind: *kind,
                        queryable: *build == Build::Ready,
                        needs_rebuild: *build == Build::Failed,
                    })
                    .collect(),
            )),
            SearchCommand::Drop { collection, name } => {
                state.drops += 1;
                state.indexes.remove(&(collection.clone(), name.clone()));
                Ok(SearchReply::Dropped)
            }
        }
    }
}

/// Authorizer with a fixed answer. Permissions are checked against the
/// caller's granted set.
pub struct StaticAuthorizer {
    access: AccessFilter,
}

impl StaticAuthorizer {
    pub fn new(access: AccessFilter) -> Self {
        Self { access }
    }

    pub fn allow_all() -> Self {
        Self::new(AccessFilter::AllowAll)
    }

    pub fn restrict(predicate: Predicate) -> Self {
        Self::new(AccessFilter::Restrict(predicate))
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, ctx: &AuthorizationContext, permission: &str) -> Result<bool> {
        Ok(ctx.has(permission))
    }

    async fn build_filter_for(
        &self,
        _entity: &EntityDescriptor,
        _ctx: &AuthorizationContext,
    ) -> Result<AccessFilter> {
        Ok(self.access.clone())
    }
}

/// Counts calls made to an inner authorizer.
pub struct RecordingAuthorizer {
    inner: Arc<dyn Authorizer>,
    authorize_calls: AtomicUsize,
    filter_calls: AtomicUsize,
}

impl RecordingAuthorizer {
    pub fn new(inner: Arc<dyn Authorizer>) -> Self {
        Self {
            inner,
            authorize_calls: AtomicUsize::new(0),
            filter_calls: AtomicUsize::new(0),
        }
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn filter_calls(&self) -> usize {
        self.filter_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for RecordingAuthorizer {
    async fn authorize(&self, ctx: &AuthorizationContext, permission: &str) -> Result<bool> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.authorize(ctx, permission).await
    }

    async fn build_filter_for(
        &self,
        entity: &EntityDescriptor,
        ctx: &AuthorizationContext,
    ) -> Result<AccessFilter> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.build_filter_for(entity, ctx).await
    }
}
