//! Session-aware collection wrapper.
//!
//! [`ScopedCollection`] re-exposes the whole [`CollectionDriver`] surface. Every
//! ambient method takes the caller's [`RequestContext`]: when the context
//! carries a session the session-bound `*_in` driver call runs with exactly that
//! handle, otherwise the session-less call runs. The context's [`CallSignal`]
//! is handed to the driver untouched. The `*_in` methods pass an explicit
//! session straight through.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    Result,
    context::{CallSignal, RequestContext, SessionProvider},
    driver::{
        CollectionDriver, CollectionSettings, Discriminated, ID_FIELD, ReadConcern,
        ReadPreference, WriteConcern, collection_operations,
    },
    metrics,
    query::{FindSpec, Predicate},
    session::SessionHandle,
};

/// Typed, session-aware handle on one collection.
///
/// Results are returned as produced by the driver; nothing is cached.
pub struct ScopedCollection<T> {
    inner: Arc<dyn CollectionDriver>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Clone for ScopedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _doc: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ScopedCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCollection")
            .field("namespace", &self.inner.namespace())
            .field("settings", &self.inner.settings())
            .finish()
    }
}

impl<T> ScopedCollection<T> {
    pub fn new(inner: Arc<dyn CollectionDriver>) -> Self {
        Self {
            inner,
            _doc: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    pub fn settings(&self) -> CollectionSettings {
        self.inner.settings()
    }

    /// New wrapper over the reconfigured driver. `self` keeps its settings.
    pub fn with_settings(&self, settings: CollectionSettings) -> Self {
        Self::new(self.inner.with_settings(settings))
    }

    pub fn with_read_concern(&self, read_concern: ReadConcern) -> Self {
        self.with_settings(CollectionSettings {
            read_concern,
            ..self.settings()
        })
    }

    pub fn with_write_concern(&self, write_concern: WriteConcern) -> Self {
        self.with_settings(CollectionSettings {
            write_concern,
            ..self.settings()
        })
    }

    pub fn with_read_preference(&self, read_preference: ReadPreference) -> Self {
        self.with_settings(CollectionSettings {
            read_preference,
            ..self.settings()
        })
    }

    /// The documents of sub-type `U`, still wrapped.
    pub fn of_type<U: Discriminated>(&self) -> ScopedCollection<U> {
        ScopedCollection::new(self.inner.of_type(U::DISCRIMINATOR))
    }

    /// Approximate size from planner statistics. Never joins a session.
    pub async fn estimated_count(&self, signal: &CallSignal) -> Result<u64> {
        self.inner.estimated_count(signal).await
    }
}

macro_rules! scoped_methods {
    ($( $op:ident / $op_in:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty ; )*) => {
        impl<T> ScopedCollection<T> {
            $(
                pub async fn $op(&self, ctx: &RequestContext, $($arg: $ty),*) -> Result<$ret> {
                    match ctx.current_session() {
                        Some(session) => {
                            metrics::record_dispatch(true);
                            tracing::trace!(
                                target: "kennel::scoped",
                                op = stringify!($op),
                                collection = self.inner.namespace(),
                                session = %session.id(),
                                "joining ambient session"
                            );
                            self.inner.$op_in(session, ctx.signal(), $($arg),*).await
                        }
                        None => {
                            metrics::record_dispatch(false);
                            tracing::trace!(
                                target: "kennel::scoped",
                                op = stringify!($op),
                                collection = self.inner.namespace(),
                                "no ambient session"
                            );
                            self.inner.$op(ctx.signal(), $($arg),*).await
                        }
                    }
                }

                pub async fn $op_in(
                    &self,
                    session: &SessionHandle,
                    signal: &CallSignal,
                    $($arg: $ty),*
                ) -> Result<$ret> {
                    self.inner.$op_in(session, signal, $($arg),*).await
                }
            )*
        }
    };
}

collection_operations!(scoped_methods);

impl<T: DeserializeOwned> ScopedCollection<T> {
    pub async fn load_many(&self, ctx: &RequestContext, spec: &FindSpec) -> Result<Vec<T>> {
        self.find(ctx, spec)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .collect()
    }

    pub async fn load_one(&self, ctx: &RequestContext, spec: &FindSpec) -> Result<Option<T>> {
        self.find_one(ctx, spec)
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .transpose()
    }

    pub async fn get(&self, ctx: &RequestContext, id: Uuid) -> Result<Option<T>> {
        let spec = FindSpec::new(Predicate::eq(ID_FIELD, id.to_string()));
        self.load_one(ctx, &spec).await
    }
}

impl<T: Serialize> ScopedCollection<T> {
    pub async fn store_one(&self, ctx: &RequestContext, doc: &T) -> Result<Uuid> {
        self.insert_one(ctx, serde_json::to_value(doc)?).await
    }

    pub async fn store_many(&self, ctx: &RequestContext, docs: &[T]) -> Result<Vec<Uuid>> {
        let docs = docs
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.insert_many(ctx, docs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCollection;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pet {
        name: String,
    }

    #[tokio::test]
    async fn typed_helpers_round_trip_through_the_driver() {
        let raw = MemoryCollection::new("pets");
        let pets: ScopedCollection<Pet> = ScopedCollection::new(Arc::new(raw.clone()));
        let ctx = RequestContext::detached();

        let id = pets
            .store_one(&ctx, &Pet {
                name: "Biscuit".into(),
            })
            .await
            .unwrap();
        let loaded = pets.get(&ctx, id).await.unwrap();
        assert_eq!(loaded.map(|p| p.name), Some("Biscuit".to_string()));
        assert_eq!(raw.documents()[0]["name"], json!("Biscuit"));
    }

    #[tokio::test]
    async fn settings_changes_leave_the_original_alone() {
        let pets: ScopedCollection<Pet> =
            ScopedCollection::new(Arc::new(MemoryCollection::new("pets")));
        let snapshot = pets.with_read_concern(ReadConcern::Snapshot);
        assert_eq!(snapshot.settings().read_concern, ReadConcern::Snapshot);
        assert_eq!(pets.settings().read_concern, ReadConcern::Committed);
        assert_eq!(snapshot.namespace(), "pets");
    }
}
