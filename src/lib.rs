//! Kennel: the document-store access layer of the adoption marketplace,
//! powered by Postgres.

pub mod context;
pub mod documents;
pub mod driver;
mod error;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod projector;
pub mod query;
pub mod schema;
pub mod scoped;
pub mod search;
pub mod session;
pub mod store;
pub mod testing;

pub use context::{CallSignal, RequestContext, SessionProvider};
pub use driver::{
    CollectionDriver, CollectionSettings, CollectionSource, Discriminated, Document,
    ReadConcern, ReadPreference, WriteConcern,
};
pub use error::{Error, Result, WithContext};
pub use memory::{MemoryCollection, MemoryStore};
pub use pipeline::{
    AccessFilter, AuthorizationContext, Authorizer, EntityQuery, FilterBuilder, QueryPipeline,
    QuerySpec,
};
pub use projector::{Entity, EntityDescriptor, FieldProjector, ProjectionSet};
pub use scoped::ScopedCollection;
pub use search::{IndexDefinition, SearchIndexManager, SynonymGroup};
pub use session::SessionHandle;
pub use store::Store;

pub mod prelude {
    pub use crate::{
        AccessFilter, AuthorizationContext, Authorizer, CollectionSource, Entity,
        EntityDescriptor, EntityQuery, FilterBuilder, QueryPipeline, QuerySpec, RequestContext,
        Result, ScopedCollection, SessionHandle, Store,
        query::{FindSpec, Predicate, SortSpec, Update},
    };
}
