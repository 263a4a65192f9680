//! The raw collection surface every store driver implements.
//!
//! Each operation exists twice: a session-less form that runs in its own
//! implicit transaction, and a `*_in` form bound to an explicit
//! [`SessionHandle`]. Choosing between the two is left to
//! [`crate::ScopedCollection`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::{
    Result,
    context::CallSignal,
    query::{JsonPath, Predicate, SortSpec, Update},
    scoped::ScopedCollection,
    session::SessionHandle,
};

/// Documents cross the driver boundary untyped.
pub type Document = Value;

/// Field every stored document is keyed by.
pub const ID_FIELD: &str = "id";

/// Field carrying the sub-type discriminator written by [`CollectionDriver::of_type`].
pub const TYPE_FIELD: &str = "_t";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadConcern {
    #[default]
    Committed,
    /// Every read in the call sees one snapshot.
    Snapshot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteConcern {
    #[default]
    Durable,
    /// Acknowledge before the commit is flushed.
    Relaxed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    #[default]
    Primary,
    Replica,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSettings {
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
    pub read_preference: ReadPreference,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

/// Options shared by the find-and-modify family.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindAndModify {
    pub sort: Vec<SortSpec>,
    pub return_document: ReturnDocument,
    /// Insert the replacement when nothing matches. Only replacements honour it.
    pub upsert: bool,
}

impl FindAndModify {
    pub fn sort(mut self, spec: SortSpec) -> Self {
        self.sort.push(spec);
        self
    }

    pub fn return_after(mut self) -> Self {
        self.return_document = ReturnDocument::After;
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Uuid>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteModel {
    InsertOne { doc: Document },
    UpdateOne { filter: Predicate, update: Update },
    UpdateMany { filter: Predicate, update: Update },
    ReplaceOne { filter: Predicate, doc: Document, upsert: bool },
    DeleteOne { filter: Predicate },
    DeleteMany { filter: Predicate },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    pub upserted: Vec<Uuid>,
}

impl BulkWriteOutcome {
    pub(crate) fn absorb(&mut self, outcome: UpdateOutcome) {
        self.matched += outcome.matched;
        self.modified += outcome.modified;
        self.upserted.extend(outcome.upserted_id);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKey {
    Ascending,
    Descending,
    /// Full-text over every text key of the index.
    Text,
    /// Lower-cased, ordered for prefix and regex scans.
    CaseInsensitive,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexModel {
    pub name: Option<String>,
    pub keys: Vec<(JsonPath, IndexKey)>,
    pub unique: bool,
}

impl IndexModel {
    pub fn new() -> Self {
        Self {
            name: None,
            keys: Vec::new(),
            unique: false,
        }
    }

    pub fn key(mut self, path: impl Into<JsonPath>, key: IndexKey) -> Self {
        self.keys.push((path.into(), key));
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|(_, k)| *k == IndexKey::Text)
    }

    /// Explicit name, or `<collection>_<field>_<kind>...` derived from the keys.
    pub fn resolved_name(&self, collection: &str) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let mut out = collection.to_string();
        for (path, key) in &self.keys {
            out.push('_');
            out.push_str(&path.parts().join("_"));
            out.push_str(match key {
                IndexKey::Ascending => "_asc",
                IndexKey::Descending => "_desc",
                IndexKey::Text => "_text",
                IndexKey::CaseInsensitive => "_ci",
            });
        }
        out
    }
}

impl Default for IndexModel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub unique: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: i64,
    pub kind: ChangeKind,
    pub doc_id: Uuid,
    /// New document, or the removed one for deletes.
    pub doc: Document,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct WatchOptions {
    pub filter: Predicate,
    /// Resume after this change-log position instead of the current tail.
    pub start_after: Option<i64>,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            filter: Predicate::True,
            start_after: None,
            batch_size: 500,
            poll_interval: Duration::from_millis(250),
            channel_capacity: 1024,
        }
    }
}

/// Live feed of collection changes. Dropping it stops the poller.
pub struct ChangeStream {
    pub(crate) rx: mpsc::Receiver<ChangeEvent>,
    pub(crate) resume_after: i64,
}

impl ChangeStream {
    pub(crate) fn new(rx: mpsc::Receiver<ChangeEvent>, resume_after: i64) -> Self {
        Self { rx, resume_after }
    }

    /// Change-log position the stream started after.
    pub fn resume_after(&self) -> i64 {
        self.resume_after
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// The operation table: `name / session_name (args) -> output`.
///
/// Invokes `$callback!` with the full list so the driver trait, every driver
/// and the ambient wrapper are generated from the same rows.
macro_rules! collection_operations {
    ($callback:ident) => {
        $callback! {
            find / find_in (spec: &$crate::query::FindSpec) -> Vec<$crate::driver::Document>;
            find_one / find_one_in (spec: &$crate::query::FindSpec) -> Option<$crate::driver::Document>;
            count / count_in (filter: &$crate::query::Predicate) -> u64;
            distinct / distinct_in (field: &$crate::query::JsonPath, filter: &$crate::query::Predicate) -> Vec<serde_json::Value>;
            aggregate / aggregate_in (aggregation: &$crate::query::Aggregation) -> Vec<$crate::driver::Document>;
            map_reduce / map_reduce_in (spec: &$crate::query::MapReduce) -> Vec<$crate::driver::Document>;
            insert_one / insert_one_in (doc: $crate::driver::Document) -> uuid::Uuid;
            insert_many / insert_many_in (docs: Vec<$crate::driver::Document>) -> Vec<uuid::Uuid>;
            replace_one / replace_one_in (filter: &$crate::query::Predicate, doc: $crate::driver::Document, upsert: bool) -> $crate::driver::UpdateOutcome;
            update_one / update_one_in (filter: &$crate::query::Predicate, update: &$crate::query::Update) -> $crate::driver::UpdateOutcome;
            update_many / update_many_in (filter: &$crate::query::Predicate, update: &$crate::query::Update) -> $crate::driver::UpdateOutcome;
            delete_one / delete_one_in (filter: &$crate::query::Predicate) -> u64;
            delete_many / delete_many_in (filter: &$crate::query::Predicate) -> u64;
            bulk_write / bulk_write_in (models: Vec<$crate::driver::WriteModel>) -> $crate::driver::BulkWriteOutcome;
            find_one_and_update / find_one_and_update_in (filter: &$crate::query::Predicate, update: &$crate::query::Update, options: &$crate::driver::FindAndModify) -> Option<$crate::driver::Document>;
            find_one_and_replace / find_one_and_replace_in (filter: &$crate::query::Predicate, doc: $crate::driver::Document, options: &$crate::driver::FindAndModify) -> Option<$crate::driver::Document>;
            find_one_and_delete / find_one_and_delete_in (filter: &$crate::query::Predicate, options: &$crate::driver::FindAndModify) -> Option<$crate::driver::Document>;
            watch / watch_in (options: &$crate::driver::WatchOptions) -> $crate::driver::ChangeStream;
            create_index / create_index_in (model: &$crate::driver::IndexModel) -> String;
            create_indexes / create_indexes_in (models: &[$crate::driver::IndexModel]) -> Vec<String>;
            list_indexes / list_indexes_in () -> Vec<$crate::driver::IndexInfo>;
            drop_index / drop_index_in (name: &str) -> ();
            drop_indexes / drop_indexes_in () -> ();
        }
    };
}
pub(crate) use collection_operations;

macro_rules! declare_driver {
    ($( $op:ident / $op_in:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty ; )*) => {
        /// Session-less and session-bound forms of every collection operation.
        ///
        /// Implementations run every store call through the [`CallSignal`]
        /// they are handed and never swallow store errors.
        #[async_trait]
        pub trait CollectionDriver: Send + Sync + 'static {
            /// Collection name as registered with the store.
            fn namespace(&self) -> &str;

            fn settings(&self) -> CollectionSettings;

            /// Same collection, new settings. The receiver is left unchanged.
            fn with_settings(&self, settings: CollectionSettings) -> Arc<dyn CollectionDriver>;

            /// View of the documents carrying `discriminator` in [`TYPE_FIELD`].
            /// Reads filter on it and inserts stamp it.
            fn of_type(&self, discriminator: &str) -> Arc<dyn CollectionDriver>;

            /// Fast approximate count. Never joins a session.
            async fn estimated_count(&self, signal: &CallSignal) -> Result<u64>;

            $(
                async fn $op(&self, signal: &CallSignal, $($arg: $ty),*) -> Result<$ret>;

                async fn $op_in(
                    &self,
                    session: &SessionHandle,
                    signal: &CallSignal,
                    $($arg: $ty),*
                ) -> Result<$ret>;
            )*
        }
    };
}

collection_operations!(declare_driver);

/// Document types stored under a sub-type discriminator.
pub trait Discriminated {
    const DISCRIMINATOR: &'static str;
}

/// Anything that hands out raw drivers by collection name.
pub trait CollectionSource: Send + Sync {
    /// Raw driver for `collection`. Fails with [`crate::Error::Configuration`]
    /// when the collection was never registered.
    fn driver(&self, collection: &str) -> Result<Arc<dyn CollectionDriver>>;

    /// Typed, session-aware view of `collection`.
    fn collection<T>(&self, collection: &str) -> Result<ScopedCollection<T>>
    where
        Self: Sized,
    {
        Ok(ScopedCollection::new(self.driver(collection)?))
    }
}

/// Predicate restricted to one discriminator, or unchanged when there is none.
pub(crate) fn scoped_filter(discriminator: Option<&str>, filter: &Predicate) -> Predicate {
    match discriminator {
        Some(d) => Predicate::eq(TYPE_FIELD, d).and_also(filter.clone()),
        None => filter.clone(),
    }
}

/// Take the document id from `doc`, assigning a fresh one when absent.
/// Stamps the discriminator when one is given.
pub(crate) fn prepare_insert(doc: &mut Document, discriminator: Option<&str>) -> Result<Uuid> {
    let map = doc
        .as_object_mut()
        .ok_or_else(|| crate::Error::validation("document", "must be a JSON object"))?;
    let id = match map.get(ID_FIELD) {
        Some(Value::String(raw)) => Uuid::parse_str(raw)
            .map_err(|e| crate::Error::validation(ID_FIELD, e.to_string()))?,
        Some(Value::Null) | None => {
            let id = Uuid::new_v4();
            map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            id
        }
        Some(_) => return Err(crate::Error::validation(ID_FIELD, "must be a UUID string")),
    };
    if let Some(d) = discriminator {
        map.insert(TYPE_FIELD.to_string(), Value::String(d.to_string()));
    }
    Ok(id)
}

/// Keep the stored id on a replacement document.
pub(crate) fn prepare_replacement(
    doc: &mut Document,
    id: Uuid,
    discriminator: Option<&str>,
) -> Result<()> {
    let map = doc
        .as_object_mut()
        .ok_or_else(|| crate::Error::validation("document", "must be a JSON object"))?;
    map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    if let Some(d) = discriminator {
        map.insert(TYPE_FIELD.to_string(), Value::String(d.to_string()));
    }
    Ok(())
}
