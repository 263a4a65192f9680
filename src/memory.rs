//! In-process driver with the same query semantics as Postgres.
//!
//! Every call is logged as a [`Dispatch`] (operation plus the session it was
//! bound to), which is what the ambient-session tests assert on. Writes are
//! applied immediately; a session only tags the calls made under it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::{
    Error, Result,
    context::CallSignal,
    driver::{
        BulkWriteOutcome, ChangeEvent, ChangeKind, ChangeStream, CollectionDriver,
        CollectionSettings, CollectionSource, Document, FindAndModify, ID_FIELD, IndexInfo,
        IndexKey, IndexModel, ReturnDocument, UpdateOutcome, WatchOptions, WriteModel,
        collection_operations, prepare_insert, prepare_replacement, scoped_filter,
    },
    query::{
        Aggregation, FindSpec, JsonPath, MapReduce, Predicate, Update,
        eval::{self, apply_update, compare_documents, get_path, json_eq, matches},
    },
    session::SessionHandle,
};

/// One recorded driver call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub op: &'static str,
    pub session: Option<Uuid>,
}

impl Dispatch {
    pub fn in_session(&self) -> bool {
        self.session.is_some()
    }
}

struct Watcher {
    tx: mpsc::Sender<ChangeEvent>,
    filter: Predicate,
}

struct StoredIndex {
    info: IndexInfo,
    keys: Vec<IndexKey>,
}

impl StoredIndex {
    fn is_text(&self) -> bool {
        self.keys.contains(&IndexKey::Text)
    }
}

#[derive(Default)]
struct Inner {
    docs: Vec<(Uuid, Document)>,
    indexes: BTreeMap<String, StoredIndex>,
    changes: Vec<ChangeEvent>,
    watchers: Vec<Watcher>,
    dispatches: Vec<Dispatch>,
    finds: Vec<FindSpec>,
    filters: Vec<Predicate>,
    failures: Vec<&'static str>,
    latency: Option<Duration>,
}

struct MemoryState {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A collection held in memory.
#[derive(Clone)]
pub struct MemoryCollection {
    state: Arc<MemoryState>,
    settings: CollectionSettings,
    discriminator: Option<String>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(MemoryState {
                name: name.into(),
                inner: Mutex::new(Inner::default()),
            }),
            settings: CollectionSettings::default(),
            discriminator: None,
        }
    }

    /// Insert documents directly, without logging a dispatch.
    pub fn seed<I>(&self, docs: I) -> Result<Vec<Uuid>>
    where
        I: IntoIterator<Item = Document>,
    {
        let disc = self.discriminator.as_deref();
        let mut inner = self.state.lock();
        docs.into_iter().map(|doc| inner.insert(disc, doc)).collect()
    }

    /// Every document currently stored, in insertion order.
    pub fn documents(&self) -> Vec<Document> {
        self.state.lock().docs.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.state.lock().dispatches.clone()
    }

    pub fn clear_dispatches(&self) {
        let mut inner = self.state.lock();
        inner.dispatches.clear();
        inner.finds.clear();
        inner.filters.clear();
    }

    /// Last find specification received, with the discriminator applied.
    pub fn last_find(&self) -> Option<FindSpec> {
        self.state.lock().finds.last().cloned()
    }

    /// Last filter any operation evaluated, with the discriminator applied.
    pub fn last_filter(&self) -> Option<Predicate> {
        self.state.lock().filters.last().cloned()
    }

    /// Make the next call to `op` fail with a transient store error.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().failures.push(op);
    }

    /// Delay every call, so deadlines and cancellation can fire mid-flight.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    async fn dispatch(
        &self,
        op: &'static str,
        session: Option<&SessionHandle>,
        signal: &CallSignal,
    ) -> Result<()> {
        let latency = {
            let mut inner = self.state.lock();
            inner.dispatches.push(Dispatch {
                op,
                session: session.map(SessionHandle::id),
            });
            inner.latency
        };
        signal
            .guard(async {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                Ok(())
            })
            .await?;
        let mut inner = self.state.lock();
        if let Some(pos) = inner.failures.iter().position(|f| *f == op) {
            inner.failures.remove(pos);
            return Err(Error::Db(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

fn index_definition(model: &IndexModel) -> String {
    model
        .keys
        .iter()
        .map(|(path, key)| {
            let kind = match key {
                IndexKey::Ascending => "asc",
                IndexKey::Descending => "desc",
                IndexKey::Text => "text",
                IndexKey::CaseInsensitive => "ci",
            };
            format!("{} {kind}", path.dotted())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl Inner {
    fn positions(&mut self, disc: Option<&str>, filter: &Predicate) -> Result<Vec<usize>> {
        let filter = scoped_filter(disc, filter);
        let mut out = Vec::new();
        for (i, (_, doc)) in self.docs.iter().enumerate() {
            if matches(&filter, doc)? {
                out.push(i);
            }
        }
        self.filters.push(filter);
        Ok(out)
    }

    fn first_position(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        options: &FindAndModify,
    ) -> Result<Option<usize>> {
        let mut hits = self.positions(disc, filter)?;
        hits.sort_by(|a, b| compare_documents(&self.docs[*a].1, &self.docs[*b].1, &options.sort));
        Ok(hits.first().copied())
    }

    fn emit(&mut self, kind: ChangeKind, doc_id: Uuid, doc: Document) {
        let event = ChangeEvent {
            seq: self.changes.len() as i64 + 1,
            kind,
            doc_id,
            doc,
            at: Utc::now(),
        };
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if matches(&watcher.filter, &event.doc).unwrap_or(false) {
                let _ = watcher.tx.try_send(event.clone());
            }
        }
        self.changes.push(event);
    }

    fn insert(&mut self, disc: Option<&str>, mut doc: Document) -> Result<Uuid> {
        let id = prepare_insert(&mut doc, disc)?;
        if self.docs.iter().any(|(existing, _)| *existing == id) {
            return Err(Error::validation(ID_FIELD, format!("duplicate key {id}")));
        }
        self.docs.push((id, doc.clone()));
        self.emit(ChangeKind::Insert, id, doc);
        Ok(id)
    }

    fn replace_at(&mut self, pos: usize, disc: Option<&str>, mut doc: Document) -> Result<()> {
        let id = self.docs[pos].0;
        prepare_replacement(&mut doc, id, disc)?;
        self.docs[pos].1 = doc.clone();
        self.emit(ChangeKind::Update, id, doc);
        Ok(())
    }

    fn update_at(&mut self, pos: usize, update: &Update) {
        let (id, doc) = &mut self.docs[pos];
        apply_update(doc, update);
        let (id, doc) = (*id, doc.clone());
        self.emit(ChangeKind::Update, id, doc);
    }

    fn remove_at(&mut self, pos: usize) {
        let (id, doc) = self.docs.remove(pos);
        self.emit(ChangeKind::Delete, id, doc);
    }

    fn find(&mut self, disc: Option<&str>, spec: &FindSpec) -> Result<Vec<Document>> {
        let scoped = FindSpec {
            filter: scoped_filter(disc, &spec.filter),
            ..spec.clone()
        };
        let out = eval::run_find(self.docs.iter().map(|(_, d)| d), &scoped)?;
        self.filters.push(scoped.filter.clone());
        self.finds.push(scoped);
        Ok(out)
    }

    fn find_one(&mut self, disc: Option<&str>, spec: &FindSpec) -> Result<Option<Document>> {
        let spec = spec.clone().limit(1);
        Ok(self.find(disc, &spec)?.into_iter().next())
    }

    fn count(&mut self, disc: Option<&str>, filter: &Predicate) -> Result<u64> {
        Ok(self.positions(disc, filter)?.len() as u64)
    }

    fn distinct(
        &mut self,
        disc: Option<&str>,
        field: &JsonPath,
        filter: &Predicate,
    ) -> Result<Vec<Value>> {
        let mut out: Vec<Value> = Vec::new();
        for pos in self.positions(disc, filter)? {
            if let Some(value) = get_path(&self.docs[pos].1, field) {
                if !value.is_null() && !out.iter().any(|seen| json_eq(seen, value)) {
                    out.push(value.clone());
                }
            }
        }
        Ok(out)
    }

    fn aggregate(&mut self, disc: Option<&str>, aggregation: &Aggregation) -> Result<Vec<Document>> {
        let scoped = Aggregation {
            filter: scoped_filter(disc, &aggregation.filter),
            ..aggregation.clone()
        };
        self.filters.push(scoped.filter.clone());
        eval::run_aggregation(self.docs.iter().map(|(_, d)| d), &scoped)
    }

    fn map_reduce(&mut self, disc: Option<&str>, spec: &MapReduce) -> Result<Vec<Document>> {
        let scoped = MapReduce {
            filter: scoped_filter(disc, &spec.filter),
            ..spec.clone()
        };
        self.filters.push(scoped.filter.clone());
        eval::run_map_reduce(self.docs.iter().map(|(_, d)| d), &scoped)
    }

    fn insert_one(&mut self, disc: Option<&str>, doc: Document) -> Result<Uuid> {
        self.insert(disc, doc)
    }

    fn insert_many(&mut self, disc: Option<&str>, docs: Vec<Document>) -> Result<Vec<Uuid>> {
        docs.into_iter().map(|doc| self.insert(disc, doc)).collect()
    }

    fn replace_one(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        doc: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        match self.positions(disc, filter)?.first() {
            Some(&pos) => {
                self.replace_at(pos, disc, doc)?;
                Ok(UpdateOutcome {
                    matched: 1,
                    modified: 1,
                    upserted_id: None,
                })
            }
            None if upsert => Ok(UpdateOutcome {
                upserted_id: Some(self.insert(disc, doc)?),
                ..UpdateOutcome::default()
            }),
            None => Ok(UpdateOutcome::default()),
        }
    }

    fn update_one(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        let hits = self.positions(disc, filter)?;
        let Some(&pos) = hits.first() else {
            return Ok(UpdateOutcome::default());
        };
        self.update_at(pos, update);
        Ok(UpdateOutcome {
            matched: 1,
            modified: 1,
            upserted_id: None,
        })
    }

    fn update_many(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        let hits = self.positions(disc, filter)?;
        for &pos in &hits {
            self.update_at(pos, update);
        }
        Ok(UpdateOutcome {
            matched: hits.len() as u64,
            modified: hits.len() as u64,
            upserted_id: None,
        })
    }

    fn delete_one(&mut self, disc: Option<&str>, filter: &Predicate) -> Result<u64> {
        match self.positions(disc, filter)?.first() {
            Some(&pos) => {
                self.remove_at(pos);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_many(&mut self, disc: Option<&str>, filter: &Predicate) -> Result<u64> {
        let hits = self.positions(disc, filter)?;
        for &pos in hits.iter().rev() {
            self.remove_at(pos);
        }
        Ok(hits.len() as u64)
    }

    fn bulk_write(&mut self, disc: Option<&str>, models: Vec<WriteModel>) -> Result<BulkWriteOutcome> {
        let mut outcome = BulkWriteOutcome::default();
        for model in models {
            match model {
                WriteModel::InsertOne { doc } => {
                    self.insert(disc, doc)?;
                    outcome.inserted += 1;
                }
                WriteModel::UpdateOne { filter, update } => {
                    outcome.absorb(self.update_one(disc, &filter, &update)?)
                }
                WriteModel::UpdateMany { filter, update } => {
                    outcome.absorb(self.update_many(disc, &filter, &update)?)
                }
                WriteModel::ReplaceOne {
                    filter,
                    doc,
                    upsert,
                } => outcome.absorb(self.replace_one(disc, &filter, doc, upsert)?),
                WriteModel::DeleteOne { filter } => outcome.deleted += self.delete_one(disc, &filter)?,
                WriteModel::DeleteMany { filter } => {
                    outcome.deleted += self.delete_many(disc, &filter)?
                }
            }
        }
        Ok(outcome)
    }

    fn find_one_and_update(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        update: &Update,
        options: &FindAndModify,
    ) -> Result<Option<Document>> {
        let Some(pos) = self.first_position(disc, filter, options)? else {
            return Ok(None);
        };
        let before = self.docs[pos].1.clone();
        self.update_at(pos, update);
        Ok(Some(match options.return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => self.docs[pos].1.clone(),
        }))
    }

    fn find_one_and_replace(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        doc: Document,
        options: &FindAndModify,
    ) -> Result<Option<Document>> {
        match self.first_position(disc, filter, options)? {
            Some(pos) => {
                let before = self.docs[pos].1.clone();
                self.replace_at(pos, disc, doc)?;
                Ok(Some(match options.return_document {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => self.docs[pos].1.clone(),
                }))
            }
            None if options.upsert => {
                self.insert(disc, doc)?;
                Ok(match options.return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => self.docs.last().map(|(_, d)| d.clone()),
                })
            }
            None => Ok(None),
        }
    }

    fn find_one_and_delete(
        &mut self,
        disc: Option<&str>,
        filter: &Predicate,
        options: &FindAndModify,
    ) -> Result<Option<Document>> {
        let Some(pos) = self.first_position(disc, filter, options)? else {
            return Ok(None);
        };
        let doc = self.docs[pos].1.clone();
        self.remove_at(pos);
        Ok(Some(doc))
    }

    fn watch(&mut self, disc: Option<&str>, options: &WatchOptions) -> Result<ChangeStream> {
        let filter = scoped_filter(disc, &options.filter);
        let start = options
            .start_after
            .unwrap_or(self.changes.len() as i64);
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        for event in self.changes.iter().filter(|e| e.seq > start) {
            if matches(&filter, &event.doc)? {
                let _ = tx.try_send(event.clone());
            }
        }
        self.watchers.push(Watcher { tx, filter });
        Ok(ChangeStream::new(rx, start))
    }

    fn create_index(&mut self, name_space: &str, model: &IndexModel) -> Result<String> {
        if model.keys.is_empty() {
            return Err(Error::validation("keys", "an index needs at least one key"));
        }
        let name = model.resolved_name(name_space);
        let definition = index_definition(model);
        if let Some(existing) = self.indexes.get(&name).map(|i| &i.info) {
            if existing.definition != definition || existing.unique != model.unique {
                return Err(Error::IndexConflict {
                    collection: name_space.to_string(),
                    detail: format!("`{name}` exists with definition `{}`", existing.definition),
                });
            }
            return Ok(name);
        }
        if model.is_text() {
            if let Some(other) = self.indexes.values().find(|i| i.is_text()) {
                return Err(Error::IndexConflict {
                    collection: name_space.to_string(),
                    detail: format!("text index `{}` already exists", other.info.name),
                });
            }
        }
        self.indexes.insert(
            name.clone(),
            StoredIndex {
                info: IndexInfo {
                    name: name.clone(),
                    definition,
                    unique: model.unique,
                },
                keys: model.keys.iter().map(|(_, key)| *key).collect(),
            },
        );
        Ok(name)
    }

    fn create_indexes(&mut self, name_space: &str, models: &[IndexModel]) -> Result<Vec<String>> {
        models.iter().map(|m| self.create_index(name_space, m)).collect()
    }

    fn list_indexes(&mut self) -> Result<Vec<IndexInfo>> {
        Ok(self.indexes.values().map(|i| i.info.clone()).collect())
    }

    fn drop_index(&mut self, name: &str) -> Result<()> {
        match self.indexes.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::validation("index", format!("index `{name}` not found"))),
        }
    }

    fn drop_indexes(&mut self) -> Result<()> {
        self.indexes.clear();
        Ok(())
    }
}

/// Routes each generated method to the matching `Inner` method. Index
/// operations need the collection name and take no discriminator.
macro_rules! memory_call {
    ($self:ident, $inner:ident, create_index, $($arg:ident),*) => {
        $inner.create_index(&$self.state.name, $($arg),*)
    };
    ($self:ident, $inner:ident, create_indexes, $($arg:ident),*) => {
        $inner.create_indexes(&$self.state.name, $($arg),*)
    };
    ($self:ident, $inner:ident, list_indexes, ) => {
        $inner.list_indexes()
    };
    ($self:ident, $inner:ident, drop_index, $($arg:ident),*) => {
        $inner.drop_index($($arg),*)
    };
    ($self:ident, $inner:ident, drop_indexes, ) => {
        $inner.drop_indexes()
    };
    ($self:ident, $inner:ident, $op:ident, $($arg:ident),*) => {
        $inner.$op($self.discriminator.as_deref(), $($arg),*)
    };
}

macro_rules! memory_driver {
    ($( $op:ident / $op_in:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty ; )*) => {
        #[async_trait]
        impl CollectionDriver for MemoryCollection {
            fn namespace(&self) -> &str {
                &self.state.name
            }

            fn settings(&self) -> CollectionSettings {
                self.settings
            }

            fn with_settings(&self, settings: CollectionSettings) -> Arc<dyn CollectionDriver> {
                Arc::new(Self {
                    settings,
                    ..self.clone()
                })
            }

            fn of_type(&self, discriminator: &str) -> Arc<dyn CollectionDriver> {
                Arc::new(Self {
                    discriminator: Some(discriminator.to_string()),
                    ..self.clone()
                })
            }

            async fn estimated_count(&self, signal: &CallSignal) -> Result<u64> {
                self.dispatch("estimated_count", None, signal).await?;
                Ok(self.state.lock().docs.len() as u64)
            }

            $(
                async fn $op(&self, signal: &CallSignal, $($arg: $ty),*) -> Result<$ret> {
                    self.dispatch(stringify!($op), None, signal).await?;
                    let mut inner = self.state.lock();
                    memory_call!(self, inner, $op, $($arg),*)
                }

                async fn $op_in(
                    &self,
                    session: &SessionHandle,
                    signal: &CallSignal,
                    $($arg: $ty),*
                ) -> Result<$ret> {
                    self.dispatch(stringify!($op), Some(session), signal).await?;
                    let mut inner = self.state.lock();
                    memory_call!(self, inner, $op, $($arg),*)
                }
            )*
        }
    };
}

collection_operations!(memory_driver);

/// Registry of in-memory collections, the test counterpart of [`crate::Store`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, MemoryCollection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for name in names {
            store.register(name);
        }
        store
    }

    /// Register `name`, returning the existing collection if already known.
    pub fn register(&self, name: impl Into<String>) -> MemoryCollection {
        let name = name.into();
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.clone())
            .or_insert_with(|| MemoryCollection::new(name))
            .clone()
    }

    /// The in-memory handle for `name`, for seeding and inspection.
    pub fn raw(&self, name: &str) -> Result<MemoryCollection> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("collection `{name}` is not registered")))
    }

    pub fn begin_session(&self) -> SessionHandle {
        SessionHandle::detached()
    }
}

impl CollectionSource for MemoryStore {
    fn driver(&self, collection: &str) -> Result<Arc<dyn CollectionDriver>> {
        Ok(Arc::new(self.raw(collection)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pets() -> MemoryCollection {
        let pets = MemoryCollection::new("pets");
        pets.seed(vec![
            json!({"name": "Biscuit", "status": "available"}),
            json!({"name": "Pepper", "status": "adopted"}),
        ])
        .unwrap();
        pets
    }

    #[tokio::test]
    async fn dispatches_record_the_session() {
        let pets = pets();
        let signal = CallSignal::default();
        let session = SessionHandle::detached();
        pets.count(&signal, &Predicate::True).await.unwrap();
        pets.count_in(&session, &signal, &Predicate::True).await.unwrap();
        assert_eq!(
            pets.dispatches(),
            vec![
                Dispatch { op: "count", session: None },
                Dispatch { op: "count", session: Some(session.id()) },
            ]
        );
    }

    #[tokio::test]
    async fn typed_views_filter_and_stamp() {
        let pets = pets();
        let signal = CallSignal::default();
        let dogs = pets.of_type("Dog");
        dogs.insert_one(&signal, json!({"name": "Rex"})).await.unwrap();
        assert_eq!(dogs.count(&signal, &Predicate::True).await.unwrap(), 1);
        assert_eq!(pets.count(&signal, &Predicate::True).await.unwrap(), 3);
        assert_eq!(pets.documents()[2]["_t"], json!("Dog"));
    }

    #[tokio::test]
    async fn find_one_and_update_returns_requested_side() {
        let pets = pets();
        let signal = CallSignal::default();
        let filter = Predicate::eq("name", "Pepper");
        let update = Update::new().set("status", "returned");
        let before = pets
            .find_one_and_update(&signal, &filter, &update, &FindAndModify::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before["status"], json!("adopted"));
        let after = pets
            .find_one_and_update(
                &signal,
                &filter,
                &Update::new().set("status", "available"),
                &FindAndModify::default().return_after(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after["status"], json!("available"));
    }

    #[tokio::test]
    async fn watch_sees_later_writes_only() {
        let pets = pets();
        let signal = CallSignal::default();
        let mut stream = pets.watch(&signal, &WatchOptions::default()).await.unwrap();
        assert_eq!(stream.resume_after(), 2);
        pets.delete_one(&signal, &Predicate::eq("name", "Biscuit"))
            .await
            .unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.doc["name"], json!("Biscuit"));
    }

    #[tokio::test]
    async fn second_text_index_conflicts() {
        let pets = pets();
        let signal = CallSignal::default();
        pets.create_index(&signal, &IndexModel::new().key("name", IndexKey::Text))
            .await
            .unwrap();
        let err = pets
            .create_index(&signal, &IndexModel::new().key("bio", IndexKey::Text))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexConflict { .. }));
    }

    #[tokio::test]
    async fn field_names_do_not_fake_a_text_index() {
        let pets = pets();
        let signal = CallSignal::default();
        pets.create_index(&signal, &IndexModel::new().key("alt text", IndexKey::Ascending))
            .await
            .unwrap();
        pets.create_index(&signal, &IndexModel::new().key("name", IndexKey::Text))
            .await
            .unwrap();
        let listed = pets.list_indexes(&signal).await.unwrap();
        assert_eq!(listed.len(), 2);

        pets.drop_index(&signal, "pets_name_text").await.unwrap();
        pets.create_index(&signal, &IndexModel::new().key("bio", IndexKey::Text))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_failures_surface_once() {
        let pets = pets();
        let signal = CallSignal::default();
        pets.fail_next("find");
        let err = pets.find(&signal, &FindSpec::all()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(pets.find(&signal, &FindSpec::all()).await.unwrap().len(), 2);
    }

    #[test]
    fn unregistered_collections_are_configuration_errors() {
        let store = MemoryStore::with_collections(["pets"]);
        assert!(store.driver("pets").is_ok());
        let err = store.driver("owners").err().unwrap();
        assert!(err.is_configuration());
    }
}
