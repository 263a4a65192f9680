//! Search-index lifecycle.
//!
//! [`SearchIndexManager`] provisions vector, lexical, autocomplete and
//! synonym-backed search indexes through a [`SearchAdmin`], and plain
//! text/regex indexes through the raw collection driver. Provisioning is
//! idempotent: existing indexes are skipped, never recreated, and an index
//! created by a concurrent run counts as success. Index administration is not
//! transactional, so nothing here goes through [`crate::ScopedCollection`].

pub mod postgres;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::instrument;

use crate::{
    Error, Result,
    context::CallSignal,
    driver::{CollectionDriver, CollectionSource, Document, IndexKey, IndexModel},
    metrics,
    query::{FindSpec, Predicate},
    session::SessionHandle,
};

pub use postgres::PgSearchAdmin;

/// Default collection holding the synonym corpus.
pub const SYNONYMS_COLLECTION: &str = "synonyms";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexKind {
    Vector,
    Lexical,
    Autocomplete,
    Synonym,
    /// Ordinary text index plus case-insensitive ordered index, not a search index.
    PlainRegex,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Vector => "vector",
            IndexKind::Lexical => "lexical",
            IndexKind::Autocomplete => "autocomplete",
            IndexKind::Synonym => "synonym",
            IndexKind::PlainRegex => "plainRegex",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "vector" => IndexKind::Vector,
            "lexical" => IndexKind::Lexical,
            "autocomplete" => IndexKind::Autocomplete,
            "synonym" => IndexKind::Synonym,
            "plainRegex" => IndexKind::PlainRegex,
            _ => return None,
        })
    }

    /// Search-index type as named in admin commands.
    fn command_type(self) -> &'static str {
        match self {
            IndexKind::Vector => "vectorSearch",
            _ => "search",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Similarity {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

impl Similarity {
    fn as_str(self) -> &'static str {
        match self {
            Similarity::Cosine => "cosine",
            Similarity::Euclidean => "euclidean",
            Similarity::DotProduct => "dotProduct",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorParams {
    pub dimensions: u32,
    #[serde(default)]
    pub similarity: Similarity,
}

/// Upper bound pgvector accepts for an indexed vector.
const MAX_DIMENSIONS: u32 = 2000;

fn default_analyzers() -> Vec<String> {
    vec!["english".to_string()]
}

/// One declared index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub name: String,
    pub collection: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
    /// Text-search configurations, one mapping per analyzer and field.
    #[serde(default = "default_analyzers")]
    pub analyzers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorParams>,
    /// Synonym mapping name, for [`IndexKind::Synonym`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synonyms: Option<String>,
}

fn is_identifier(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !raw.starts_with(|c: char| c.is_ascii_digit())
}

impl IndexDefinition {
    fn build(
        name: impl Into<String>,
        collection: impl Into<String>,
        kind: IndexKind,
        fields: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            kind,
            fields,
            analyzers: default_analyzers(),
            vector: None,
            synonyms: None,
        }
    }

    pub fn vector(
        name: impl Into<String>,
        collection: impl Into<String>,
        field: impl Into<String>,
        dimensions: u32,
        similarity: Similarity,
    ) -> Self {
        Self {
            vector: Some(VectorParams {
                dimensions,
                similarity,
            }),
            ..Self::build(name, collection, IndexKind::Vector, vec![field.into()])
        }
    }

    pub fn lexical<I, S>(name: impl Into<String>, collection: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        Self::build(name, collection, IndexKind::Lexical, fields)
    }

    pub fn autocomplete<I, S>(
        name: impl Into<String>,
        collection: impl Into<String>,
        fields: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        Self::build(name, collection, IndexKind::Autocomplete, fields)
    }

    pub fn synonym<I, S>(
        name: impl Into<String>,
        collection: impl Into<String>,
        fields: I,
        mapping: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        Self {
            synonyms: Some(mapping.into()),
            ..Self::build(name, collection, IndexKind::Synonym, fields)
        }
    }

    /// Plain text/regex support for one field, named `<collection>_<field>_ci`.
    pub fn plain_regex(collection: impl Into<String>, field: impl Into<String>) -> Self {
        let collection = collection.into();
        let field = field.into();
        let name = IndexModel::new()
            .key(field.as_str(), IndexKey::CaseInsensitive)
            .resolved_name(&collection);
        Self::build(name, collection, IndexKind::PlainRegex, vec![field])
    }

    pub fn analyzers<I, S>(mut self, analyzers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.analyzers = analyzers.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(Error::validation(
                "name",
                format!("`{}` is not a valid index name", self.name),
            ));
        }
        if !is_identifier(&self.collection) {
            return Err(Error::validation(
                "collection",
                format!("`{}` is not a valid collection name", self.collection),
            ));
        }
        if self.fields.is_empty() || self.fields.iter().any(|f| f.trim().is_empty()) {
            return Err(Error::validation("fields", format!("index `{}` needs fields", self.name)));
        }
        if matches!(self.kind, IndexKind::Lexical | IndexKind::Synonym) {
            if self.analyzers.is_empty() {
                return Err(Error::validation("analyzers", "at least one analyzer is required"));
            }
            if let Some(bad) = self.analyzers.iter().find(|a| !is_identifier(a)) {
                return Err(Error::validation("analyzers", format!("`{bad}` is not an analyzer")));
            }
        }
        match self.kind {
            IndexKind::Vector => {
                let params = self.vector.ok_or_else(|| {
                    Error::validation("vector", format!("index `{}` needs vector parameters", self.name))
                })?;
                if self.fields.len() != 1 {
                    return Err(Error::validation("fields", "a vector index covers one field"));
                }
                if params.dimensions == 0 || params.dimensions > MAX_DIMENSIONS {
                    return Err(Error::validation(
                        "dimensions",
                        format!("must be between 1 and {MAX_DIMENSIONS}"),
                    ));
                }
            }
            IndexKind::Synonym if self.synonyms.as_deref().is_none_or(str::is_empty) => {
                return Err(Error::validation(
                    "synonyms",
                    format!("index `{}` needs a synonym mapping name", self.name),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Field mappings for the search-index definition document.
    fn definition(&self, synonyms_collection: &str) -> Value {
        let analyzer = |a: &str| format!("lucene.{a}");
        match self.kind {
            IndexKind::Vector => {
                let params = self.vector.unwrap_or(VectorParams {
                    dimensions: 0,
                    similarity: Similarity::Cosine,
                });
                json!({
                    "fields": self.fields.iter().map(|path| json!({
                        "type": "vector",
                        "path": path,
                        "numDimensions": params.dimensions,
                        "similarity": params.similarity.as_str(),
                    })).collect::<Vec<_>>()
                })
            }
            IndexKind::Autocomplete => {
                let fields: Map<String, Value> = self
                    .fields
                    .iter()
                    .map(|f| {
                        (
                            f.clone(),
                            json!([{"type": "autocomplete", "tokenization": "edgeGram", "minGrams": 2, "maxGrams": 15}]),
                        )
                    })
                    .collect();
                json!({"mappings": {"dynamic": false, "fields": fields}})
            }
            IndexKind::Lexical | IndexKind::Synonym | IndexKind::PlainRegex => {
                let fields: Map<String, Value> = self
                    .fields
                    .iter()
                    .map(|f| {
                        let per_analyzer: Vec<Value> = self
                            .analyzers
                            .iter()
                            .map(|a| json!({"type": "string", "analyzer": analyzer(a)}))
                            .collect();
                        (f.clone(), Value::Array(per_analyzer))
                    })
                    .collect();
                let mut definition = json!({"mappings": {"dynamic": false, "fields": fields}});
                if let (IndexKind::Synonym, Some(mapping)) = (self.kind, &self.synonyms) {
                    let first = self.analyzers.first().map(String::as_str).unwrap_or("english");
                    definition["synonyms"] = json!([{
                        "name": mapping,
                        "analyzer": analyzer(first),
                        "source": {"collection": synonyms_collection},
                    }]);
                }
                definition
            }
        }
    }
}

/// Commands understood by a search subsystem.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchCommand {
    Create {
        collection: String,
        definitions: Vec<IndexDefinition>,
        synonyms_collection: String,
    },
    List {
        collection: String,
        name: Option<String>,
    },
    Drop {
        collection: String,
        name: String,
    },
}

impl SearchCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SearchCommand::Create { .. } => "createSearchIndexes",
            SearchCommand::List { .. } => "listSearchIndexes",
            SearchCommand::Drop { .. } => "dropSearchIndex",
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            SearchCommand::Create { collection, .. }
            | SearchCommand::List { collection, .. }
            | SearchCommand::Drop { collection, .. } => collection,
        }
    }

    /// The command as the structured document a search subsystem receives.
    pub fn to_document(&self) -> Value {
        match self {
            SearchCommand::Create {
                collection,
                definitions,
                synonyms_collection,
            } => json!({
                "createSearchIndexes": collection,
                "indexes": definitions.iter().map(|d| json!({
                    "name": d.name,
                    "type": d.kind.command_type(),
                    "definition": d.definition(synonyms_collection),
                })).collect::<Vec<_>>(),
            }),
            SearchCommand::List { collection, name } => {
                let mut doc = json!({"listSearchIndexes": collection});
                if let Some(name) = name {
                    doc["name"] = json!(name);
                }
                doc
            }
            SearchCommand::Drop { collection, name } => {
                json!({"dropSearchIndex": collection, "name": name})
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIndexStatus {
    pub name: String,
    pub kind: IndexKind,
    /// Built and usable. Existence alone does not imply this.
    pub queryable: bool,
    /// Registered, but the build failed or was interrupted and nothing is
    /// building it now. Provisioning replaces such an index.
    #[serde(default)]
    pub needs_rebuild: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchReply {
    Created(Vec<String>),
    Listed(Vec<SearchIndexStatus>),
    Dropped,
}

/// Transport for search commands.
///
/// Implementations report an existing index as [`Error::IndexAlreadyExists`]
/// and an incapable store as [`Error::SearchUnavailable`].
#[async_trait]
pub trait SearchAdmin: Send + Sync {
    async fn execute(&self, command: &SearchCommand) -> Result<SearchReply>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynonymGroup {
    pub category: String,
    pub language: String,
    pub terms: Vec<String>,
}

impl SynonymGroup {
    pub fn new<I, S>(category: impl Into<String>, language: impl Into<String>, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            category: category.into(),
            language: language.into(),
            terms: terms.into_iter().map(Into::into).collect(),
        }
    }

    /// Trimmed, lower-cased, deduplicated terms in first-seen order.
    fn normalized_terms(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect()
    }
}

/// Stored form of a synonym group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynonymDocument {
    synonyms: Vec<String>,
    mapping_type: String,
    category: String,
    language: String,
}

/// Synonym documents in category/language order.
fn synonym_documents(groups: &[SynonymGroup]) -> Result<Vec<Document>> {
    let mut ordered: BTreeMap<(&str, &str), Vec<Vec<String>>> = BTreeMap::new();
    for group in groups {
        if group.category.trim().is_empty() || group.language.trim().is_empty() {
            return Err(Error::validation(
                "synonyms",
                "every group needs a category and a language",
            ));
        }
        let terms = group.normalized_terms();
        if terms.len() < 2 {
            return Err(Error::validation(
                "synonyms",
                format!("group in `{}` needs two distinct terms", group.category),
            ));
        }
        ordered
            .entry((group.category.as_str(), group.language.as_str()))
            .or_default()
            .push(terms);
    }
    let mut docs = Vec::with_capacity(groups.len());
    for ((category, language), sets) in ordered {
        for synonyms in sets {
            docs.push(serde_json::to_value(SynonymDocument {
                synonyms,
                mapping_type: "equivalent".to_string(),
                category: category.to_string(),
                language: language.to_string(),
            })?);
        }
    }
    Ok(docs)
}

/// Equivalence sets used to widen free-text queries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynonymSet {
    groups: Vec<BTreeSet<String>>,
}

impl SynonymSet {
    pub fn from_groups<'a, I>(groups: I) -> Self
    where
        I: IntoIterator<Item = &'a SynonymGroup>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|g| g.normalized_terms().into_iter().collect())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// `term` first, then every equivalent from every group containing it.
    pub fn expand(&self, term: &str) -> Vec<String> {
        let needle = term.trim().to_lowercase();
        let mut out = vec![needle.clone()];
        for group in self.groups.iter().filter(|g| g.contains(&needle)) {
            for other in group {
                if !out.contains(other) {
                    out.push(other.clone());
                }
            }
        }
        out
    }
}

fn default_synonyms_collection() -> String {
    SYNONYMS_COLLECTION.to_string()
}

/// Provisioning input, usually read from a JSON file at deploy time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    #[serde(default = "default_synonyms_collection")]
    pub synonyms_collection: String,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub synonyms: Vec<SynonymGroup>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            synonyms_collection: default_synonyms_collection(),
            indexes: Vec::new(),
            synonyms: Vec::new(),
        }
    }
}

impl SearchConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Creation requested; the store may still be building them.
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct SearchIndexManager {
    admin: Arc<dyn SearchAdmin>,
    source: Arc<dyn CollectionSource>,
    synonyms_collection: String,
    signal: CallSignal,
}

impl SearchIndexManager {
    pub fn new(admin: Arc<dyn SearchAdmin>, source: Arc<dyn CollectionSource>) -> Self {
        Self {
            admin,
            source,
            synonyms_collection: default_synonyms_collection(),
            signal: CallSignal::default(),
        }
    }

    pub fn with_synonyms_collection(mut self, name: impl Into<String>) -> Self {
        self.synonyms_collection = name.into();
        self
    }

    /// Cancellation and deadline for the driver calls this manager makes.
    pub fn with_signal(mut self, signal: CallSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn synonyms_collection(&self) -> &str {
        &self.synonyms_collection
    }

    /// Create every missing index in `definitions`.
    ///
    /// Stops at the first hard failure. [`Error::SearchUnavailable`] means the
    /// store cannot host search indexes at all and must not be retried.
    #[instrument(skip_all, fields(definitions = definitions.len()))]
    pub async fn ensure_indexes(&self, definitions: &[IndexDefinition]) -> Result<ProvisionReport> {
        let mut names = HashSet::new();
        for def in definitions {
            def.validate()?;
            if !names.insert((def.collection.as_str(), def.name.as_str())) {
                return Err(Error::validation(
                    "name",
                    format!("index `{}` is declared twice on `{}`", def.name, def.collection),
                ));
            }
        }

        let mut report = ProvisionReport::default();
        let mut plain: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for def in definitions {
            if def.kind == IndexKind::PlainRegex {
                let fields = plain.entry(def.collection.as_str()).or_default();
                for field in &def.fields {
                    if !fields.contains(&field.as_str()) {
                        fields.push(field.as_str());
                    }
                }
                continue;
            }
            self.ensure_search_index(def, &mut report).await?;
        }
        for (collection, fields) in plain {
            self.ensure_plain_indexes(collection, &fields, &mut report)
                .await?;
        }
        tracing::info!(
            target: "kennel::search",
            created = report.created.len(),
            skipped = report.skipped.len(),
            "index provisioning finished"
        );
        Ok(report)
    }

    async fn ensure_search_index(
        &self,
        def: &IndexDefinition,
        report: &mut ProvisionReport,
    ) -> Result<()> {
        match self.index_status(&def.collection, &def.name).await? {
            Some(status) if !status.needs_rebuild => {
                tracing::info!(target: "kennel::search", index = %def.name, collection = %def.collection, "search index exists, skipping");
                metrics::record_index_provisioned(false);
                report.skipped.push(def.name.clone());
                return Ok(());
            }
            Some(_) => {
                tracing::warn!(target: "kennel::search", index = %def.name, collection = %def.collection, "search index build did not finish, rebuilding");
            }
            None => {}
        }
        let command = SearchCommand::Create {
            collection: def.collection.clone(),
            definitions: vec![def.clone()],
            synonyms_collection: self.synonyms_collection.clone(),
        };
        match self.admin.execute(&command).await {
            Ok(_) => {
                tracing::info!(target: "kennel::search", index = %def.name, collection = %def.collection, kind = def.kind.as_str(), "search index requested");
                metrics::record_index_provisioned(true);
                report.created.push(def.name.clone());
                Ok(())
            }
            Err(Error::IndexAlreadyExists { name }) => {
                tracing::info!(target: "kennel::search", index = %name, "search index created concurrently, skipping");
                metrics::record_index_provisioned(false);
                report.skipped.push(def.name.clone());
                Ok(())
            }
            Err(err) => {
                if err.is_configuration() {
                    tracing::error!(target: "kennel::search", index = %def.name, error = %err, "search subsystem unavailable");
                }
                Err(err)
            }
        }
    }

    /// One text index over every field plus a case-insensitive ordered index per field.
    async fn ensure_plain_indexes(
        &self,
        collection: &str,
        fields: &[&str],
        report: &mut ProvisionReport,
    ) -> Result<()> {
        let driver = self.source.driver(collection)?;
        let existing: HashSet<String> = driver
            .list_indexes(&self.signal)
            .await?
            .into_iter()
            .map(|info| info.name)
            .collect();

        let mut text = IndexModel::new().named(format!("{collection}_text"));
        for field in fields {
            text = text.key(*field, IndexKey::Text);
        }
        let mut models = vec![text];
        models.extend(
            fields
                .iter()
                .map(|field| IndexModel::new().key(*field, IndexKey::CaseInsensitive)),
        );

        for model in &models {
            let name = model.resolved_name(collection);
            if existing.contains(&name) {
                tracing::info!(target: "kennel::search", index = %name, collection, "index exists, skipping");
                report.skipped.push(name);
                continue;
            }
            match driver.create_index(&self.signal, model).await {
                Ok(created) => {
                    tracing::info!(target: "kennel::search", index = %created, collection, "index created");
                    report.created.push(created);
                }
                Err(Error::IndexAlreadyExists { .. }) => report.skipped.push(name),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn index_exists(&self, collection: &str, name: &str) -> Result<bool> {
        Ok(self.index_status(collection, name).await?.is_some())
    }

    pub async fn index_status(
        &self,
        collection: &str,
        name: &str,
    ) -> Result<Option<SearchIndexStatus>> {
        let command = SearchCommand::List {
            collection: collection.to_string(),
            name: Some(name.to_string()),
        };
        let listed = self.listed(&command).await?;
        Ok(listed.into_iter().find(|status| status.name == name))
    }

    pub async fn list_indexes(&self, collection: &str) -> Result<Vec<SearchIndexStatus>> {
        let command = SearchCommand::List {
            collection: collection.to_string(),
            name: None,
        };
        self.listed(&command).await
    }

    /// Drop a search index. Dropping one that is already gone is a no-op.
    pub async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        if !self.index_exists(collection, name).await? {
            tracing::info!(target: "kennel::search", index = name, collection, "search index already absent");
            return Ok(());
        }
        let command = SearchCommand::Drop {
            collection: collection.to_string(),
            name: name.to_string(),
        };
        self.admin.execute(&command).await?;
        tracing::info!(target: "kennel::search", index = name, collection, "search index dropped");
        Ok(())
    }

    /// Replace the whole synonym corpus with `groups`.
    ///
    /// Runs as two statements; readers in between may see an empty corpus.
    /// Use [`Self::provision_synonyms_in`] to swap inside one session.
    pub async fn provision_synonyms(&self, groups: &[SynonymGroup]) -> Result<u64> {
        let docs = synonym_documents(groups)?;
        let driver = self.synonyms_driver()?;
        let removed = driver.delete_many(&self.signal, &Predicate::True).await?;
        let written = if docs.is_empty() {
            0
        } else {
            driver.insert_many(&self.signal, docs).await?.len() as u64
        };
        self.synonyms_replaced(removed, written);
        Ok(written)
    }

    pub async fn provision_synonyms_in(
        &self,
        session: &SessionHandle,
        groups: &[SynonymGroup],
    ) -> Result<u64> {
        let docs = synonym_documents(groups)?;
        let driver = self.synonyms_driver()?;
        let removed = driver
            .delete_many_in(session, &self.signal, &Predicate::True)
            .await?;
        let written = if docs.is_empty() {
            0
        } else {
            driver
                .insert_many_in(session, &self.signal, docs)
                .await?
                .len() as u64
        };
        self.synonyms_replaced(removed, written);
        Ok(written)
    }

    /// Current corpus for `language`.
    pub async fn load_synonyms(&self, language: &str) -> Result<SynonymSet> {
        let driver = self.synonyms_driver()?;
        let docs = driver
            .find(&self.signal, &FindSpec::new(Predicate::eq("language", language)))
            .await?;
        let groups = docs
            .into_iter()
            .map(|doc| -> Result<SynonymGroup> {
                let stored: SynonymDocument = serde_json::from_value(doc)?;
                Ok(SynonymGroup::new(stored.category, stored.language, stored.synonyms))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SynonymSet::from_groups(&groups))
    }

    fn synonyms_driver(&self) -> Result<Arc<dyn CollectionDriver>> {
        self.source.driver(&self.synonyms_collection)
    }

    fn synonyms_replaced(&self, removed: u64, written: u64) {
        if removed == 0 {
            tracing::info!(target: "kennel::search", collection = %self.synonyms_collection, "synonym corpus already empty");
        }
        metrics::record_synonym_groups(written);
        tracing::info!(target: "kennel::search", collection = %self.synonyms_collection, removed, written, "synonym corpus replaced");
    }

    async fn listed(&self, command: &SearchCommand) -> Result<Vec<SearchIndexStatus>> {
        match self.admin.execute(command).await? {
            SearchReply::Listed(indexes) => Ok(indexes),
            other => Err(Error::configuration(format!(
                "search admin answered `{}` with {other:?}",
                command.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_command_document() {
        let def = IndexDefinition::vector("vec_idx", "pets", "embedding", 384, Similarity::Cosine);
        let command = SearchCommand::Create {
            collection: "pets".into(),
            definitions: vec![def],
            synonyms_collection: SYNONYMS_COLLECTION.into(),
        };
        assert_eq!(
            command.to_document(),
            json!({
                "createSearchIndexes": "pets",
                "indexes": [{
                    "name": "vec_idx",
                    "type": "vectorSearch",
                    "definition": {"fields": [{
                        "type": "vector",
                        "path": "embedding",
                        "numDimensions": 384,
                        "similarity": "cosine"
                    }]}
                }]
            })
        );
    }

    #[test]
    fn synonym_definition_points_at_the_corpus() {
        let def = IndexDefinition::synonym("pet_syn", "pets", ["name"], "pet_terms")
            .analyzers(["english", "simple"]);
        let doc = def.definition("synonyms");
        assert_eq!(doc["synonyms"][0]["source"]["collection"], json!("synonyms"));
        assert_eq!(doc["synonyms"][0]["analyzer"], json!("lucene.english"));
        assert_eq!(doc["mappings"]["fields"]["name"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn definitions_are_checked() {
        assert!(IndexDefinition::vector("v", "pets", "e", 0, Similarity::Cosine).validate().is_err());
        assert!(IndexDefinition::lexical("bad name", "pets", ["name"]).validate().is_err());
        assert!(IndexDefinition::lexical("ok", "pets", Vec::<String>::new()).validate().is_err());
        let mut syn = IndexDefinition::synonym("s", "pets", ["name"], "m");
        syn.synonyms = None;
        assert!(syn.validate().is_err());
        assert_eq!(IndexDefinition::plain_regex("pets", "name").name, "pets_name_ci");
    }

    #[test]
    fn synonym_documents_are_grouped_and_normalized() {
        let docs = synonym_documents(&[
            SynonymGroup::new("species", "en", ["Dog", "canine", "dog"]),
            SynonymGroup::new("breeds", "en", ["lab", "labrador"]),
        ])
        .unwrap();
        assert_eq!(docs[0]["category"], json!("breeds"));
        assert_eq!(docs[1]["synonyms"], json!(["dog", "canine"]));
        assert_eq!(docs[1]["mappingType"], json!("equivalent"));

        let err = synonym_documents(&[SynonymGroup::new("x", "en", ["one", "ONE"])]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn expansion_follows_every_group() {
        let set = SynonymSet::from_groups(&[
            SynonymGroup::new("species", "en", ["dog", "canine"]),
            SynonymGroup::new("slang", "en", ["dog", "pup"]),
        ]);
        assert_eq!(set.expand("Dog"), ["dog", "canine", "pup"]);
        assert_eq!(set.expand("cat"), ["cat"]);
    }

    #[test]
    fn config_reads_defaults() {
        let config: SearchConfig = serde_json::from_value(json!({
            "indexes": [{"name": "pets_search", "collection": "pets", "kind": "lexical", "fields": ["name"]}]
        }))
        .unwrap();
        assert_eq!(config.synonyms_collection, "synonyms");
        assert_eq!(config.indexes[0].analyzers, ["english"]);
        assert!(config.synonyms.is_empty());
    }
}
