//! Per-entity query pipeline.
//!
//! A request moves through a fixed sequence of stages, each a separate type
//! consumed by the next: [`Filtered`] → [`Authorized`] → [`Sorted`] →
//! [`Paginated`] → [`QueryPlan`]. [`Authorized`] has no public constructor,
//! so the only way to reach sorting is through [`QueryPipeline`]'s single
//! authorization step.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    Error, Result,
    context::RequestContext,
    metrics,
    projector::{Entity, EntityDescriptor, FieldProjector, ProjectionSet},
    query::{FindSpec, JsonPath, Predicate, SortDirection, SortSpec},
    scoped::ScopedCollection,
    search::SynonymSet,
};

/// Inbound query as sent by the API layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec<F = NoFilters> {
    /// 1-based page number; 0 is treated as 1.
    #[serde(default)]
    pub offset: i64,
    /// 0 means unlimited, which only trusted pipelines accept.
    #[serde(default)]
    pub page_size: i64,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sort_by: Vec<String>,
    #[serde(default)]
    pub sort_descending: bool,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(flatten)]
    pub filters: F,
}

/// Filters for entities without any of their own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoFilters {}

impl<F: Default> QuerySpec<F> {
    pub fn page(offset: i64, page_size: i64) -> Self {
        Self {
            offset,
            page_size,
            ..Self::default()
        }
    }
}

impl<F> QuerySpec<F> {
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort_by<I, S>(mut self, keys: I, descending: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort_by = keys.into_iter().map(Into::into).collect();
        self.sort_descending = descending;
        self
    }

    pub fn query(mut self, text: impl Into<String>) -> Self {
        self.query = Some(text.into());
        self
    }

    pub fn filters(mut self, filters: F) -> Self {
        self.filters = filters;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset < 0 {
            return Err(Error::validation("offset", "must not be negative"));
        }
        if self.page_size < 0 {
            return Err(Error::validation("pageSize", "must not be negative"));
        }
        Ok(())
    }

    fn free_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// Collects entity-specific conditions; all of them are ANDed.
#[derive(Debug, Default)]
pub struct FilterBuilder {
    clauses: Vec<Predicate>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership in `ids`. An empty list adds nothing.
    pub fn ids(&mut self, path: impl Into<JsonPath>, ids: &[Uuid]) -> &mut Self {
        if !ids.is_empty() {
            self.clauses.push(Predicate::r#in(
                path,
                ids.iter().map(Uuid::to_string),
            ));
        }
        self
    }

    /// Membership in `values`. An empty list adds nothing.
    pub fn one_of<V: Serialize>(&mut self, path: impl Into<JsonPath>, values: &[V]) -> &mut Self {
        if !values.is_empty() {
            self.clauses.push(Predicate::r#in(path, values));
        }
        self
    }

    /// Inclusive bounds; a missing side leaves that end open.
    pub fn range<V: Serialize>(
        &mut self,
        path: impl Into<JsonPath>,
        low: Option<V>,
        high: Option<V>,
    ) -> &mut Self {
        if low.is_some() || high.is_some() {
            self.clauses.push(Predicate::range(path, low, high));
        }
        self
    }

    pub fn push(&mut self, predicate: Predicate) -> &mut Self {
        if !predicate.is_true() {
            self.clauses.push(predicate);
        }
        self
    }

    pub fn build(self) -> Predicate {
        match self.clauses.len() {
            0 => Predicate::True,
            1 => self.clauses.into_iter().next().unwrap_or_default(),
            _ => Predicate::And(self.clauses),
        }
    }
}

/// Entity-specific filter step.
pub trait EntityQuery: Entity + DeserializeOwned + Send + Sync + 'static {
    type Filters: Default + Send + Sync;

    fn filter(filters: &Self::Filters, builder: &mut FilterBuilder);
}

/// Caller identity and granted permissions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub subject: String,
    pub permissions: BTreeSet<String>,
}

impl AuthorizationContext {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn grant(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn has(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// What the authorization collaborator allows.
#[derive(Clone, Debug, PartialEq)]
pub enum AccessFilter {
    AllowAll,
    Restrict(Predicate),
}

/// Permission logic lives outside this crate; the pipeline only consumes it.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, ctx: &AuthorizationContext, permission: &str) -> Result<bool>;

    async fn build_filter_for(
        &self,
        entity: &EntityDescriptor,
        ctx: &AuthorizationContext,
    ) -> Result<AccessFilter>;
}

/// How free text becomes a predicate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TextSearchMode {
    /// Store text-search operator over the maintained search vector.
    #[default]
    Index,
    /// Case-insensitive pattern match over the entity's text fields.
    Pattern,
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Largest page a caller may ask for.
    pub max_page_size: u64,
    /// Accept `pageSize = 0` as "no limit". Trusted callers only.
    pub allow_unlimited: bool,
    pub text_search: TextSearchMode,
    pub language: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_page_size: 500,
            allow_unlimited: false,
            text_search: TextSearchMode::Index,
            language: None,
        }
    }
}

/// Stage 1: entity filter and free text.
#[derive(Debug)]
pub struct Filtered {
    entity: Predicate,
}

/// Stage 2: the entity filter with exactly one access filter ANDed on.
#[derive(Debug)]
pub struct Authorized {
    entity: Predicate,
    access: AccessFilter,
}

impl Filtered {
    fn authorize(self, access: AccessFilter) -> Authorized {
        Authorized {
            entity: self.entity,
            access,
        }
    }
}

impl Authorized {
    /// `entity AND access`, or the entity filter alone under [`AccessFilter::AllowAll`].
    pub fn filter(&self) -> Predicate {
        match &self.access {
            AccessFilter::AllowAll => self.entity.clone(),
            AccessFilter::Restrict(access) => Predicate::And(vec![self.entity.clone(), access.clone()]),
        }
    }

    fn sort(self, sort: Vec<SortSpec>) -> Sorted {
        Sorted {
            authorized: self,
            sort,
        }
    }
}

/// Stage 3.
#[derive(Debug)]
pub struct Sorted {
    authorized: Authorized,
    sort: Vec<SortSpec>,
}

impl Sorted {
    fn paginate(self, skip: u64, limit: Option<u64>) -> Paginated {
        Paginated {
            sorted: self,
            skip,
            limit,
        }
    }
}

/// Stage 4.
#[derive(Debug)]
pub struct Paginated {
    sorted: Sorted,
    skip: u64,
    limit: Option<u64>,
}

impl Paginated {
    fn project(self, projection: ProjectionSet) -> QueryPlan {
        let Paginated { sorted, skip, limit } = self;
        QueryPlan {
            filter: sorted.authorized.filter(),
            entity_filter: sorted.authorized.entity,
            access: sorted.authorized.access,
            sort: sorted.sort,
            skip,
            limit,
            projection,
        }
    }
}

/// Stage 5: everything the store call needs.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub filter: Predicate,
    pub entity_filter: Predicate,
    pub access: AccessFilter,
    pub sort: Vec<SortSpec>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub projection: ProjectionSet,
}

impl QueryPlan {
    pub fn find_spec(&self) -> FindSpec {
        FindSpec {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            projection: Some(self.projection.fields().to_vec()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Documents matching the authorized filter, across all pages.
    pub total: u64,
    pub offset: i64,
    pub page_size: i64,
}

pub struct QueryPipeline<T> {
    collection: ScopedCollection<T>,
    authorizer: Arc<dyn Authorizer>,
    options: PipelineOptions,
    synonyms: Option<Arc<SynonymSet>>,
}

impl<T> Clone for QueryPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            authorizer: self.authorizer.clone(),
            options: self.options.clone(),
            synonyms: self.synonyms.clone(),
        }
    }
}

impl<T: EntityQuery> QueryPipeline<T> {
    pub fn new(collection: ScopedCollection<T>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            collection,
            authorizer,
            options: PipelineOptions::default(),
            synonyms: None,
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Expand free-text terms with their equivalents.
    pub fn with_synonyms(mut self, synonyms: Arc<SynonymSet>) -> Self {
        self.synonyms = Some(synonyms);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Build the plan without touching the collection.
    pub async fn plan(
        &self,
        spec: &QuerySpec<T::Filters>,
        authz: &AuthorizationContext,
    ) -> Result<QueryPlan> {
        let authorized = self.authorized(spec, authz).await?;
        let sorted = authorized.sort(self.sort_specs(spec)?);
        let (skip, limit) = self.page_bounds(spec)?;
        let projection = FieldProjector::resolve(T::DESCRIPTOR, &spec.fields);
        Ok(sorted.paginate(skip, limit).project(projection))
    }

    #[instrument(skip_all, fields(entity = T::DESCRIPTOR.name, subject = %authz.subject))]
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        spec: &QuerySpec<T::Filters>,
        authz: &AuthorizationContext,
    ) -> Result<Vec<T>> {
        let start = Instant::now();
        let out = self.run(ctx, spec, authz).await;
        self.finish(start, &out);
        out
    }

    /// Like [`Self::execute`], plus the authorized total.
    #[instrument(skip_all, fields(entity = T::DESCRIPTOR.name, subject = %authz.subject))]
    pub async fn execute_page(
        &self,
        ctx: &RequestContext,
        spec: &QuerySpec<T::Filters>,
        authz: &AuthorizationContext,
    ) -> Result<Page<T>> {
        let start = Instant::now();
        let out: Result<Page<T>> = async {
            let plan = self.plan(spec, authz).await?;
            let total = self.collection.count(ctx, &plan.filter).await?;
            let items = self.load(ctx, &plan).await?;
            Ok(Page {
                items,
                total,
                offset: spec.offset,
                page_size: spec.page_size,
            })
        }
        .await;
        self.finish(start, &out);
        out
    }

    /// Documents the caller may see under `spec`'s filters, ignoring paging.
    pub async fn count(
        &self,
        ctx: &RequestContext,
        spec: &QuerySpec<T::Filters>,
        authz: &AuthorizationContext,
    ) -> Result<u64> {
        let authorized = self.authorized(spec, authz).await?;
        self.collection.count(ctx, &authorized.filter()).await
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        spec: &QuerySpec<T::Filters>,
        authz: &AuthorizationContext,
    ) -> Result<Vec<T>> {
        let plan = self.plan(spec, authz).await?;
        self.load(ctx, &plan).await
    }

    async fn load(&self, ctx: &RequestContext, plan: &QueryPlan) -> Result<Vec<T>> {
        let docs = self.collection.find(ctx, &plan.find_spec()).await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }

    fn finish<R>(&self, start: Instant, out: &Result<R>) {
        let elapsed = start.elapsed();
        metrics::record_pipeline(elapsed, out.is_ok());
        match out {
            Ok(_) => tracing::debug!(
                target: "kennel::pipeline",
                entity = T::DESCRIPTOR.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "query executed"
            ),
            Err(err) => tracing::warn!(
                target: "kennel::pipeline",
                entity = T::DESCRIPTOR.name,
                error = %err,
                "query failed"
            ),
        }
    }

    /// Filter and authorize. The only path to an [`Authorized`] stage.
    async fn authorized(
        &self,
        spec: &QuerySpec<T::Filters>,
        authz: &AuthorizationContext,
    ) -> Result<Authorized> {
        spec.validate()?;
        let filtered = self.filtered(spec)?;
        let entity = T::DESCRIPTOR;
        if let Some(permission) = entity.read_permission {
            if !self.authorizer.authorize(authz, permission).await? {
                return Err(Error::Forbidden {
                    permission: permission.to_string(),
                });
            }
        }
        let access = self.authorizer.build_filter_for(entity, authz).await?;
        Ok(filtered.authorize(access))
    }

    fn filtered(&self, spec: &QuerySpec<T::Filters>) -> Result<Filtered> {
        let mut builder = FilterBuilder::new();
        T::filter(&spec.filters, &mut builder);
        if let Some(text) = spec.free_text() {
            builder.push(self.text_predicate(text)?);
        }
        Ok(Filtered {
            entity: builder.build(),
        })
    }

    /// Every term must match; a term matches through any of its synonyms.
    fn text_predicate(&self, text: &str) -> Result<Predicate> {
        if self.options.text_search == TextSearchMode::Pattern
            && T::DESCRIPTOR.text_fields.is_empty()
        {
            return Err(Error::validation(
                "query",
                format!("{} has no text fields to match", T::DESCRIPTOR.name),
            ));
        }
        let terms: Vec<Vec<String>> = text
            .split_whitespace()
            .map(|term| match &self.synonyms {
                Some(set) => set.expand(term),
                None => vec![term.to_string()],
            })
            .collect();
        let per_term: Vec<Predicate> = terms
            .into_iter()
            .map(|alternatives| match self.options.text_search {
                TextSearchMode::Index => {
                    let mut any: Vec<Predicate> = alternatives
                        .into_iter()
                        .map(|alt| match &self.options.language {
                            Some(lang) => Predicate::text_lang(alt, lang.clone()),
                            None => Predicate::text(alt),
                        })
                        .collect();
                    if any.len() == 1 {
                        any.remove(0)
                    } else {
                        Predicate::Or(any)
                    }
                }
                TextSearchMode::Pattern => {
                    let pattern = alternatives
                        .iter()
                        .map(|alt| regex::escape(alt))
                        .collect::<Vec<_>>()
                        .join("|");
                    Predicate::Or(
                        T::DESCRIPTOR
                            .text_fields
                            .iter()
                            .map(|field| Predicate::iregex(*field, format!("({pattern})")))
                            .collect(),
                    )
                }
            })
            .collect();
        Ok(if per_term.len() == 1 {
            per_term.into_iter().next().unwrap_or_default()
        } else {
            Predicate::And(per_term)
        })
    }

    /// Caller keys (or creation time), then the primary key as tiebreak.
    fn sort_specs(&self, spec: &QuerySpec<T::Filters>) -> Result<Vec<SortSpec>> {
        let entity = T::DESCRIPTOR;
        let mut sort = Vec::with_capacity(spec.sort_by.len() + 1);
        if spec.sort_by.is_empty() {
            sort.push(SortSpec::asc(entity.created_at));
        } else {
            for key in &spec.sort_by {
                let mut resolved = FieldProjector::resolve_sort_key(entity, key)?;
                if spec.sort_descending {
                    resolved.direction = SortDirection::Desc;
                }
                sort.push(resolved);
            }
        }
        let pk = JsonPath::from(entity.primary_key);
        if !sort.iter().any(|s| s.path == pk) {
            sort.push(SortSpec::asc(pk));
        }
        Ok(sort)
    }

    fn page_bounds(&self, spec: &QuerySpec<T::Filters>) -> Result<(u64, Option<u64>)> {
        let page_size = spec.page_size as u64;
        if page_size == 0 {
            if !self.options.allow_unlimited {
                return Err(Error::validation(
                    "pageSize",
                    "must be positive for this pipeline",
                ));
            }
            return Ok((0, None));
        }
        if page_size > self.options.max_page_size {
            return Err(Error::validation(
                "pageSize",
                format!("must not exceed {}", self.options.max_page_size),
            ));
        }
        let page = (spec.offset - 1).max(0) as u64;
        let skip = page
            .checked_mul(page_size)
            .filter(|skip| i64::try_from(*skip).is_ok())
            .ok_or_else(|| Error::validation("offset", "page offset out of range"))?;
        Ok((skip, Some(page_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_fields;
    use crate::memory::MemoryCollection;
    use crate::query::SortKind;
    use crate::testing::StaticAuthorizer;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Pet {
        id: Uuid,
        name: Option<String>,
    }

    #[derive(Default)]
    struct PetFilters {
        species: Vec<String>,
    }

    impl Entity for Pet {
        const DESCRIPTOR: &'static EntityDescriptor = &EntityDescriptor {
            name: "Pet",
            collection: "pets",
            primary_key: "id",
            created_at: "createdAt",
            fields: entity_fields! {
                "id" => "id": Id,
                "name" => "name": Text,
                "age" => "ageMonths": Number,
                "createdAt" => "createdAt": Timestamp,
            },
            text_fields: &["name", "description"],
            read_permission: None,
        }
        .checked();
    }

    impl EntityQuery for Pet {
        type Filters = PetFilters;

        fn filter(filters: &PetFilters, builder: &mut FilterBuilder) {
            builder.one_of("species", &filters.species);
        }
    }

    fn pipeline(access: AccessFilter) -> QueryPipeline<Pet> {
        let raw = MemoryCollection::new("pets");
        QueryPipeline::new(
            ScopedCollection::new(Arc::new(raw)),
            Arc::new(StaticAuthorizer::new(access)),
        )
    }

    #[tokio::test]
    async fn plan_sorts_with_tiebreak_and_pages() {
        let plan = pipeline(AccessFilter::AllowAll)
            .plan(&QuerySpec::page(3, 10), &AuthorizationContext::new("u"))
            .await
            .unwrap();
        assert_eq!(plan.sort, vec![SortSpec::asc("createdAt"), SortSpec::asc("id")]);
        assert_eq!((plan.skip, plan.limit), (20, Some(10)));
        assert_eq!(plan.filter, Predicate::True);
    }

    #[tokio::test]
    async fn descending_keys_keep_ascending_tiebreak() {
        let spec = QuerySpec::page(1, 5).sort_by(["age"], true);
        let plan = pipeline(AccessFilter::AllowAll)
            .plan(&spec, &AuthorizationContext::new("u"))
            .await
            .unwrap();
        assert_eq!(plan.sort[0].direction, SortDirection::Desc);
        assert_eq!(plan.sort[0].kind, SortKind::Numeric);
        assert_eq!(plan.sort[1], SortSpec::asc("id"));
    }

    #[tokio::test]
    async fn access_filter_is_a_separate_conjunct() {
        let access = Predicate::eq("shelterId", "s-1");
        let spec = QuerySpec::page(1, 5).filters(PetFilters {
            species: vec!["dog".into()],
        });
        let plan = pipeline(AccessFilter::Restrict(access.clone()))
            .plan(&spec, &AuthorizationContext::new("u"))
            .await
            .unwrap();
        let entity = Predicate::r#in("species", ["dog"]);
        assert_eq!(plan.entity_filter, entity);
        assert_eq!(plan.filter, Predicate::And(vec![entity, access]));
    }

    #[tokio::test]
    async fn unlimited_pages_need_a_trusted_pipeline() {
        let authz = AuthorizationContext::new("u");
        let spec = QuerySpec::page(1, 0);
        let err = pipeline(AccessFilter::AllowAll)
            .plan(&spec, &authz)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let trusted = pipeline(AccessFilter::AllowAll).with_options(PipelineOptions {
            allow_unlimited: true,
            ..PipelineOptions::default()
        });
        let plan = trusted.plan(&spec, &authz).await.unwrap();
        assert_eq!((plan.skip, plan.limit), (0, None));
    }

    #[tokio::test]
    async fn malformed_specs_fail_before_the_store() {
        let authz = AuthorizationContext::new("u");
        let p = pipeline(AccessFilter::AllowAll);
        assert!(p.plan(&QuerySpec::page(-1, 10), &authz).await.is_err());
        assert!(p.plan(&QuerySpec::page(1, -10), &authz).await.is_err());
        let unknown = QuerySpec::page(1, 10).sort_by(["colour"], false);
        assert!(p.plan(&unknown, &authz).await.is_err());
    }

    #[tokio::test]
    async fn far_pages_are_rejected_instead_of_overflowing() {
        let authz = AuthorizationContext::new("u");
        let err = pipeline(AccessFilter::AllowAll)
            .plan(&QuerySpec::page(i64::MAX, 500), &authz)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "offset"));

        let roomy = pipeline(AccessFilter::AllowAll).with_options(PipelineOptions {
            max_page_size: u64::MAX,
            ..PipelineOptions::default()
        });
        let err = roomy
            .plan(&QuerySpec::page(i64::MAX / 2, i64::MAX), &authz)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "offset"));

        let plan = roomy
            .plan(&QuerySpec::page(2, i64::MAX), &authz)
            .await
            .unwrap();
        assert_eq!(plan.skip, i64::MAX as u64);
    }

    #[derive(Debug, Deserialize)]
    struct Badge {
        #[allow(dead_code)]
        id: Uuid,
    }

    impl Entity for Badge {
        const DESCRIPTOR: &'static EntityDescriptor = &EntityDescriptor {
            name: "Badge",
            collection: "badges",
            primary_key: "id",
            created_at: "createdAt",
            fields: entity_fields! {
                "id" => "id": Id,
                "createdAt" => "createdAt": Timestamp,
            },
            text_fields: &[],
            read_permission: None,
        }
        .checked();
    }

    impl EntityQuery for Badge {
        type Filters = ();

        fn filter(_: &(), _: &mut FilterBuilder) {}
    }

    #[tokio::test]
    async fn pattern_search_needs_text_fields() {
        let p: QueryPipeline<Badge> = QueryPipeline::new(
            ScopedCollection::new(Arc::new(MemoryCollection::new("badges"))),
            Arc::new(StaticAuthorizer::allow_all()),
        )
        .with_options(PipelineOptions {
            text_search: TextSearchMode::Pattern,
            ..PipelineOptions::default()
        });
        let err = p
            .plan(&QuerySpec::page(1, 10).query("gold"), &AuthorizationContext::new("u"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "query"));

        let plan = p
            .plan(&QuerySpec::page(1, 10), &AuthorizationContext::new("u"))
            .await
            .unwrap();
        assert_eq!(plan.filter, Predicate::True);
    }

    #[tokio::test]
    async fn pattern_mode_searches_text_fields() {
        let p = pipeline(AccessFilter::AllowAll).with_options(PipelineOptions {
            text_search: TextSearchMode::Pattern,
            ..PipelineOptions::default()
        });
        let plan = p
            .plan(&QuerySpec::page(1, 10).query("a.b"), &AuthorizationContext::new("u"))
            .await
            .unwrap();
        assert_eq!(
            plan.filter,
            Predicate::Or(vec![
                Predicate::iregex("name", r"(a\.b)"),
                Predicate::iregex("description", r"(a\.b)"),
            ])
        );
    }

    #[tokio::test]
    async fn execute_materializes_projected_documents() {
        let raw = MemoryCollection::new("pets");
        raw.seed(vec![
            json!({"name": "Biscuit", "createdAt": "2024-01-02", "ageMonths": 3}),
            json!({"name": "Pepper", "createdAt": "2024-01-01", "ageMonths": 9}),
        ])
        .unwrap();
        let p: QueryPipeline<Pet> = QueryPipeline::new(
            ScopedCollection::new(Arc::new(raw)),
            Arc::new(StaticAuthorizer::allow_all()),
        );
        let pets = p
            .execute(
                &RequestContext::detached(),
                &QuerySpec::page(1, 10).fields(["name"]),
                &AuthorizationContext::new("u"),
            )
            .await
            .unwrap();
        let names: Vec<_> = pets.iter().map(|p| p.name.clone().unwrap_or_default()).collect();
        assert_eq!(names, ["Pepper", "Biscuit"]);
        assert!(pets.iter().all(|p| !p.id.is_nil()));
    }

    #[test]
    fn query_spec_reads_camel_case_with_flattened_filters() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        struct ByBreed {
            #[serde(default)]
            breed_ids: Vec<Uuid>,
        }
        let spec: QuerySpec<ByBreed> = serde_json::from_value(json!({
            "offset": 2,
            "pageSize": 25,
            "fields": ["name"],
            "sortBy": ["name"],
            "sortDescending": true,
            "query": null,
            "breedIds": []
        }))
        .unwrap();
        assert_eq!(spec.page_size, 25);
        assert!(spec.sort_descending);
        assert!(spec.filters.breed_ids.is_empty());
    }
}
