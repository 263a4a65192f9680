//! Search indexes on Postgres.
//!
//! Vector indexes are pgvector HNSW expression indexes, lexical and synonym
//! indexes are GIN indexes over the concatenated per-analyzer `to_tsvector`,
//! and autocomplete indexes are `pg_trgm` GIN indexes.
//!
//! Every managed index is registered in the `kennel_search_indexes` catalog
//! table before its build starts, so an interrupted `create index
//! concurrently` still shows up in listings as not queryable. Creation waits
//! for the build to finish.

use async_trait::async_trait;
use indoc::formatdoc;
use sqlx::{PgPool, types::Json};

use super::{IndexDefinition, IndexKind, SearchAdmin, SearchCommand, SearchIndexStatus, SearchReply, Similarity};
use crate::{
    Error, Result,
    query::JsonPath,
    schema::{SEARCH_CATALOG, qualified_name, quote_ident},
};

/// SQLSTATEs meaning the store cannot host the requested index at all.
const UNAVAILABLE_STATES: &[&str] = &[
    "0A000", // feature_not_supported
    "58P01", // undefined_file
    "42704", // undefined_object
    "42501", // insufficient_privilege
];

const DUPLICATE_TABLE: &str = "42P07";
const UNDEFINED_TABLE: &str = "42P01";

/// Catalog registration plus what `pg_index` says about the same name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct BuildState {
    registered: bool,
    present: bool,
    valid: bool,
    building: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum CreateStep {
    Skip,
    Build { drop_leftover: bool },
}

impl BuildState {
    fn needs_rebuild(&self) -> bool {
        !self.valid && !self.building
    }

    /// A registered valid index, or one being built right now, is left
    /// alone. Anything else under the name is replaced.
    fn next_step(&self) -> CreateStep {
        if self.building || (self.registered && self.valid) {
            CreateStep::Skip
        } else {
            CreateStep::Build {
                drop_leftover: self.present,
            }
        }
    }
}

#[derive(Clone)]
pub struct PgSearchAdmin {
    pool: PgPool,
    schema: String,
}

impl PgSearchAdmin {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn catalog(&self) -> String {
        qualified_name(&self.schema, SEARCH_CATALOG)
    }

    async fn create(&self, collection: &str, def: &IndexDefinition) -> Result<()> {
        if let Some(extension) = required_extension(def.kind) {
            let installed: bool = sqlx::query_scalar(
                "select exists (select 1 from pg_extension where extname = $1)",
            )
            .bind(extension)
            .fetch_one(&self.pool)
            .await?;
            if !installed {
                return Err(Error::SearchUnavailable {
                    command: "createSearchIndexes".to_string(),
                    detail: format!("extension `{extension}` is not installed"),
                });
            }
        }
        for analyzer in analyzers_used(def) {
            let known: bool =
                sqlx::query_scalar("select exists (select 1 from pg_ts_config where cfgname = $1)")
                    .bind(analyzer)
                    .fetch_one(&self.pool)
                    .await?;
            if !known {
                return Err(Error::configuration(format!(
                    "text search configuration `{analyzer}` does not exist"
                )));
            }
        }
        let build = search_index_sql(&self.schema, collection, def)?;

        let state = self.build_state(collection, &def.name).await?;
        let drop_leftover = match state.next_step() {
            CreateStep::Skip => {
                return Err(Error::IndexAlreadyExists {
                    name: def.name.clone(),
                });
            }
            CreateStep::Build { drop_leftover } => drop_leftover,
        };
        if drop_leftover {
            tracing::warn!(
                target: "kennel::search",
                index = %def.name,
                registered = state.registered,
                valid = state.valid,
                "replacing leftover index"
            );
            self.drop_physical(&def.name).await?;
        }

        self.register(collection, def).await?;
        tracing::info!(target: "kennel::search", index = %def.name, kind = def.kind.as_str(), "building search index");
        sqlx::raw_sql(&build).execute(&self.pool).await?;
        tracing::info!(target: "kennel::search", index = %def.name, "search index built");
        Ok(())
    }

    /// Indexes are schema-wide, so a name registered for another collection
    /// is a conflict rather than a leftover.
    async fn build_state(&self, collection: &str, name: &str) -> Result<BuildState> {
        let sql = formatdoc!(
            "
            select (select s.collection from {catalog} s where s.name = $2 limit 1),
                   i.indexrelid is not null,
                   coalesce(i.indisvalid and i.indisready, false),
                   exists (
                       select 1 from pg_stat_progress_create_index p
                        where p.index_relid = i.indexrelid
                   )
              from (select 1) as one
              left join pg_namespace n on n.nspname = $1
              left join pg_class c
                     on c.relnamespace = n.oid and c.relname = $2 and c.relkind = 'i'
              left join pg_index i on i.indexrelid = c.oid
            ",
            catalog = self.catalog(),
        );
        let (owner, present, valid, building): (Option<String>, bool, bool, bool) =
            sqlx::query_as(&sql)
                .bind(&self.schema)
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        if let Some(owner) = owner.as_deref().filter(|owner| *owner != collection) {
            return Err(Error::IndexConflict {
                collection: collection.to_string(),
                detail: format!("search index `{name}` is registered for `{owner}`"),
            });
        }
        Ok(BuildState {
            registered: owner.is_some(),
            present,
            valid,
            building,
        })
    }

    async fn register(&self, collection: &str, def: &IndexDefinition) -> Result<()> {
        let sql = formatdoc!(
            "
            insert into {catalog} (collection, name, kind, definition)
            values ($1, $2, $3, $4)
            on conflict (collection, name) do update
               set kind = excluded.kind,
                   definition = excluded.definition,
                   requested_at = now()
            ",
            catalog = self.catalog(),
        );
        sqlx::query(&sql)
            .bind(collection)
            .bind(&def.name)
            .bind(def.kind.as_str())
            .bind(Json(def))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, collection: &str, name: Option<&str>) -> Result<Vec<SearchIndexStatus>> {
        let sql = formatdoc!(
            "
            select s.name,
                   s.kind,
                   i.indexrelid is not null,
                   coalesce(i.indisvalid and i.indisready, false),
                   exists (
                       select 1 from pg_stat_progress_create_index p
                        where p.index_relid = i.indexrelid
                   )
              from {catalog} s
              left join pg_namespace n on n.nspname = $1
              left join pg_class c
                     on c.relnamespace = n.oid and c.relname = s.name and c.relkind = 'i'
              left join pg_index i on i.indexrelid = c.oid
             where s.collection = $2
               and ($3::text is null or s.name = $3)
             order by s.name
            ",
            catalog = self.catalog(),
        );
        let rows: Vec<(String, String, bool, bool, bool)> = sqlx::query_as(&sql)
            .bind(&self.schema)
            .bind(collection)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(name, kind, present, valid, building)| {
                let state = BuildState {
                    registered: true,
                    present,
                    valid,
                    building,
                };
                Some(SearchIndexStatus {
                    name,
                    kind: IndexKind::parse(&kind)?,
                    queryable: valid,
                    needs_rebuild: state.needs_rebuild(),
                })
            })
            .collect())
    }

    /// Drops a registered index whatever its build state. Unregistered
    /// indexes of the same name are not ours and stay.
    async fn drop(&self, collection: &str, name: &str) -> Result<()> {
        let registered: bool = sqlx::query_scalar(&format!(
            "select exists (select 1 from {} where collection = $1 and name = $2)",
            self.catalog()
        ))
        .bind(collection)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        if !registered {
            return Ok(());
        }
        self.drop_physical(name).await?;
        sqlx::query(&format!(
            "delete from {} where collection = $1 and name = $2",
            self.catalog()
        ))
        .bind(collection)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_physical(&self, name: &str) -> Result<()> {
        let sql = format!(
            "drop index concurrently if exists {}",
            qualified_name(&self.schema, name)
        );
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SearchAdmin for PgSearchAdmin {
    async fn execute(&self, command: &SearchCommand) -> Result<SearchReply> {
        let reply = match command {
            SearchCommand::Create {
                collection,
                definitions,
                ..
            } => {
                let mut names = Vec::with_capacity(definitions.len());
                for def in definitions {
                    self.create(collection, def)
                        .await
                        .map_err(|e| classify(command.name(), &def.name, e))?;
                    names.push(def.name.clone());
                }
                SearchReply::Created(names)
            }
            SearchCommand::List { collection, name } => SearchReply::Listed(
                self.list(collection, name.as_deref())
                    .await
                    .map_err(|e| classify(command.name(), "", e))?,
            ),
            SearchCommand::Drop { collection, name } => {
                self.drop(collection, name)
                    .await
                    .map_err(|e| classify(command.name(), name, e))?;
                SearchReply::Dropped
            }
        };
        Ok(reply)
    }
}

/// Map server errors onto the search error taxonomy.
fn classify(command: &str, index: &str, err: Error) -> Error {
    match err.sql_state().as_deref() {
        Some(DUPLICATE_TABLE) => Error::IndexAlreadyExists {
            name: index.to_string(),
        },
        Some(UNDEFINED_TABLE) => Error::configuration(format!(
            "`{command}` needs a synced schema: {err}"
        )),
        Some(state) if UNAVAILABLE_STATES.contains(&state) => Error::SearchUnavailable {
            command: command.to_string(),
            detail: err.to_string(),
        },
        _ => err,
    }
}

fn required_extension(kind: IndexKind) -> Option<&'static str> {
    match kind {
        IndexKind::Vector => Some("vector"),
        IndexKind::Autocomplete => Some("pg_trgm"),
        _ => None,
    }
}

fn analyzers_used(def: &IndexDefinition) -> &[String] {
    match def.kind {
        IndexKind::Lexical | IndexKind::Synonym => &def.analyzers,
        _ => &[],
    }
}

fn concatenated(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("coalesce(doc #>> {}, '')", JsonPath::from(f).sql_literal()))
        .collect::<Vec<_>>()
        .join(" || ' ' || ")
}

/// `create index concurrently` statement for a search index.
pub(crate) fn search_index_sql(schema: &str, collection: &str, def: &IndexDefinition) -> Result<String> {
    def.validate()?;
    let table = qualified_name(schema, collection);
    let name = quote_ident(&def.name);
    let sql = match def.kind {
        IndexKind::Vector => {
            let params = def
                .vector
                .ok_or_else(|| Error::validation("vector", "missing vector parameters"))?;
            let opclass = match params.similarity {
                Similarity::Cosine => "vector_cosine_ops",
                Similarity::Euclidean => "vector_l2_ops",
                Similarity::DotProduct => "vector_ip_ops",
            };
            format!(
                "create index concurrently {name} on {table} using hnsw (((doc #> {})::text::vector({})) {opclass})",
                JsonPath::from(&def.fields[0]).sql_literal(),
                params.dimensions,
            )
        }
        IndexKind::Lexical | IndexKind::Synonym => {
            let text = concatenated(&def.fields);
            let vectors: Vec<String> = def
                .analyzers
                .iter()
                .map(|a| format!("to_tsvector('{a}'::regconfig, {text})"))
                .collect();
            format!(
                "create index concurrently {name} on {table} using gin (({}))",
                vectors.join(" || ")
            )
        }
        IndexKind::Autocomplete => format!(
            "create index concurrently {name} on {table} using gin ((lower({})) gin_trgm_ops)",
            concatenated(&def.fields)
        ),
        IndexKind::PlainRegex => {
            return Err(Error::validation(
                "kind",
                "plain regex indexes are created through the collection driver",
            ));
        }
    };
    Ok(sql)
}
