use std::collections::HashSet;

use crate::{Error, Result, WithContext};
use indoc::formatdoc;
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.schema.trim();
        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let schema_exists = self.existing_schemas().await?.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let (existing_tables, existing_indexes, existing_triggers, existing_functions) =
            if schema_exists {
                (
                    self.existing_tables(schema).await?,
                    self.existing_indexes(schema).await?,
                    self.existing_triggers(schema).await?,
                    self.existing_functions(schema).await?,
                )
            } else {
                (HashSet::new(), HashSet::new(), HashSet::new(), HashSet::new())
            };

        for (function, build_sql) in [
            (SEARCH_FN, build_search_fn_sql as fn(&str) -> String),
            (CHANGE_FN, build_change_fn_sql),
        ] {
            if !existing_functions.contains(function) {
                plan.push_action(
                    format!("create function {}", qualified_name(schema, function)),
                    build_sql(schema),
                );
            }
        }

        ensure_table(&mut plan, schema, &existing_tables, SEARCH_CATALOG, build_search_catalog_sql);

        let mut seen = HashSet::new();
        for collection in &config.collections {
            let collection = collection.trim();
            if collection.is_empty() {
                plan.push_warning("collection name is empty; skipping".to_string());
                continue;
            }
            if !seen.insert(collection.to_lowercase()) {
                plan.push_warning(format!(
                    "collection `{collection}` already planned; skipping duplicate entry"
                ));
                continue;
            }

            ensure_table(&mut plan, schema, &existing_tables, collection, |s| {
                build_collection_table_sql(s, collection)
            });
            let changes = changes_table(collection);
            ensure_table(&mut plan, schema, &existing_tables, &changes, |s| {
                build_changes_table_sql(s, collection)
            });
            ensure_index(
                &mut plan,
                schema,
                &existing_indexes,
                &format!("{collection}_doc_gin"),
                |s| build_doc_index_sql(s, collection),
            );
            ensure_index(
                &mut plan,
                schema,
                &existing_indexes,
                &format!("{collection}_search_gin"),
                |s| build_search_index_sql(s, collection),
            );
            ensure_trigger(
                &mut plan,
                schema,
                &existing_triggers,
                &format!("{collection}_search_biu"),
                |s| build_search_trigger_sql(s, collection),
            );
            ensure_trigger(
                &mut plan,
                schema,
                &existing_triggers,
                &format!("{collection}_changes_aiud"),
                |s| build_change_trigger_sql(s, collection),
            );
        }

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql())
                .execute(&mut *tx)
                .await
                .map_err(Error::from)
                .context(action.description())?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname::text from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_functions(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"select p.proname::text from pg_proc p
                 join pg_namespace n on n.oid = p.pronamespace
                where n.nspname = $1"#,
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_triggers(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"select t.tgname::text from pg_trigger t
                 join pg_class c on c.oid = t.tgrelid
                 join pg_namespace n on n.oid = c.relnamespace
                where n.nspname = $1 and not t.tgisinternal"#,
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub schema: String,
    pub collections: Vec<String>,
}

impl SchemaConfig {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            collections: Vec::new(),
        }
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self::new("public")
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

const SEARCH_FN: &str = "kennel_search_update";
const CHANGE_FN: &str = "kennel_capture_change";
/// Search indexes this crate manages, registered before each build starts.
pub(crate) const SEARCH_CATALOG: &str = "kennel_search_indexes";

pub(crate) fn changes_table(collection: &str) -> String {
    format!("{collection}__changes")
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_indexes: &HashSet<String>,
    index: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_indexes.contains(index) {
        plan.push_action(
            format!("create index {}", qualified_name(schema, index)),
            build_sql(schema),
        );
    }
}

fn ensure_trigger<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_triggers: &HashSet<String>,
    trigger: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_triggers.contains(trigger) {
        plan.push_action(
            format!("create trigger {} in {}", quote_ident(trigger), quote_ident(schema)),
            build_sql(schema),
        );
    }
}

fn build_search_catalog_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            collection text not null,
            name text not null,
            kind text not null,
            definition jsonb not null,
            requested_at timestamptz not null default now(),
            primary key (collection, name)
        )
        ",
        table = qualified_name(schema, SEARCH_CATALOG),
    )
}

fn build_collection_table_sql(schema: &str, collection: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id uuid primary key,
            doc jsonb not null,
            version int not null default 1,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            search tsvector null
        )
        ",
        table = qualified_name(schema, collection),
    )
}

fn build_changes_table_sql(schema: &str, collection: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            seq bigserial primary key,
            doc_id uuid not null,
            op text not null,
            doc jsonb not null,
            at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, &changes_table(collection)),
    )
}

fn build_doc_index_sql(schema: &str, collection: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index} on {table}
            using gin (doc)
        ",
        index = quote_ident(&format!("{collection}_doc_gin")),
        table = qualified_name(schema, collection),
    )
}

fn build_search_index_sql(schema: &str, collection: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index} on {table}
            using gin (search)
        ",
        index = quote_ident(&format!("{collection}_search_gin")),
        table = qualified_name(schema, collection),
    )
}

fn build_search_fn_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create or replace function {fn}() returns trigger as $$
        begin
          new.search := jsonb_to_tsvector('english', new.doc, '["string"]');
          return new;
        end;
        $$ language plpgsql;
        "#,
        fn = qualified_name(schema, SEARCH_FN),
    )
}

fn build_change_fn_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create or replace function {fn}() returns trigger as $$
        begin
          if TG_OP = 'DELETE' then
            execute format('insert into %I.%I(doc_id, op, doc) values ($1, $2, $3)',
                           TG_TABLE_SCHEMA, TG_TABLE_NAME || '__changes')
              using old.id, 'delete', old.doc;
            return old;
          end if;
          execute format('insert into %I.%I(doc_id, op, doc) values ($1, $2, $3)',
                         TG_TABLE_SCHEMA, TG_TABLE_NAME || '__changes')
            using new.id, lower(TG_OP), new.doc;
          return new;
        end;
        $$ language plpgsql;
        "#,
        fn = qualified_name(schema, CHANGE_FN),
    )
}

fn build_search_trigger_sql(schema: &str, collection: &str) -> String {
    formatdoc!(
        "
        create trigger {trigger} before insert or update of doc on {table}
            for each row execute function {fn}()
        ",
        trigger = quote_ident(&format!("{collection}_search_biu")),
        table = qualified_name(schema, collection),
        fn = qualified_name(schema, SEARCH_FN),
    )
}

fn build_change_trigger_sql(schema: &str, collection: &str) -> String {
    formatdoc!(
        "
        create trigger {trigger} after insert or update or delete on {table}
            for each row execute function {fn}()
        ",
        trigger = quote_ident(&format!("{collection}_changes_aiud")),
        table = qualified_name(schema, collection),
        fn = qualified_name(schema, CHANGE_FN),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
