//! Postgres collection driver.
//!
//! Each collection is one table of `(id, doc jsonb, version, created_at,
//! updated_at, search tsvector)` plus a trigger-fed `<name>__changes` log.
//! Session-less calls run in a transaction of their own that is committed
//! before returning; session-bound calls run on the session's transaction and
//! leave commit to its owner.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, types::Json};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

use crate::{
    Error, Result,
    context::CallSignal,
    driver::{
        ChangeEvent, ChangeKind, ChangeStream, CollectionDriver, CollectionSettings, IndexKey,
        IndexModel, ReadConcern, ReadPreference, WatchOptions, WriteConcern,
        collection_operations, scoped_filter,
    },
    metrics,
    query::{FindSpec, Predicate, eval},
    schema::{changes_table, qualified_name, quote_ident},
    session::{PgTransaction, SessionHandle},
};

const SLOW_QUERY: Duration = Duration::from_millis(500);

/// Operations that may be served by a replica.
const READ_OPS: &[&str] = &[
    "find",
    "find_one",
    "count",
    "distinct",
    "aggregate",
    "map_reduce",
    "list_indexes",
];

#[derive(Clone)]
pub struct PgCollection {
    pool: PgPool,
    replica: Option<PgPool>,
    schema: String,
    name: String,
    settings: CollectionSettings,
    discriminator: Option<String>,
}

impl PgCollection {
    pub(crate) fn new(
        pool: PgPool,
        replica: Option<PgPool>,
        schema: impl Into<String>,
        name: impl Into<String>,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            pool,
            replica,
            schema: schema.into(),
            name: name.into(),
            settings,
            discriminator: None,
        }
    }

    fn table(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    fn changes_table(&self) -> String {
        qualified_name(&self.schema, &changes_table(&self.name))
    }

    fn filter(&self, filter: &Predicate) -> Predicate {
        scoped_filter(self.discriminator.as_deref(), filter)
    }

    /// Open the implicit transaction for a session-less call, applying the
    /// collection settings to it.
    async fn begin(&self, op: &str) -> Result<PgTransaction> {
        let pool = match (&self.replica, self.settings.read_preference) {
            (Some(replica), ReadPreference::Replica) if READ_OPS.contains(&op) => replica,
            _ => &self.pool,
        };
        let mut tx = pool.begin().await?;
        if self.settings.read_concern == ReadConcern::Snapshot {
            sqlx::query("set transaction isolation level repeatable read")
                .execute(&mut *tx)
                .await?;
        }
        if self.settings.write_concern == WriteConcern::Relaxed {
            sqlx::query("set local synchronous_commit = off")
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }
}

fn log_if_slow(start: Instant, sql: &str) {
    let elapsed = start.elapsed();
    if elapsed > SLOW_QUERY {
        metrics::record_slow_query();
        tracing::warn!(target: "kennel::slow_query", elapsed_ms = elapsed.as_millis() as u64, sql = %sql, "slow collection query");
    }
}

async fn fetch_values(
    conn: &mut PgConnection,
    mut builder: QueryBuilder<'_, Postgres>,
) -> Result<Vec<Value>> {
    let sql = builder.sql().to_string();
    let start = Instant::now();
    let rows = builder
        .build_query_as::<(Value,)>()
        .fetch_all(&mut *conn)
        .await?;
    log_if_slow(start, &sql);
    Ok(rows.into_iter().map(|(value,)| value).collect())
}

async fn fetch_row(
    conn: &mut PgConnection,
    mut builder: QueryBuilder<'_, Postgres>,
) -> Result<Option<(Uuid, Value)>> {
    let sql = builder.sql().to_string();
    let start = Instant::now();
    let row = builder
        .build_query_as::<(Uuid, Value)>()
        .fetch_optional(&mut *conn)
        .await?;
    log_if_slow(start, &sql);
    Ok(row)
}

async fn execute(conn: &mut PgConnection, mut builder: QueryBuilder<'_, Postgres>) -> Result<u64> {
    let sql = builder.sql().to_string();
    let start = Instant::now();
    let done = builder.build().execute(&mut *conn).await?;
    log_if_slow(start, &sql);
    Ok(done.rows_affected())
}

/// `create index` statement for an [`IndexModel`] on `table`.
pub(crate) fn index_sql(schema: &str, table: &str, model: &IndexModel) -> Result<String> {
    if model.keys.is_empty() {
        return Err(Error::validation("keys", "an index needs at least one key"));
    }
    let name = model.resolved_name(table);
    let target = qualified_name(schema, table);
    let text_keys = model.keys.iter().filter(|(_, k)| *k == IndexKey::Text).count();
    if text_keys > 0 {
        if text_keys != model.keys.len() {
            return Err(Error::validation(
                "keys",
                "text keys cannot be mixed with ordered keys",
            ));
        }
        let parts: Vec<String> = model
            .keys
            .iter()
            .map(|(path, _)| format!("coalesce(doc #>> {}, '')", path.sql_literal()))
            .collect();
        return Ok(format!(
            "create index if not exists {} on {target} using gin (to_tsvector('simple', {}))",
            quote_ident(&name),
            parts.join(" || ' ' || "),
        ));
    }
    let columns: Vec<String> = model
        .keys
        .iter()
        .map(|(path, key)| {
            let path = path.sql_literal();
            match key {
                IndexKey::Ascending => format!("(doc #>> {path}) asc"),
                IndexKey::Descending => format!("(doc #>> {path}) desc"),
                IndexKey::CaseInsensitive => format!("lower(doc #>> {path}) text_pattern_ops"),
                IndexKey::Text => unreachable!("text keys handled above"),
            }
        })
        .collect();
    Ok(format!(
        "create {}index if not exists {} on {target} ({})",
        if model.unique { "unique " } else { "" },
        quote_ident(&name),
        columns.join(", "),
    ))
}

fn change_kind(op: &str) -> ChangeKind {
    match op {
        "insert" => ChangeKind::Insert,
        "delete" => ChangeKind::Delete,
        _ => ChangeKind::Update,
    }
}

mod ops {
    use super::*;
    use crate::driver::{
        BulkWriteOutcome, Document, FindAndModify, IndexInfo, ReturnDocument, UpdateOutcome,
        WriteModel, prepare_insert, prepare_replacement,
    };
    use crate::query::{Aggregation, JsonPath, MapReduce, Update};

    fn select_for_update(
        coll: &PgCollection,
        filter: &Predicate,
        options: &FindAndModify,
    ) -> QueryBuilder<'static, Postgres> {
        let spec = FindSpec {
            filter: coll.filter(filter),
            sort: options.sort.clone(),
            skip: 0,
            limit: Some(1),
            projection: None,
        };
        let mut qb = QueryBuilder::new("select id, doc from ");
        qb.push(coll.table());
        qb.push(" where ");
        spec.filter.push_sql(&mut qb);
        spec.push_order_and_page(&mut qb);
        qb.push(" for update");
        qb
    }

    async fn set_doc(
        coll: &PgCollection,
        conn: &mut PgConnection,
        id: Uuid,
        doc: Document,
    ) -> Result<Document> {
        let mut qb = QueryBuilder::new("update ");
        qb.push(coll.table());
        qb.push(" set doc = ");
        qb.push_bind(Json(doc));
        qb.push(", version = version + 1, updated_at = now() where id = ");
        qb.push_bind(id);
        qb.push(" returning doc");
        Ok(fetch_values(conn, qb).await?.into_iter().next().unwrap_or(Value::Null))
    }

    pub(super) async fn find(
        coll: &PgCollection,
        conn: &mut PgConnection,
        spec: &FindSpec,
    ) -> Result<Vec<Document>> {
        let mut qb = QueryBuilder::new("select ");
        spec.push_selection(&mut qb);
        qb.push(" from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(&spec.filter).push_sql(&mut qb);
        spec.push_order_and_page(&mut qb);
        fetch_values(conn, qb).await
    }

    pub(super) async fn find_one(
        coll: &PgCollection,
        conn: &mut PgConnection,
        spec: &FindSpec,
    ) -> Result<Option<Document>> {
        let spec = spec.clone().limit(1);
        Ok(find(coll, conn, &spec).await?.into_iter().next())
    }

    pub(super) async fn count(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::new("select to_jsonb(count(*)) from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(filter).push_sql(&mut qb);
        let value = fetch_values(conn, qb).await?;
        Ok(value.first().and_then(Value::as_u64).unwrap_or(0))
    }

    pub(super) async fn distinct(
        coll: &PgCollection,
        conn: &mut PgConnection,
        field: &JsonPath,
        filter: &Predicate,
    ) -> Result<Vec<Value>> {
        let mut qb = QueryBuilder::new("select distinct v from (select doc #> ");
        qb.push_bind(field.parts().to_vec());
        qb.push(" as v from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(filter).push_sql(&mut qb);
        qb.push(") d where v is not null and v <> 'null'::jsonb order by v");
        fetch_values(conn, qb).await
    }

    pub(super) async fn aggregate(
        coll: &PgCollection,
        conn: &mut PgConnection,
        aggregation: &Aggregation,
    ) -> Result<Vec<Document>> {
        let scoped = Aggregation {
            filter: coll.filter(&aggregation.filter),
            ..aggregation.clone()
        };
        let mut qb = QueryBuilder::new("select ");
        scoped.push_selection(&mut qb);
        qb.push(" from ");
        qb.push(coll.table());
        qb.push(" where ");
        scoped.filter.push_sql(&mut qb);
        scoped.push_group_by(&mut qb);
        fetch_values(conn, qb).await
    }

    pub(super) async fn map_reduce(
        coll: &PgCollection,
        conn: &mut PgConnection,
        spec: &MapReduce,
    ) -> Result<Vec<Document>> {
        let mut qb = QueryBuilder::new("select ");
        spec.push_selection(&mut qb);
        qb.push(" from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(&spec.filter).push_sql(&mut qb);
        spec.push_group_by(&mut qb);
        fetch_values(conn, qb).await
    }

    pub(super) async fn insert_one(
        coll: &PgCollection,
        conn: &mut PgConnection,
        doc: Document,
    ) -> Result<Uuid> {
        Ok(insert_many(coll, conn, vec![doc]).await?.remove(0))
    }

    pub(super) async fn insert_many(
        coll: &PgCollection,
        conn: &mut PgConnection,
        docs: Vec<Document>,
    ) -> Result<Vec<Uuid>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = prepare_insert(&mut doc, coll.discriminator.as_deref())?;
            rows.push((id, doc));
        }
        let ids = rows.iter().map(|(id, _)| *id).collect();
        let mut qb = QueryBuilder::new("insert into ");
        qb.push(coll.table());
        qb.push(" (id, doc) ");
        qb.push_values(rows, |mut b, (id, doc)| {
            b.push_bind(id).push_bind(Json(doc));
        });
        execute(conn, qb).await?;
        Ok(ids)
    }

    pub(super) async fn replace_one(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
        mut doc: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let target = fetch_row(conn, select_for_update(coll, filter, &FindAndModify::default())).await?;
        match target {
            Some((id, _)) => {
                prepare_replacement(&mut doc, id, coll.discriminator.as_deref())?;
                set_doc(coll, conn, id, doc).await?;
                Ok(UpdateOutcome {
                    matched: 1,
                    modified: 1,
                    upserted_id: None,
                })
            }
            None if upsert => Ok(UpdateOutcome {
                upserted_id: Some(insert_one(coll, conn, doc).await?),
                ..UpdateOutcome::default()
            }),
            None => Ok(UpdateOutcome::default()),
        }
    }

    fn push_update(coll: &PgCollection, qb: &mut QueryBuilder<'_, Postgres>, update: &Update) {
        qb.push("update ");
        qb.push(coll.table());
        qb.push(" set doc = ");
        update.push_sql(qb);
        qb.push(", version = version + 1, updated_at = now() where ");
    }

    pub(super) async fn update_one(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        let mut qb = QueryBuilder::new("");
        push_update(coll, &mut qb, update);
        qb.push("id = (select id from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(filter).push_sql(&mut qb);
        qb.push(" limit 1 for update)");
        let n = execute(conn, qb).await?;
        Ok(UpdateOutcome {
            matched: n,
            modified: n,
            upserted_id: None,
        })
    }

    pub(super) async fn update_many(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        let mut qb = QueryBuilder::new("");
        push_update(coll, &mut qb, update);
        coll.filter(filter).push_sql(&mut qb);
        let n = execute(conn, qb).await?;
        Ok(UpdateOutcome {
            matched: n,
            modified: n,
            upserted_id: None,
        })
    }

    pub(super) async fn delete_one(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::new("delete from ");
        qb.push(coll.table());
        qb.push(" where id = (select id from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(filter).push_sql(&mut qb);
        qb.push(" limit 1 for update)");
        execute(conn, qb).await
    }

    pub(super) async fn delete_many(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::new("delete from ");
        qb.push(coll.table());
        qb.push(" where ");
        coll.filter(filter).push_sql(&mut qb);
        execute(conn, qb).await
    }

    pub(super) async fn bulk_write(
        coll: &PgCollection,
        conn: &mut PgConnection,
        models: Vec<WriteModel>,
    ) -> Result<BulkWriteOutcome> {
        let mut outcome = BulkWriteOutcome::default();
        for model in models {
            match model {
                WriteModel::InsertOne { doc } => {
                    insert_one(coll, &mut *conn, doc).await?;
                    outcome.inserted += 1;
                }
                WriteModel::UpdateOne { filter, update } => {
                    outcome.absorb(update_one(coll, &mut *conn, &filter, &update).await?)
                }
                WriteModel::UpdateMany { filter, update } => {
                    outcome.absorb(update_many(coll, &mut *conn, &filter, &update).await?)
                }
                WriteModel::ReplaceOne {
                    filter,
                    doc,
                    upsert,
                } => outcome.absorb(replace_one(coll, &mut *conn, &filter, doc, upsert).await?),
                WriteModel::DeleteOne { filter } => {
                    outcome.deleted += delete_one(coll, &mut *conn, &filter).await?
                }
                WriteModel::DeleteMany { filter } => {
                    outcome.deleted += delete_many(coll, &mut *conn, &filter).await?
                }
            }
        }
        Ok(outcome)
    }

    pub(super) async fn find_one_and_update(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
        update: &Update,
        options: &FindAndModify,
    ) -> Result<Option<Document>> {
        let Some((id, before)) = fetch_row(conn, select_for_update(coll, filter, options)).await?
        else {
            return Ok(None);
        };
        let mut qb = QueryBuilder::new("");
        push_update(coll, &mut qb, update);
        qb.push("id = ");
        qb.push_bind(id);
        qb.push(" returning doc");
        let after = fetch_values(conn, qb).await?.into_iter().next();
        Ok(match options.return_document {
            ReturnDocument::Before => Some(before),
            ReturnDocument::After => after,
        })
    }

    pub(super) async fn find_one_and_replace(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
        mut doc: Document,
        options: &FindAndModify,
    ) -> Result<Option<Document>> {
        match fetch_row(conn, select_for_update(coll, filter, options)).await? {
            Some((id, before)) => {
                prepare_replacement(&mut doc, id, coll.discriminator.as_deref())?;
                let after = set_doc(coll, conn, id, doc).await?;
                Ok(Some(match options.return_document {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => after,
                }))
            }
            None if options.upsert => {
                let id = prepare_insert(&mut doc, coll.discriminator.as_deref())?;
                let stored = doc.clone();
                let mut qb = QueryBuilder::new("insert into ");
                qb.push(coll.table());
                qb.push(" (id, doc) values (");
                qb.push_bind(id);
                qb.push(", ");
                qb.push_bind(Json(doc));
                qb.push(")");
                execute(conn, qb).await?;
                Ok(match options.return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(stored),
                })
            }
            None => Ok(None),
        }
    }

    pub(super) async fn find_one_and_delete(
        coll: &PgCollection,
        conn: &mut PgConnection,
        filter: &Predicate,
        options: &FindAndModify,
    ) -> Result<Option<Document>> {
        let Some((id, doc)) = fetch_row(conn, select_for_update(coll, filter, options)).await?
        else {
            return Ok(None);
        };
        let mut qb = QueryBuilder::new("delete from ");
        qb.push(coll.table());
        qb.push(" where id = ");
        qb.push_bind(id);
        execute(conn, qb).await?;
        Ok(Some(doc))
    }

    pub(super) async fn watch(
        coll: &PgCollection,
        conn: &mut PgConnection,
        options: &WatchOptions,
    ) -> Result<ChangeStream> {
        let start = match options.start_after {
            Some(seq) => seq,
            None => {
                let sql = format!("select coalesce(max(seq), 0) from {}", coll.changes_table());
                sqlx::query_scalar::<_, i64>(&sql)
                    .fetch_one(&mut *conn)
                    .await?
            }
        };
        let (tx, rx) = mpsc::channel::<ChangeEvent>(options.channel_capacity.max(1));
        let pool = coll.pool.clone();
        let sql = format!(
            "select seq, doc_id, op, doc, at from {} where seq > $1 order by seq asc limit $2",
            coll.changes_table()
        );
        let filter = coll.filter(&options.filter);
        let batch_size = options.batch_size;
        let poll_interval = options.poll_interval;
        let namespace = coll.name.clone();
        tokio::spawn(async move {
            let mut cursor = start;
            loop {
                if tx.is_closed() {
                    return;
                }
                let rows = sqlx::query_as::<_, (i64, Uuid, String, Value, DateTime<Utc>)>(&sql)
                    .bind(cursor)
                    .bind(batch_size)
                    .fetch_all(&pool)
                    .await;
                let rows = match rows {
                    Ok(rows) => rows,
                    Err(err) => {
                        tracing::warn!(target: "kennel::scoped", collection = %namespace, error = %err, "change poll failed");
                        sleep(poll_interval).await;
                        continue;
                    }
                };
                if rows.is_empty() {
                    sleep(poll_interval).await;
                    continue;
                }
                for (seq, doc_id, op, doc, at) in rows {
                    cursor = seq;
                    if !eval::matches(&filter, &doc).unwrap_or(false) {
                        continue;
                    }
                    let event = ChangeEvent {
                        seq,
                        kind: change_kind(&op),
                        doc_id,
                        doc,
                        at,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(ChangeStream::new(rx, start))
    }

    pub(super) async fn create_index(
        coll: &PgCollection,
        conn: &mut PgConnection,
        model: &IndexModel,
    ) -> Result<String> {
        let name = model.resolved_name(&coll.name);
        let sql = index_sql(&coll.schema, &coll.name, model)?;
        let start = Instant::now();
        sqlx::query(&sql).execute(&mut *conn).await?;
        log_if_slow(start, &sql);
        let owner: Option<String> = sqlx::query_scalar(
            "select tablename::text from pg_indexes where schemaname = $1 and indexname = $2",
        )
        .bind(&coll.schema)
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await?;
        match owner {
            Some(table) if table != coll.name => Err(Error::IndexConflict {
                collection: coll.name.clone(),
                detail: format!("`{name}` already exists on `{table}`"),
            }),
            _ => Ok(name),
        }
    }

    pub(super) async fn create_indexes(
        coll: &PgCollection,
        conn: &mut PgConnection,
        models: &[IndexModel],
    ) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(models.len());
        for model in models {
            names.push(create_index(coll, &mut *conn, model).await?);
        }
        Ok(names)
    }

    pub(super) async fn list_indexes(
        coll: &PgCollection,
        conn: &mut PgConnection,
    ) -> Result<Vec<IndexInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"select i.indexname::text, i.indexdef
                 from pg_indexes i
                where i.schemaname = $1 and i.tablename = $2
                  and coalesce(obj_description(format('%I.%I', i.schemaname, i.indexname)::regclass, 'pg_class'), '')
                      not like 'search:%'
                order by i.indexname"#,
        )
        .bind(&coll.schema)
        .bind(&coll.name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, definition)| IndexInfo {
                unique: definition.starts_with("CREATE UNIQUE"),
                name,
                definition,
            })
            .collect())
    }

    pub(super) async fn drop_index(
        coll: &PgCollection,
        conn: &mut PgConnection,
        name: &str,
    ) -> Result<()> {
        let known = list_indexes(coll, &mut *conn).await?;
        if !known.iter().any(|i| i.name == name) {
            return Err(Error::validation(
                "index",
                format!("index `{name}` not found on `{}`", coll.name),
            ));
        }
        let sql = format!("drop index if exists {}", qualified_name(&coll.schema, name));
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    pub(super) async fn drop_indexes(coll: &PgCollection, conn: &mut PgConnection) -> Result<()> {
        let builtin = [
            format!("{}_pkey", coll.name),
            format!("{}_doc_gin", coll.name),
            format!("{}_search_gin", coll.name),
        ];
        for index in list_indexes(coll, &mut *conn).await? {
            if builtin.contains(&index.name) {
                continue;
            }
            let sql = format!(
                "drop index if exists {}",
                qualified_name(&coll.schema, &index.name)
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

macro_rules! pg_driver {
    ($( $op:ident / $op_in:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty ; )*) => {
        #[async_trait]
        impl CollectionDriver for PgCollection {
            fn namespace(&self) -> &str {
                &self.name
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
                signal
                    .guard(async {
                        let estimate: Option<f32> = sqlx::query_scalar(
                            r#"select c.reltuples from pg_class c
                                 join pg_namespace n on n.oid = c.relnamespace
                                where n.nspname = $1 and c.relname = $2"#,
                        )
                        .bind(&self.schema)
                        .bind(&self.name)
                        .fetch_optional(&self.pool)
                        .await?;
                        Ok(estimate.map(|n| n.max(0.0) as u64).unwrap_or(0))
                    })
                    .await
            }

            $(
                async fn $op(&self, signal: &CallSignal, $($arg: $ty),*) -> Result<$ret> {
                    signal
                        .guard(async {
                            let mut tx = self.begin(stringify!($op)).await?;
                            let out = ops::$op(self, &mut tx, $($arg),*).await?;
                            tx.commit().await?;
                            Ok(out)
                        })
                        .await
                }

                async fn $op_in(
                    &self,
                    session: &SessionHandle,
                    signal: &CallSignal,
                    $($arg: $ty),*
                ) -> Result<$ret> {
                    signal
                        .guard(async {
                            let mut guard = session.transaction().await;
                            let tx = guard
                                .as_mut()
                                .ok_or(Error::SessionClosed { session: session.id() })?;
                            ops::$op(self, tx, $($arg),*).await
                        })
                        .await
                }
            )*
        }
    };
}

collection_operations!(pg_driver);
