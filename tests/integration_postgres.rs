use std::sync::Arc;

use anyhow::Result;
use kennel::{
    AuthorizationContext, CollectionSource, Entity, EntityDescriptor, EntityQuery, FilterBuilder,
    IndexDefinition, QueryPipeline, QuerySpec, RequestContext, Store, entity_fields,
    query::{FindSpec, Predicate, SortSpec, Update},
    testing::StaticAuthorizer,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use uuid::Uuid;

async fn start_store() -> Result<(ContainerAsync<GenericImage>, Store)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let store = Store::builder(&url)
        .schema("kennel")
        .collections(["pets", "owners"])
        .build()
        .await?;
    store.schema().sync(&store.schema_config()).await?;
    Ok((container, store))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Pet {
    id: Uuid,
    name: Option<String>,
    species: Option<String>,
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
            "species" => "species": Text,
            "shelter" => "shelterId": Reference,
            "createdAt" => "createdAt": Timestamp,
        },
        text_fields: &["name", "description"],
        read_permission: Some("pets:read"),
    }
    .checked();
}

impl EntityQuery for Pet {
    type Filters = ();

    fn filter(_: &(), _: &mut FilterBuilder) {}
}

fn pet(i: usize, species: &str, shelter: &str) -> Value {
    json!({
        "name": format!("pet-{i:02}"),
        "species": species,
        "shelterId": shelter,
        "description": if i == 3 { "playful terrier" } else { "calm companion" },
        "createdAt": format!("2024-02-{:02}T10:00:00Z", i + 1),
    })
}

#[tokio::test]
async fn collections_sessions_and_search() -> Result<()> {
    let (_container, store) = start_store().await?;
    let pets = store.collection::<Value>("pets")?;
    let ctx = RequestContext::detached();

    // schema sync is idempotent
    assert!(store.schema().plan(&store.schema_config()).await?.is_empty());
    assert!(store.collection::<Value>("invoices").unwrap_err().is_configuration());

    // plain CRUD
    let ids = pets
        .insert_many(
            &ctx,
            (0..6)
                .map(|i| pet(i, if i % 2 == 0 { "dog" } else { "cat" }, "north"))
                .collect(),
        )
        .await?;
    assert_eq!(ids.len(), 6);
    assert_eq!(pets.count(&ctx, &Predicate::eq("species", "dog")).await?, 3);
    let updated = pets
        .update_one(&ctx, &Predicate::eq("id", ids[0].to_string()), &Update::new().set("adopted", true))
        .await?;
    assert_eq!(updated.modified, 1);
    let first = pets
        .find_one(&ctx, &FindSpec::new(Predicate::eq("adopted", true)))
        .await?
        .expect("adopted pet");
    assert_eq!(first["name"], json!("pet-00"));
    let sorted = pets
        .find(&ctx, &FindSpec::all().sort(SortSpec::desc("name")).limit(2))
        .await?;
    assert_eq!(sorted[0]["name"], json!("pet-05"));

    // committed session writes become visible, aborted ones never do
    let session = store.begin_session().await?;
    let in_session = ctx.with_session(session.clone());
    pets.insert_one(&in_session, pet(10, "rabbit", "south")).await?;
    assert_eq!(pets.count(&in_session, &Predicate::eq("species", "rabbit")).await?, 1);
    assert_eq!(pets.count(&ctx, &Predicate::eq("species", "rabbit")).await?, 0);
    session.commit().await?;
    assert_eq!(pets.count(&ctx, &Predicate::eq("species", "rabbit")).await?, 1);

    let session = store.begin_session().await?;
    pets.delete_many(&ctx.with_session(session.clone()), &Predicate::True)
        .await?;
    session.abort().await?;
    assert_eq!(pets.count(&ctx, &Predicate::True).await?, 7);

    // pipeline with a row-level restriction
    let pipeline = QueryPipeline::<Pet>::new(
        store.collection("pets")?,
        Arc::new(StaticAuthorizer::restrict(Predicate::eq("shelterId", "north"))),
    );
    let authz = AuthorizationContext::new("staff-1").grant("pets:read");
    let page = pipeline
        .execute_page(&ctx, &QuerySpec::page(1, 4).fields(["name"]), &authz)
        .await?;
    assert_eq!(page.total, 6);
    assert_eq!(page.items.len(), 4);
    assert_eq!(page.items[0].name.as_deref(), Some("pet-00"));
    assert_eq!(page.items[0].species, None);

    let hits = pipeline
        .execute(&ctx, &QuerySpec::page(1, 10).query("terrier"), &authz)
        .await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name.as_deref(), Some("pet-03"));

    // search indexes
    let search = store.search();
    let lexical = [IndexDefinition::lexical("pets_lexical", "pets", ["name", "description"])];
    let report = search.ensure_indexes(&lexical).await?;
    assert_eq!(report.created, vec!["pets_lexical".to_string()]);

    let status = search
        .index_status("pets", "pets_lexical")
        .await?
        .expect("registered");
    assert!(status.queryable);
    assert!(!status.needs_rebuild);

    let again = search.ensure_indexes(&lexical).await?;
    assert_eq!(again.skipped, vec!["pets_lexical".to_string()]);

    search.drop_index("pets", "pets_lexical").await?;
    search.drop_index("pets", "pets_lexical").await?;
    assert!(!search.index_exists("pets", "pets_lexical").await?);
    Ok(())
}

#[tokio::test]
async fn broken_and_foreign_indexes_are_rebuilt() -> Result<()> {
    let (_container, store) = start_store().await?;
    let pets = store.collection::<Value>("pets")?;
    let ctx = RequestContext::detached();
    pets.insert_many(&ctx, (0..4).map(|i| pet(i, "dog", "north")).collect())
        .await?;
    let search = store.search();

    // a concurrent unique build over duplicates leaves an invalid index behind
    sqlx::raw_sql(
        "insert into kennel.kennel_search_indexes (collection, name, kind, definition)
         values ('pets', 'pets_names', 'lexical', '{}')",
    )
    .execute(store.pool())
    .await?;
    let failed = sqlx::raw_sql(
        "create unique index concurrently pets_names on kennel.pets ((doc ->> 'species'))",
    )
    .execute(store.pool())
    .await;
    assert!(failed.is_err());

    let status = search
        .index_status("pets", "pets_names")
        .await?
        .expect("registered");
    assert!(!status.queryable);
    assert!(status.needs_rebuild);

    // an index nobody registered, under a name we are asked to manage
    sqlx::raw_sql("create index pets_tags on kennel.pets ((doc ->> 'name'))")
        .execute(store.pool())
        .await?;
    assert!(!search.index_exists("pets", "pets_tags").await?);

    let defs = [
        IndexDefinition::lexical("pets_names", "pets", ["name"]),
        IndexDefinition::lexical("pets_tags", "pets", ["description"]),
    ];
    let report = search.ensure_indexes(&defs).await?;
    assert_eq!(report.created, vec!["pets_names".to_string(), "pets_tags".into()]);
    assert!(report.skipped.is_empty());

    let listed = search.list_indexes("pets").await?;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|s| s.queryable && !s.needs_rebuild));

    let again = search.ensure_indexes(&defs).await?;
    assert_eq!(again.skipped.len(), 2);

    search.drop_index("pets", "pets_names").await?;
    let remaining: i64 = sqlx::query_scalar(
        "select count(*) from pg_indexes where schemaname = 'kennel' and indexname = 'pets_names'",
    )
    .fetch_one(store.pool())
    .await?;
    assert_eq!(remaining, 0);
    Ok(())
}
