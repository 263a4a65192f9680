use std::sync::Arc;

use anyhow::Result;
use kennel::{
    CollectionDriver, Error, IndexDefinition, MemoryStore, SearchIndexManager, SessionHandle,
    SynonymGroup,
    search::{IndexKind, SearchConfig, Similarity},
    testing::CountingSearchAdmin,
};
use serde_json::json;

fn store() -> MemoryStore {
    MemoryStore::with_collections(["pets", "synonyms"])
}

fn manager(admin: &CountingSearchAdmin, store: &MemoryStore) -> SearchIndexManager {
    SearchIndexManager::new(Arc::new(admin.clone()), Arc::new(store.clone()))
}

fn pet_indexes() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::vector("vec_idx", "pets", "embedding", 384, Similarity::Cosine),
        IndexDefinition::lexical("pets_lexical", "pets", ["name", "description"]),
        IndexDefinition::autocomplete("pets_autocomplete", "pets", ["name"]),
        IndexDefinition::synonym("pets_synonyms", "pets", ["description"], "pet_terms"),
    ]
}

#[tokio::test]
async fn provisioning_twice_creates_once() -> Result<()> {
    let admin = CountingSearchAdmin::new();
    let store = store();
    let manager = manager(&admin, &store);
    let vector = [IndexDefinition::vector("vec_idx", "pets", "embedding", 384, Similarity::Cosine)];

    let first = manager.ensure_indexes(&vector).await?;
    assert_eq!(first.created, vec!["vec_idx".to_string()]);
    assert_eq!(admin.create_calls(), 1);

    let second = manager.ensure_indexes(&vector).await?;
    assert!(second.created.is_empty());
    assert_eq!(second.skipped, vec!["vec_idx".to_string()]);
    assert_eq!(admin.create_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn existing_index_is_left_alone() -> Result<()> {
    let admin = CountingSearchAdmin::new().with_existing("pets", "vec_idx", IndexKind::Vector);
    let store = store();

    let report = manager(&admin, &store).ensure_indexes(&pet_indexes()).await?;

    assert_eq!(report.skipped, vec!["vec_idx".to_string()]);
    assert_eq!(report.created.len(), 3);
    assert_eq!(admin.create_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn create_commands_carry_their_definitions() -> Result<()> {
    let admin = CountingSearchAdmin::new();
    let store = store();

    manager(&admin, &store)
        .with_synonyms_collection("synonyms")
        .ensure_indexes(&pet_indexes())
        .await?;

    let creates: Vec<_> = admin
        .commands()
        .into_iter()
        .filter(|c| c.get("createSearchIndexes").is_some())
        .collect();
    assert_eq!(creates.len(), 4);
    assert_eq!(creates[0]["indexes"][0]["type"], json!("vectorSearch"));
    assert_eq!(
        creates[0]["indexes"][0]["definition"]["fields"][0]["numDimensions"],
        json!(384)
    );
    assert_eq!(creates[1]["indexes"][0]["type"], json!("search"));
    assert_eq!(
        creates[3]["indexes"][0]["definition"]["synonyms"][0]["source"]["collection"],
        json!("synonyms")
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_creation_counts_as_success() -> Result<()> {
    let admin = CountingSearchAdmin::new().racing_on("pets_lexical");
    let store = store();

    let report = manager(&admin, &store).ensure_indexes(&pet_indexes()).await?;

    assert!(report.skipped.contains(&"pets_lexical".to_string()));
    assert_eq!(report.created.len(), 3);
    Ok(())
}

#[tokio::test]
async fn unsupported_store_is_a_configuration_error() {
    let admin = CountingSearchAdmin::new().unavailable();
    let store = store();

    let err = manager(&admin, &store)
        .ensure_indexes(&pet_indexes())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SearchUnavailable { .. }));
    assert!(err.is_configuration());
    assert_eq!(admin.create_calls(), 1);
}

#[tokio::test]
async fn invalid_definitions_fail_before_any_command() {
    let admin = CountingSearchAdmin::new();
    let store = store();
    let defs = [
        IndexDefinition::lexical("pets_lexical", "pets", ["name"]),
        IndexDefinition::lexical("pets_lexical", "pets", ["description"]),
    ];

    let err = manager(&admin, &store).ensure_indexes(&defs).await.unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(admin.commands().is_empty());
}

#[tokio::test]
async fn plain_regex_indexes_go_through_the_collection() -> Result<()> {
    let admin = CountingSearchAdmin::new();
    let store = store();
    let manager = manager(&admin, &store);
    let defs = [
        IndexDefinition::plain_regex("pets", "name"),
        IndexDefinition::plain_regex("pets", "description"),
    ];

    let report = manager.ensure_indexes(&defs).await?;

    assert_eq!(
        report.created,
        vec![
            "pets_text".to_string(),
            "pets_name_ci".into(),
            "pets_description_ci".into()
        ]
    );
    assert_eq!(admin.create_calls(), 0);
    let raw = store.raw("pets")?;
    let creates = raw
        .dispatches()
        .iter()
        .filter(|d| d.op == "create_index")
        .count();
    assert_eq!(creates, 3);
    let indexed: Vec<String> = raw
        .list_indexes(&Default::default())
        .await?
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert!(indexed.contains(&"pets_text".to_string()));

    let again = manager.ensure_indexes(&defs).await?;
    assert!(again.created.is_empty());
    assert_eq!(again.skipped.len(), 3);
    Ok(())
}

#[tokio::test]
async fn dropping_is_idempotent() -> Result<()> {
    let admin = CountingSearchAdmin::new().with_existing("pets", "pets_lexical", IndexKind::Lexical);
    let store = store();
    let manager = manager(&admin, &store);

    manager.drop_index("pets", "pets_lexical").await?;
    manager.drop_index("pets", "pets_lexical").await?;

    assert_eq!(admin.drop_calls(), 1);
    assert!(!manager.index_exists("pets", "pets_lexical").await?);
    Ok(())
}

#[tokio::test]
async fn listing_reports_build_state() -> Result<()> {
    let admin = CountingSearchAdmin::new();
    let store = store();
    let manager = manager(&admin, &store);
    manager.ensure_indexes(&pet_indexes()).await?;

    let listed = manager.list_indexes("pets").await?;
    assert_eq!(listed.len(), 4);
    assert!(listed.iter().all(|s| !s.queryable));

    admin.finish_builds();
    assert!(manager.list_indexes("pets").await?.iter().all(|s| s.queryable));
    Ok(())
}

#[tokio::test]
async fn failed_builds_are_listed_and_rebuilt() -> Result<()> {
    let admin = CountingSearchAdmin::new()
        .with_failed("pets", "pets_lexical", IndexKind::Lexical)
        .with_existing("pets", "vec_idx", IndexKind::Vector);
    let store = store();
    let manager = manager(&admin, &store);

    let status = manager.index_status("pets", "pets_lexical").await?.expect("listed");
    assert!(!status.queryable);
    assert!(status.needs_rebuild);

    let report = manager.ensure_indexes(&pet_indexes()).await?;
    assert!(report.created.contains(&"pets_lexical".to_string()));
    assert_eq!(report.skipped, vec!["vec_idx".to_string()]);

    let status = manager.index_status("pets", "pets_lexical").await?.expect("listed");
    assert!(!status.needs_rebuild);
    admin.finish_builds();
    let again = manager.ensure_indexes(&pet_indexes()).await?;
    assert!(again.created.is_empty());
    assert_eq!(again.skipped.len(), 4);
    Ok(())
}

#[tokio::test]
async fn synonym_corpus_is_replaced_wholesale() -> Result<()> {
    let admin = CountingSearchAdmin::new();
    let store = store();
    let manager = manager(&admin, &store);

    let written = manager
        .provision_synonyms(&[
            SynonymGroup::new("breeds", "en", ["Dog", "hound", "puppy"]),
            SynonymGroup::new("breeds", "en", ["cat", "kitten"]),
            SynonymGroup::new("care", "es", ["perro", "can"]),
        ])
        .await?;
    assert_eq!(written, 3);

    let written = manager
        .provision_synonyms(&[SynonymGroup::new("breeds", "en", ["bunny", "rabbit"])])
        .await?;
    assert_eq!(written, 1);

    let corpus = store.raw("synonyms")?.documents();
    assert_eq!(corpus.len(), 1);
    assert_eq!(corpus[0]["synonyms"], json!(["bunny", "rabbit"]));
    assert_eq!(corpus[0]["mappingType"], json!("equivalent"));

    let english = manager.load_synonyms("en").await?;
    assert_eq!(english.expand("Rabbit"), vec!["rabbit".to_string(), "bunny".into()]);
    assert_eq!(english.expand("dog"), vec!["dog".to_string()]);
    Ok(())
}

#[tokio::test]
async fn synonym_swap_inside_a_session() -> Result<()> {
    let admin = CountingSearchAdmin::new();
    let store = store();
    let manager = manager(&admin, &store);
    let session = SessionHandle::detached();

    manager
        .provision_synonyms_in(&session, &[SynonymGroup::new("breeds", "en", ["dog", "hound"])])
        .await?;

    let dispatches = store.raw("synonyms")?.dispatches();
    assert_eq!(
        dispatches.iter().map(|d| d.op).collect::<Vec<_>>(),
        vec!["delete_many", "insert_many"]
    );
    assert!(dispatches.iter().all(|d| d.session == Some(session.id())));
    Ok(())
}

#[tokio::test]
async fn degenerate_synonym_groups_are_rejected() {
    let admin = CountingSearchAdmin::new();
    let store = store();

    let err = manager(&admin, &store)
        .provision_synonyms(&[SynonymGroup::new("breeds", "en", ["dog", "DOG "])])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(store.raw("synonyms").unwrap().dispatches().is_empty());
}

#[test]
fn config_files_parse_with_defaults() {
    let config: SearchConfig = serde_json::from_value(json!({
        "indexes": [
            {"name": "pets_lexical", "collection": "pets", "kind": "lexical", "fields": ["name"]}
        ],
        "synonyms": [
            {"category": "breeds", "language": "en", "terms": ["dog", "hound"]}
        ]
    }))
    .unwrap();

    assert_eq!(config.synonyms_collection, "synonyms");
    assert_eq!(config.indexes[0].kind, IndexKind::Lexical);
    assert_eq!(config.indexes[0].analyzers, vec!["english".to_string()]);
    assert_eq!(config.synonyms.len(), 1);
}
