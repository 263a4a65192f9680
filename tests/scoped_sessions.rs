use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kennel::{
    CollectionSource, Discriminated, Error, MemoryCollection, MemoryStore, ReadConcern,
    ReadPreference, RequestContext, ScopedCollection, SessionHandle, WriteConcern,
    driver::{FindAndModify, IndexKey, IndexModel, WatchOptions, WriteModel},
    memory::Dispatch,
    query::{Aggregation, FindSpec, JsonPath, MapReduce, Predicate, Reducer, Update},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn store() -> MemoryStore {
    let store = MemoryStore::with_collections(["pets"]);
    let raw = store.raw("pets").unwrap();
    raw.seed(vec![
        json!({"name": "Biscuit", "species": "dog", "ageMonths": 4}),
        json!({"name": "Pepper", "species": "cat", "ageMonths": 30}),
        json!({"name": "Mochi", "species": "dog", "ageMonths": 12}),
    ])
    .unwrap();
    store
}

/// Run every ambient operation once through `pets` under `ctx`.
async fn exercise(pets: &ScopedCollection<Value>, ctx: &RequestContext) -> Result<()> {
    let any = Predicate::True;
    let dogs = Predicate::eq("species", "dog");
    pets.find(ctx, &FindSpec::all()).await?;
    pets.find_one(ctx, &FindSpec::new(dogs.clone())).await?;
    pets.count(ctx, &any).await?;
    pets.distinct(ctx, &JsonPath::from("species"), &any).await?;
    pets.aggregate(
        ctx,
        &Aggregation::new(any.clone()).group_by("species").count("total"),
    )
    .await?;
    pets.map_reduce(ctx, &MapReduce::new("species", Reducer::Count))
        .await?;
    let id = pets.insert_one(ctx, json!({"name": "Tofu", "species": "rabbit"})).await?;
    pets.insert_many(ctx, vec![json!({"name": "Nori"}), json!({"name": "Miso"})])
        .await?;
    let by_id = Predicate::eq("id", id.to_string());
    pets.replace_one(ctx, &by_id, json!({"name": "Tofu", "species": "hare"}), false)
        .await?;
    pets.update_one(ctx, &by_id, &Update::new().set("adopted", true))
        .await?;
    pets.update_many(ctx, &dogs, &Update::new().inc("ageMonths", 1.0))
        .await?;
    pets.delete_one(ctx, &Predicate::eq("name", "Nori")).await?;
    pets.delete_many(ctx, &Predicate::eq("name", "Miso")).await?;
    pets.bulk_write(
        ctx,
        vec![
            WriteModel::InsertOne {
                doc: json!({"name": "Pickle"}),
            },
            WriteModel::DeleteMany {
                filter: Predicate::eq("name", "Pickle"),
            },
        ],
    )
    .await?;
    pets.find_one_and_update(
        ctx,
        &by_id,
        &Update::new().set("adopted", false),
        &FindAndModify::default().return_after(),
    )
    .await?;
    pets.find_one_and_replace(
        ctx,
        &by_id,
        json!({"name": "Tofu"}),
        &FindAndModify::default(),
    )
    .await?;
    pets.find_one_and_delete(ctx, &by_id, &FindAndModify::default())
        .await?;
    drop(pets.watch(ctx, &WatchOptions::default()).await?);
    pets.create_index(ctx, &IndexModel::new().key("name", IndexKey::Ascending))
        .await?;
    pets.create_indexes(ctx, &[IndexModel::new().key("species", IndexKey::Descending)])
        .await?;
    pets.list_indexes(ctx).await?;
    pets.drop_index(ctx, "pets_name_asc").await?;
    pets.drop_indexes(ctx).await?;
    Ok(())
}

const OPERATIONS: usize = 23;

#[tokio::test]
async fn ambient_session_reaches_every_operation() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    let pets = store.collection::<Value>("pets")?;
    let session = store.begin_session();
    let ctx = RequestContext::builder().session(session.clone()).build();

    exercise(&pets, &ctx).await?;

    let dispatches = raw.dispatches();
    assert_eq!(dispatches.len(), OPERATIONS);
    assert!(dispatches.iter().all(|d| d.session == Some(session.id())));
    Ok(())
}

#[tokio::test]
async fn no_session_means_sessionless_calls() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    let pets = store.collection::<Value>("pets")?;

    exercise(&pets, &RequestContext::detached()).await?;

    let dispatches = raw.dispatches();
    assert_eq!(dispatches.len(), OPERATIONS);
    assert!(dispatches.iter().all(|d| !d.in_session()));
    Ok(())
}

#[tokio::test]
async fn sequential_requests_do_not_share_sessions() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    let pets = store.collection::<Value>("pets")?;
    let first = SessionHandle::detached();
    let second = SessionHandle::detached();
    let base = RequestContext::detached();

    pets.count(&base.with_session(first.clone()), &Predicate::True)
        .await?;
    pets.count(&base.with_session(second.clone()), &Predicate::True)
        .await?;
    pets.count(&base, &Predicate::True).await?;

    let sessions: Vec<_> = raw.dispatches().into_iter().map(|d| d.session).collect();
    assert_eq!(sessions, vec![Some(first.id()), Some(second.id()), None]);
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_keep_their_own_sessions() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    raw.set_latency(Duration::from_millis(5));
    let pets = store.collection::<Value>("pets")?;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pets = pets.clone();
        tasks.push(tokio::spawn(async move {
            let session = SessionHandle::detached();
            let ctx = RequestContext::builder().session(session.clone()).build();
            pets.count(&ctx, &Predicate::True).await?;
            pets.find(&ctx, &FindSpec::all()).await?;
            Ok::<_, Error>(session.id())
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await??);
    }

    let dispatches = raw.dispatches();
    assert_eq!(dispatches.len(), 16);
    for id in ids {
        let mine: Vec<&Dispatch> = dispatches
            .iter()
            .filter(|d| d.session == Some(id))
            .collect();
        assert_eq!(mine.len(), 2);
    }
    Ok(())
}

#[tokio::test]
async fn explicit_session_overloads_pass_through() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    let pets = store.collection::<Value>("pets")?;
    let ambient = SessionHandle::detached();
    let explicit = SessionHandle::detached();
    let ctx = RequestContext::builder().session(ambient).build();

    pets.count_in(&explicit, ctx.signal(), &Predicate::True)
        .await?;

    assert_eq!(raw.dispatches()[0].session, Some(explicit.id()));
    Ok(())
}

#[tokio::test]
async fn driver_errors_propagate_unchanged() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    let pets = store.collection::<Value>("pets")?;
    raw.fail_next("find");

    let err = pets
        .find(&RequestContext::detached(), &FindSpec::all())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Db(sqlx::Error::PoolTimedOut)));
    assert!(err.is_transient());
    Ok(())
}

#[tokio::test]
async fn deadlines_and_cancellation_reach_the_driver() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    raw.set_latency(Duration::from_millis(200));
    let pets = store.collection::<Value>("pets")?;

    let ctx = RequestContext::builder()
        .timeout(Duration::from_millis(20))
        .build();
    let err = pets.count(&ctx, &Predicate::True).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));

    let token = CancellationToken::new();
    let ctx = RequestContext::builder()
        .session(SessionHandle::detached())
        .cancellation(token.clone())
        .build();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let err = pets.count(&ctx, &Predicate::True).await.unwrap_err();
    canceller.await?;
    assert!(matches!(err, Error::Cancelled));
    Ok(())
}

#[tokio::test]
async fn settings_changes_return_wrapped_collections() -> Result<()> {
    let store = store();
    let raw = store.raw("pets")?;
    let pets = store.collection::<Value>("pets")?;

    let tuned = pets
        .with_read_concern(ReadConcern::Snapshot)
        .with_write_concern(WriteConcern::Relaxed)
        .with_read_preference(ReadPreference::Replica);
    assert_eq!(tuned.settings().read_concern, ReadConcern::Snapshot);
    assert_eq!(tuned.settings().write_concern, WriteConcern::Relaxed);
    assert_eq!(pets.settings(), Default::default());

    let session = SessionHandle::detached();
    let ctx = RequestContext::builder().session(session.clone()).build();
    tuned.count(&ctx, &Predicate::True).await?;
    assert_eq!(raw.dispatches()[0].session, Some(session.id()));
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Dog {
    name: String,
}

impl Discriminated for Dog {
    const DISCRIMINATOR: &'static str = "Dog";
}

#[tokio::test]
async fn sub_typed_collections_stay_session_aware() -> Result<()> {
    let raw = MemoryCollection::new("animals");
    let animals: ScopedCollection<Value> = ScopedCollection::new(Arc::new(raw.clone()));
    let dogs = animals.of_type::<Dog>();
    let session = SessionHandle::detached();
    let ctx = RequestContext::builder().session(session.clone()).build();

    dogs.store_one(&ctx, &Dog {
        name: "Rex".into(),
    })
    .await?;
    animals.insert_one(&ctx, json!({"name": "Whiskers"})).await?;
    let loaded = dogs.load_many(&ctx, &FindSpec::all()).await?;

    assert_eq!(loaded, vec![Dog {
        name: "Rex".into()
    }]);
    assert_eq!(raw.documents()[0]["_t"], json!("Dog"));
    assert!(raw.dispatches().iter().all(|d| d.session == Some(session.id())));
    Ok(())
}

#[tokio::test]
async fn unregistered_collections_are_configuration_errors() {
    let store = MemoryStore::with_collections(["pets"]);
    let err = store.collection::<Value>("owners").unwrap_err();
    assert!(err.is_configuration());
}
