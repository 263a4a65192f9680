use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kennel::{
    EntityDescriptor, FieldProjector, entity_fields,
    query::{Predicate, eval},
};
use serde_json::{Value, json};

const PET: &EntityDescriptor = &EntityDescriptor {
    name: "Pet",
    collection: "pets",
    primary_key: "id",
    created_at: "createdAt",
    fields: entity_fields! {
        "id" => "id": Id,
        "name" => "name": Text,
        "breed" => "breedId": Reference,
        "owner" => "ownerId": Reference,
        "shelter" => "shelterId": Reference,
        "age" => "ageMonths": Number,
        "description" => "description": Text,
        "createdAt" => "createdAt": Timestamp,
    },
    text_fields: &["name", "description"],
    read_permission: None,
}
.checked();

fn make_pet(i: usize) -> Value {
    json!({
        "id": format!("00000000-0000-0000-0000-{i:012}"),
        "name": format!("pet-{i}"),
        "breedId": format!("breed-{}", i % 7),
        "shelterId": format!("shelter-{}", i % 3),
        "ageMonths": i % 120,
        "description": "friendly and house trained",
        "createdAt": "2024-05-01T00:00:00Z",
    })
}

fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projector");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("resolve", 3), |b| {
        b.iter(|| FieldProjector::resolve(PET, &["name", "breed", "owner.email"]))
    });
    group.bench_function("resolve_wildcard", |b| {
        b.iter(|| FieldProjector::resolve(PET, &["*"]))
    });

    group.finish();
}

fn bench_predicates(c: &mut Criterion) {
    let docs: Vec<Value> = (0..1000).map(make_pet).collect();
    let filter = Predicate::And(vec![
        Predicate::r#in("breedId", ["breed-1", "breed-2"]),
        Predicate::range("ageMonths", Some(6), Some(48)),
        Predicate::eq("shelterId", "shelter-1"),
    ]);

    let mut group = c.benchmark_group("predicates");
    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("evaluate_1000", |b| {
        b.iter(|| {
            docs.iter()
                .filter(|doc| eval::matches(&filter, doc).unwrap_or(false))
                .count()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_projection, bench_predicates);
criterion_main!(benches);
