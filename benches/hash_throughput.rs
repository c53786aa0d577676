use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use trove_archive::{content_hash, encode, normalize_model, CanonicalRules};

fn model_definition(layers: usize) -> Value {
    let layers: Vec<Value> = (0..layers)
        .map(|idx| {
            json!({
                "class_name": "Dense",
                "config": {
                    "name": format!("dense_{idx}"),
                    "units": 64,
                    "activation": "relu",
                    "kernel_initializer": {"class_name": "GlorotUniform", "config": {"seed": null}}
                }
            })
        })
        .collect();
    json!({
        "class_name": "Sequential",
        "keras_version": "2.2.4",
        "config": {"name": "sequential_1", "layers": layers}
    })
}

fn hash_benchmark(c: &mut Criterion) {
    let rules = CanonicalRules::default();
    let small = model_definition(4);
    let large = model_definition(256);

    c.bench_function("hash/model_small", |b| {
        b.iter(|| {
            let normalized = normalize_model(black_box(&small), &rules);
            content_hash(&encode(&normalized).expect("encode"))
        });
    });

    c.bench_function("hash/model_large", |b| {
        b.iter(|| {
            let normalized = normalize_model(black_box(&large), &rules);
            content_hash(&encode(&normalized).expect("encode"))
        });
    });
}

criterion_group!(benches, hash_benchmark);
criterion_main!(benches);
