use proptest::prelude::*;
use serde_json::{json, Map, Value};
use trove_archive::{
    content_hash, encode, normalize_model, strip_defaults, CanonicalRules, PLACEHOLDER,
};

fn digest(value: &Value) -> String {
    content_hash(&encode(value).expect("encode"))
}

fn defaults() -> Map<String, Value> {
    match json!({"shuffle": true, "workers": 1, "optimizer": "rmsprop"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[test]
fn key_order_does_not_change_the_encoding() {
    let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
    let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
    assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    assert_eq!(encode(&a).unwrap(), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
}

#[test]
fn list_order_is_significant() {
    assert_ne!(digest(&json!({"args": [1, 2]})), digest(&json!({"args": [2, 1]})));
}

#[test]
fn explicit_defaults_hash_like_omitted_ones() {
    let mut explicit = match json!({"epochs": 5, "shuffle": true, "workers": 1}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    let mut omitted = match json!({"epochs": 5}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    strip_defaults(&mut explicit, &defaults());
    strip_defaults(&mut omitted, &defaults());
    assert_eq!(
        digest(&Value::Object(explicit)),
        digest(&Value::Object(omitted))
    );
}

#[test]
fn non_default_values_survive_stripping() {
    let mut config = match json!({"shuffle": false, "workers": 4}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    strip_defaults(&mut config, &defaults());
    assert_eq!(config.len(), 2);
}

#[test]
fn cosmetic_model_differences_share_an_identity() {
    let rules = CanonicalRules::default();
    let first = json!({
        "class_name": "Sequential",
        "keras_version": "1.2.2",
        "config": [{"class_name": "Dense", "config": {"name": "dense_1", "units": 8}}]
    });
    let second = json!({
        "class_name": "Sequential",
        "keras_version": "2.0.0",
        "config": [{"class_name": "Dense", "config": {"name": "dense_42", "units": 8}}]
    });
    let a = normalize_model(&first, &rules);
    let b = normalize_model(&second, &rules);
    assert_eq!(digest(&a), digest(&b));
    assert_eq!(a["config"][0]["config"]["name"], json!(PLACEHOLDER));
    // The caller's value is left alone.
    assert_eq!(first["config"][0]["config"]["name"], json!("dense_1"));
}

fn functional(input: &str, dense: &str) -> Value {
    json!({
        "class_name": "Model",
        "config": {
            "name": "model_1",
            "layers": [
                {"class_name": "InputLayer", "name": input, "config": {"name": input}, "inbound_nodes": []},
                {
                    "class_name": "Dense",
                    "name": dense,
                    "config": {"name": dense, "units": 4},
                    "inbound_nodes": [[[input, 0, 0, {}]]]
                }
            ],
            "input_layers": [[input, 0, 0]],
            "output_layers": [[dense, 0, 0]]
        }
    })
}

#[test]
fn functional_model_layer_references_are_masked() {
    let rules = CanonicalRules::default();
    let a = normalize_model(&functional("input_1", "dense_1"), &rules);
    let b = normalize_model(&functional("input_7", "dense_9"), &rules);
    assert_eq!(digest(&a), digest(&b));
    assert_eq!(a["config"]["input_layers"], json!([[PLACEHOLDER, 0, 0]]));

    let mut wider = functional("input_1", "dense_1");
    wider["config"]["layers"][1]["config"]["units"] = json!(8);
    assert_ne!(digest(&a), digest(&normalize_model(&wider, &rules)));
}

#[test]
fn structural_model_differences_change_the_identity() {
    let rules = CanonicalRules::default();
    let small = json!({"config": [{"config": {"name": "d", "units": 8}}]});
    let large = json!({"config": [{"config": {"name": "d", "units": 16}}]});
    assert_ne!(
        digest(&normalize_model(&small, &rules)),
        digest(&normalize_model(&large, &rules))
    );
}

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(|v| json!(v)),
        "[a-z]{1,8}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Bool),
    ]
}

proptest! {
    #[test]
    fn hash_is_stable_across_reconstruction(
        fields in proptest::collection::btree_map("[a-z]{1,6}", field_value(), 1..8)
    ) {
        let forward: Map<String, Value> = fields.clone().into_iter().collect();
        let reversed: Map<String, Value> = fields.into_iter().rev().collect();
        prop_assert_eq!(digest(&Value::Object(forward)), digest(&Value::Object(reversed)));
    }

    #[test]
    fn mutating_any_field_changes_the_hash(
        fields in proptest::collection::btree_map("[a-z]{1,6}", any::<i32>(), 1..8),
        pick in any::<prop::sample::Index>(),
        delta in 1i64..1000,
    ) {
        let original: Map<String, Value> =
            fields.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        let key = pick.get(&fields.keys().cloned().collect::<Vec<_>>()).clone();
        let mut mutated = original.clone();
        let bumped = i64::from(fields[&key]) + delta;
        mutated.insert(key, json!(bumped));
        prop_assert_ne!(digest(&Value::Object(original)), digest(&Value::Object(mutated)));
    }
}
