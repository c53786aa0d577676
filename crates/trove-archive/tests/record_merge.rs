use assert_json_diff::assert_json_eq;
use serde_json::{json, Value};
use trove_archive::record::{get_values, read_record, remove_key, update_record, write_record};
use trove_archive::{merge, MergePolicy, Record, RECORD_FILE};

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[test]
fn append_unique_is_idempotent() {
    let mut doc = Record::new();
    let partial = record(json!({"name": "baseline"}));
    merge(&mut doc, &partial, MergePolicy::AppendUnique);
    merge(&mut doc, &partial, MergePolicy::AppendUnique);
    assert_json_eq!(Value::Object(doc), json!({"name": ["baseline"]}));
}

#[test]
fn append_all_grows_every_call() {
    let mut doc = Record::new();
    let partial = record(json!({"runs": 1}));
    merge(&mut doc, &partial, MergePolicy::AppendAll);
    merge(&mut doc, &partial, MergePolicy::AppendAll);
    merge(&mut doc, &partial, MergePolicy::AppendAll);
    assert_json_eq!(Value::Object(doc), json!({"runs": [1, 1, 1]}));
}

#[test]
fn replace_last_write_wins() {
    let mut doc = record(json!({"last_epoch": 3, "keep": true}));
    merge(&mut doc, &record(json!({"last_epoch": 7})), MergePolicy::Replace);
    merge(&mut doc, &record(json!({"last_epoch": 9})), MergePolicy::Replace);
    assert_json_eq!(Value::Object(doc), json!({"last_epoch": 9, "keep": true}));
}

#[test]
fn append_coerces_existing_scalar() {
    let mut doc = record(json!({"name": "first"}));
    merge(&mut doc, &record(json!({"name": "second"})), MergePolicy::AppendUnique);
    assert_json_eq!(Value::Object(doc), json!({"name": ["first", "second"]}));
}

#[test]
fn missing_record_reads_empty_and_updates_create_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = dir.path().join("blob").join("ab").join("cdef");
    assert!(read_record(&address).is_empty());

    let merged = update_record(
        &address,
        &record(json!({"num_train": 100})),
        MergePolicy::Replace,
    )
    .expect("update");
    assert_json_eq!(Value::Object(merged), json!({"num_train": 100}));
    assert!(address.join(RECORD_FILE).is_file());

    let values = get_values(&address, &["num_train", "absent"]);
    assert_eq!(values, vec![Some(json!(100)), None]);
}

#[test]
fn remove_key_reports_presence() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_record(dir.path(), &record(json!({"test_acc": 0.5, "test_loss": 1.2}))).expect("write");
    assert!(remove_key(dir.path(), "test_acc").expect("remove"));
    assert!(!remove_key(dir.path(), "test_acc").expect("remove again"));
    assert_json_eq!(Value::Object(read_record(dir.path())), json!({"test_loss": 1.2}));
}

#[test]
fn merge_policy_names_are_kebab_case() {
    let encoded = serde_json::to_string(&MergePolicy::AppendUnique).expect("serialize");
    assert_eq!(encoded, "\"append-unique\"");
}
