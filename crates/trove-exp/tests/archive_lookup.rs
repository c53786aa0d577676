mod common;

use std::path::Path;

use common::{SimulatedExecutor, MODULE};
use serde_json::json;
use trove_archive::{fan_out_dir, Storable};
use trove_core::TroveError;
use trove_exp::{
    assert_archived, Archive, DataSource, DistributedParams, Entity, ExecContext,
    FunctionRef, ModelCache, Procedure, Trial, TrialBuilder,
};

fn range(root: &Path, n: u64) -> Procedure {
    Procedure::builder(root, FunctionRef::new(MODULE, "range_data"))
        .kwarg("n", n)
        .build()
}

fn base(root: &Path, seed: u64) -> TrialBuilder {
    Trial::builder(root)
        .name(format!("sweep-{seed}"))
        .model(common::model(8))
        .optimizer("adam")
        .loss("categorical_crossentropy")
        .epochs(1)
        .seed(seed)
}

#[test]
fn stored_trials_are_found_by_hash_generation_and_name() {
    let (registry, _) = common::registry();
    let dir = tempfile::tempdir().expect("tmp dir");
    let train = range(dir.path(), 6);
    let mut adapter = SimulatedExecutor::new();
    let mut models = ModelCache::new();

    let mut trials = Vec::new();
    for seed in [1, 2] {
        let mut trial = base(dir.path(), seed).train_procedure(&train).build().unwrap();
        trial
            .execute(&mut ExecContext::new(&registry, &mut adapter, &mut models))
            .expect("execute");
        trials.push(trial);
    }
    let outlier = Trial::builder(dir.path())
        .model(common::model(64))
        .optimizer("adam")
        .loss("categorical_crossentropy")
        .train_procedure(&train)
        .build()
        .unwrap();
    outlier.write().expect("write description");

    let archive = Archive::new(dir.path());
    let hash = trials[0].hash().unwrap();
    let found = archive.find_trial(&hash).unwrap().expect("stored trial");
    assert_eq!(found.hash().unwrap(), hash);
    assert_eq!(found.name(), "sweep-1");
    assert_eq!(found.gen_hash().unwrap(), trials[0].gen_hash().unwrap());
    assert!(found.is_complete().unwrap());
    assert_eq!(found.train(), trials[0].train());

    let siblings = archive
        .trials_by_gen_hash(&trials[0].gen_hash().unwrap())
        .unwrap();
    assert_eq!(siblings.len(), 2);
    assert_eq!(archive.trials_by_name("sweep-2").unwrap().len(), 1);
    assert_eq!(archive.trials_by_name("trial").unwrap().len(), 1);
    assert_eq!(archive.trial_paths().unwrap().len(), 3);
    assert_eq!(archive.procedure_paths().unwrap().len(), 1);
    assert_eq!(archive.procedures_by_function("range_data").unwrap().len(), 1);
    assert!(archive.procedures_by_function("scaled").unwrap().is_empty());

    let records = archive.all_records().unwrap();
    assert_eq!(records.len(), 4);
    assert!(records
        .iter()
        .any(|(key, record)| key == &hash && record["name"] == json!(["sweep-1"])));
}

#[test]
fn entities_resolve_by_kind_and_can_be_removed() {
    let (registry, _) = common::registry();
    let dir = tempfile::tempdir().expect("tmp dir");
    let mut procedure = range(dir.path(), 3);
    procedure
        .evaluate(&registry, Default::default())
        .expect("evaluate");
    let hash = procedure.hash().unwrap();

    let archive = Archive::new(dir.path());
    let entity = archive.find(&hash).unwrap().expect("stored procedure");
    assert_eq!(entity.kind().as_str(), "procedure");
    assert!(matches!(entity, Entity::Procedure(_)));
    assert!(archive.find("ffffffff").unwrap().is_none());

    assert!(entity.remove().unwrap());
    assert!(!procedure.address().unwrap().exists());
    assert!(!fan_out_dir(dir.path(), &hash).exists());
    assert!(!entity.remove().unwrap());
    assert!(archive.blob_paths().unwrap().is_empty());
}

#[test]
fn undecodable_descriptions_are_skipped_during_enumeration() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let train = range(dir.path(), 6);
    let trial = base(dir.path(), 3).train_procedure(&train).build().unwrap();
    trial.write().expect("write");
    std::fs::write(trial.description_path().unwrap(), b"{\"model\": 1}").expect("clobber");

    let archive = Archive::new(dir.path());
    assert!(archive.trials().unwrap().is_empty());
    let err = archive
        .find_trial(&trial.hash().unwrap())
        .expect_err("decode failure");
    assert!(matches!(err, TroveError::Serde(_)));
}

#[test]
fn bulk_materialisation_keeps_input_order() {
    let (registry, calls) = common::registry();
    let dir = tempfile::tempdir().expect("tmp dir");
    let lazy = Procedure::builder(dir.path(), FunctionRef::new(MODULE, "range_data"))
        .kwarg("n", 9)
        .cache_result(false)
        .build();
    let procedures = vec![range(dir.path(), 2), lazy, range(dir.path(), 5)];

    let paths = assert_archived(&procedures, &registry, 2).expect("archive");
    assert_eq!(paths.len(), 3);
    for (path, procedure) in paths.iter().zip(&procedures) {
        assert_eq!(path, &procedure.container_path().unwrap());
        assert!(path.is_file());
    }
    assert_eq!(calls.range_data(), 3);

    assert_archived(&procedures, &registry, 1).expect("already archived");
    assert_eq!(calls.range_data(), 3);

    let stream = Procedure::builder(dir.path(), FunctionRef::new(MODULE, "stream_data")).build();
    let err = assert_archived(&[stream], &registry, 1).expect_err("stream");
    assert!(matches!(err, TroveError::UnsupportedConfiguration(_)));
}

#[test]
fn duplicate_procedures_archive_concurrently_to_one_address() {
    let (registry, _) = common::registry();
    for _ in 0..10 {
        let dir = tempfile::tempdir().expect("tmp dir");
        let child = range(dir.path(), 7);
        let parent = |factor: f64| {
            Procedure::builder(dir.path(), FunctionRef::new(MODULE, "scaled"))
                .arg_procedure(&child)
                .kwarg("factor", factor)
                .build()
        };
        let mut procedures = vec![child.clone(); 6];
        procedures.extend([parent(2.0), parent(3.0)]);

        let paths = assert_archived(&procedures, &registry, 8).expect("concurrent archive");
        assert!(paths[..6].iter().all(|path| path == &paths[0]));
        assert!(paths.iter().all(|path| path.is_file()));

        let container = child.container_path().unwrap();
        let siblings: Vec<_> = std::fs::read_dir(container.parent().expect("address"))
            .expect("address listing")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert!(siblings.iter().all(|name| name.to_string_lossy().ends_with(".bin")
            || name.to_string_lossy().ends_with(".json")));
    }
}

#[test]
fn distributed_trials_hand_every_container_to_one_fit() {
    let (registry, _) = common::registry();
    let dir = tempfile::tempdir().expect("tmp dir");
    let first = range(dir.path(), 4);
    let second = range(dir.path(), 6);
    let prepared = range(dir.path(), 2);
    let prepared_path = assert_archived(std::slice::from_ref(&prepared), &registry, 1)
        .expect("archive")
        .remove(0);

    let params = DistributedParams {
        workers: 3,
        ..DistributedParams::default()
    };
    assert_eq!(params.effective_max_gpus(), 4);
    let mut trial = base(dir.path(), 5)
        .train_procedure(&first)
        .train(DataSource::path(&prepared_path))
        .train_procedure(&second)
        .distributed(params)
        .build()
        .unwrap();
    let local = base(dir.path(), 5)
        .train_procedure(&first)
        .train(DataSource::path(&prepared_path))
        .train_procedure(&second)
        .build()
        .unwrap();
    assert_ne!(trial.hash().unwrap(), local.hash().unwrap());

    let mut adapter = SimulatedExecutor::new();
    let mut models = ModelCache::new();
    trial
        .execute(&mut ExecContext::new(&registry, &mut adapter, &mut models))
        .expect("distributed execute");

    assert_eq!((adapter.distributed_fits, adapter.fits), (1, 0));
    assert_eq!(
        adapter.distributed_sources,
        vec![
            first.container_path().unwrap(),
            prepared_path,
            second.container_path().unwrap()
        ]
    );
    assert!(trial.is_complete().unwrap());
    assert_eq!(trial.read_record().unwrap()["num_train"], json!(12));
}
