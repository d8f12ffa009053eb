use std::process::Command;

fn write_provider_fixture(dir: &std::path::Path) {
    std::fs::write(
        dir.join("config.yaml"),
        "source:\n  name: gbif\ncollections:\n  - collection: occurrences\n    kind: table\n    table: points.csv\n    fields:\n      required:\n        scientificname: \"=sciname\"\n",
    )
    .unwrap();

    let collection_dir = dir.join("occurrences");
    std::fs::create_dir(&collection_dir).unwrap();
    std::fs::write(
        collection_dir.join("points.csv"),
        "sciname,latitude,longitude\n\
         Anolis carolinensis,33.7,-84.4\n\
         Anolis sagrei,25.7,\n\
         Anolis equestris,25.8,-80.2\n",
    )
    .unwrap();
}

#[test]
fn dry_run_processes_a_table_collection() {
    let dir = tempfile::tempdir().unwrap();
    write_provider_fixture(dir.path());

    let status = Command::new(env!("CARGO_BIN_EXE_geoload"))
        .arg("--source-dir")
        .arg(dir.path())
        .arg("--dry-run")
        .arg("--verbose")
        .status()
        .expect("failed to execute process");

    assert!(status.success());
    // The upload index is created next to the provider config; in dry-run
    // its rows are recorded but never marked.
    assert!(dir.path().join("uploads.db").exists());
}

#[test]
fn dry_run_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    write_provider_fixture(dir.path());

    for _ in 0..2 {
        let status = Command::new(env!("CARGO_BIN_EXE_geoload"))
            .arg("--source-dir")
            .arg(dir.path())
            .arg("--dry-run")
            .status()
            .expect("failed to execute process");
        assert!(status.success());
    }
}

#[test]
fn missing_provider_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_geoload"))
        .arg("--source-dir")
        .arg(dir.path())
        .arg("--dry-run")
        .status()
        .expect("failed to execute process");

    assert!(!status.success());
}
