//! Golden snapshot test for the canonicalization engine, driven by the
//! workspace fixture records and the real curated alias table.

use std::fs;
use std::path::{Path, PathBuf};

use cpm_adapters::load_fixture_records;
use cpm_engine::{aggregate, stable_product_id, AliasConfig, AliasTable};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn curated_alias_table(root: &Path) -> AliasTable {
    let (config, _) = AliasConfig::load(root.join("aliases.yaml")).expect("alias config");
    AliasTable::from_config(&config).expect("alias table")
}

#[test]
fn sample_records_match_golden_snapshot() {
    let root = workspace_root();
    let table = curated_alias_table(&root);
    let records = load_fixture_records("sample", root.join("fixtures/sample/records.json"))
        .expect("fixture records");

    let parents = aggregate(&records, &table);

    let actual = serde_json::to_value(&parents).expect("serialize parents");
    let expected: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(root.join("fixtures/sample/snapshot.json")).expect("read snapshot"),
    )
    .expect("parse snapshot");
    assert_eq!(actual, expected);
}

#[test]
fn curated_alias_table_loads_and_is_disjoint() {
    let root = workspace_root();
    let table = curated_alias_table(&root);
    assert!(table.parent_count() >= 60);
    assert!(table.alias_count() >= table.parent_count());
    assert_eq!(table.resolve("tomatoes grade a"), Some("Tomato A"));
    assert_eq!(table.resolve("redonion elfora"), Some("Red Onion Elfora"));
}

#[test]
fn rebuilding_the_snapshot_is_idempotent() {
    let root = workspace_root();
    let table = curated_alias_table(&root);
    let records = load_fixture_records("sample", root.join("fixtures/sample/records.json"))
        .expect("fixture records");

    let first = aggregate(&records, &table);
    let second = aggregate(&records, &table);
    assert_eq!(first, second);
    for parent in &first {
        assert_eq!(parent.parent_id, stable_product_id(&parent.parent_name));
    }
}
