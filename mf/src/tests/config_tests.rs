use std::fs;

use tempfile::tempdir;

use crate::core::{MfConfig, MAX_QUEUES};
use crate::errors::MfError;

#[test]
fn load_path_reads_a_toml_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mf.toml");
    fs::write(
        &path,
        "shmem_name = \"demo\"\n\
         shmem_size = 8192\n\
         max_msgs_in_queue = 32\n\
         max_queues_in_shmem = 4\n",
    )
    .unwrap();

    let cfg = MfConfig::load_path(path.to_str().unwrap()).unwrap();
    assert_eq!(cfg.shmem_name, "demo");
    assert_eq!(cfg.shmem_size, 8192);
    assert_eq!(cfg.max_msgs_in_queue, 32);
    assert_eq!(cfg.max_queues_in_shmem, 4);
}

#[test]
fn load_path_creates_defaults_for_missing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.toml");
    let cfg = MfConfig::load_path(path.to_str().unwrap()).unwrap();
    let defaults = MfConfig::default();
    assert_eq!(cfg.shmem_name, defaults.shmem_name);
    assert_eq!(cfg.shmem_size, defaults.shmem_size);
    assert!(path.exists(), "confy persists the defaults it handed out");
}

#[test]
fn validate_rejects_out_of_range_values() {
    let mut cfg = MfConfig::default();
    cfg.shmem_size = 0;
    assert!(matches!(cfg.validate(), Err(MfError::Config(_))));

    let mut cfg = MfConfig::default();
    cfg.max_queues_in_shmem = MAX_QUEUES + 1;
    assert!(matches!(cfg.validate(), Err(MfError::Config(_))));

    let mut cfg = MfConfig::default();
    cfg.shmem_name.clear();
    assert!(matches!(cfg.validate(), Err(MfError::Config(_))));

    let mut cfg = MfConfig::default();
    cfg.max_msgs_in_queue = 0;
    assert!(matches!(cfg.validate(), Err(MfError::Config(_))));
}

#[test]
fn path_separators_in_names_map_to_underscores() {
    let cfg = MfConfig {
        shmem_name: "team/mf/segment".to_string(),
        ..MfConfig::default()
    };
    assert_eq!(cfg.os_id(), "team_mf_segment");
}
