//! Graph configuration from files and the environment.

mod common;

use common::*;
use graphforge::graph::config::{
    ENV_MEMORY_AFFINITY, ENV_NUM_MEMORY_POOLS, ENV_TENSOR_ALIGNMENT, ENV_USE_MEMORY_MANAGER,
};
use graphforge::graph::MemoryManagerAffinity;
use graphforge::{GraphConfig, GraphError};

const ALL_VARS: [&str; 4] = [
    ENV_USE_MEMORY_MANAGER,
    ENV_MEMORY_AFFINITY,
    ENV_NUM_MEMORY_POOLS,
    ENV_TENSOR_ALIGNMENT,
];

fn clear_env() {
    for var in ALL_VARS {
        std::env::remove_var(var);
    }
}

#[test]
fn test_load_from_file() -> anyhow::Result<()> {
    let config = GraphConfig::default()
        .with_memory_affinity(MemoryManagerAffinity::Offset)
        .with_num_memory_pools(2)
        .with_tensor_alignment(128);
    let file = write_temp_config(&config)?;

    assert_eq!(GraphConfig::load(file.path())?, config);
    Ok(())
}

#[test]
fn test_partial_file_keeps_defaults() -> anyhow::Result<()> {
    let file = write_temp_json(r#"{ "memory_affinity": "offset" }"#)?;
    let config = GraphConfig::load(file.path())?;
    assert_eq!(config.memory_affinity, MemoryManagerAffinity::Offset);
    assert!(config.use_memory_manager);
    assert_eq!(config.num_memory_pools, 1);
    assert_eq!(config.tensor_alignment, 64);
    Ok(())
}

#[test]
fn test_invalid_file_contents_are_rejected() -> anyhow::Result<()> {
    let file = write_temp_json(r#"{ "num_memory_pools": 0 }"#)?;
    assert!(matches!(
        GraphConfig::load(file.path()),
        Err(GraphError::InvalidConfiguration(_))
    ));

    let file = write_temp_json("not json")?;
    assert!(matches!(
        GraphConfig::load(file.path()),
        Err(GraphError::InvalidConfiguration(_))
    ));
    Ok(())
}

#[test]
fn test_missing_file_is_io_error() -> anyhow::Result<()> {
    let dir = create_temp_dir()?;
    let err = GraphConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, GraphError::Io(_)));
    assert!(!err.is_programmer_error());
    Ok(())
}

#[test]
#[serial]
fn test_from_env_overrides_defaults() {
    clear_env();
    std::env::set_var(ENV_USE_MEMORY_MANAGER, "off");
    std::env::set_var(ENV_MEMORY_AFFINITY, "offset");
    std::env::set_var(ENV_NUM_MEMORY_POOLS, "3");
    std::env::set_var(ENV_TENSOR_ALIGNMENT, "32");
    let config = GraphConfig::from_env();
    clear_env();

    let config = config.unwrap();
    assert!(!config.use_memory_manager);
    assert_eq!(config.memory_affinity, MemoryManagerAffinity::Offset);
    assert_eq!(config.num_memory_pools, 3);
    assert_eq!(config.tensor_alignment, 32);
}

#[test]
#[serial]
fn test_from_env_without_variables_is_default() {
    clear_env();
    assert_eq!(GraphConfig::from_env().unwrap(), GraphConfig::default());
}

#[test]
#[serial]
fn test_from_env_rejects_malformed_values() {
    clear_env();
    std::env::set_var(ENV_NUM_MEMORY_POOLS, "many");
    let pools = GraphConfig::from_env();
    clear_env();
    assert!(matches!(pools, Err(GraphError::InvalidConfiguration(_))));

    std::env::set_var(ENV_TENSOR_ALIGNMENT, "24");
    let alignment = GraphConfig::from_env();
    clear_env();
    assert!(alignment.is_err());
}
