//! Helper functions for tempfile/tempdir usage in tests

use std::io::Write;

use anyhow::Context;
use graphforge::GraphConfig;

/// Create a named temp file with a helpful error message.
pub fn create_temp_file() -> anyhow::Result<tempfile::NamedTempFile> {
    tempfile::NamedTempFile::new().context("Failed to create temporary file for test")
}

pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Temp file holding `contents`, kept alive as long as the returned handle.
pub fn write_temp_json(contents: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::with_suffix(".json")
        .context("Failed to create temporary config file")?;
    file.write_all(contents.as_bytes())
        .context("Failed to write temporary config file")?;
    file.flush()?;
    Ok(file)
}

/// Serialize `config` into a temp JSON file.
pub fn write_temp_config(config: &GraphConfig) -> anyhow::Result<tempfile::NamedTempFile> {
    let json = serde_json::to_string_pretty(config).context("Failed to serialize graph config")?;
    write_temp_json(&json)
}
