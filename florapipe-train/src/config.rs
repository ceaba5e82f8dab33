//! Run configuration loading and rendering
//!
//! Configurations are YAML or JSON files whose top level is a mapping.
//! Everything except the `runtime` section flows into the instantiation
//! engine untouched; the rendered tree is saved next to the run's outputs
//! so any run can be reproduced from its own directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value as ConfigValue;

/// Read and parse a configuration file, dispatching on the extension
pub fn load_config(path: &Path) -> Result<ConfigValue> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration {}", path.display()))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let config = match ext {
        "json" => serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?,
        "yaml" | "yml" => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid YAML in {}", path.display()))?;
            serde_json::to_value(yaml)
                .with_context(|| format!("non-JSON-representable YAML in {}", path.display()))?
        }
        other => bail!("unsupported configuration format '{other}' (expected yaml or json)"),
    };

    if !config.is_object() {
        bail!("configuration root must be a mapping");
    }
    Ok(config)
}

/// Driver options read from the `runtime` section
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Number of epochs to drive
    pub num_epochs: usize,

    /// Wall-clock budget in minutes; the epoch loop stops once exceeded
    pub time_limit: Option<f64>,

    /// Directory receiving the rendered configuration and run outputs
    pub run_dir: PathBuf,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            time_limit: None,
            run_dir: PathBuf::from("runs"),
        }
    }
}

impl Runtime {
    /// Extract the runtime options, falling back to defaults per field
    pub fn from_config(config: &ConfigValue) -> Result<Self> {
        let mut runtime = Runtime::default();
        let Some(section) = config.get("runtime") else {
            return Ok(runtime);
        };
        let Some(section) = section.as_object() else {
            bail!("the 'runtime' section must be a mapping");
        };

        for (key, value) in section {
            match key.as_str() {
                "num_epochs" => {
                    runtime.num_epochs = value
                        .as_u64()
                        .with_context(|| "runtime.num_epochs must be a non-negative integer")?
                        as usize;
                }
                "time_limit" => {
                    runtime.time_limit = Some(
                        value
                            .as_f64()
                            .with_context(|| "runtime.time_limit must be a number of minutes")?,
                    );
                }
                "run_dir" => {
                    runtime.run_dir = PathBuf::from(
                        value
                            .as_str()
                            .with_context(|| "runtime.run_dir must be a string")?,
                    );
                }
                other => bail!("unknown runtime option '{other}'"),
            }
        }
        Ok(runtime)
    }
}

/// Write the fully rendered configuration into the run directory
pub fn save_rendered(runtime: &Runtime, config: &ConfigValue) -> Result<PathBuf> {
    fs::create_dir_all(&runtime.run_dir)
        .with_context(|| format!("cannot create {}", runtime.run_dir.display()))?;
    let path = runtime.run_dir.join("config.json");
    fs::write(&path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}
