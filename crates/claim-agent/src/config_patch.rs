//! Points a YAML tool configuration at the assigned workspace.

use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::info;

/// Key the workspace path is written under.
pub const OUTPUT_KEY: &str = "output_directory";

/// Spellings of the output key that are replaced.
pub const OUTPUT_KEY_ALIASES: [&str; 5] = [
    "output_directory",
    "output_dir",
    "outputDirectory",
    "output_path",
    "outputPath",
];

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config root is not a mapping")]
    NotMapping,
}

/// Replace every output key spelling in `doc` with a single `output_directory`.
pub fn set_output_directory(doc: &mut Mapping, output_dir: &str) {
    for alias in OUTPUT_KEY_ALIASES {
        doc.remove(alias);
    }
    doc.insert(
        Value::String(OUTPUT_KEY.to_string()),
        Value::String(output_dir.to_string()),
    );
}

/// Rewrite the YAML file at `path` so its output directory is `output_dir`.
pub async fn patch_config_file(path: &Path, output_dir: &Path) -> Result<(), PatchError> {
    let raw = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PatchError::NotFound(path.to_path_buf())
        } else {
            PatchError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    let mut doc = match serde_yaml::from_str::<Value>(&raw)? {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => return Err(PatchError::NotMapping),
    };

    let output = output_dir.to_string_lossy().replace('\\', "/");
    set_output_directory(&mut doc, &output);

    let rendered = serde_yaml::to_string(&doc)?;
    fs::write(path, rendered).await.map_err(|e| PatchError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!("Set {} to {} in {}", OUTPUT_KEY, output, path.display());
    Ok(())
}
