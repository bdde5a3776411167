use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which frozen base model a residual checkpoint was trained against.
///
/// Written next to the saved weights so the checkpoint can be reassembled later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseModelRecord {
    /// Base model location relative to the shared model root.
    pub base_model_path: String,
    pub base_ckpt_name: Option<String>,
}

impl BaseModelRecord {
    pub const FILE_NAME: &'static str = "base_model.json";

    /// Strips every occurrence of `base_path` from `base_model_path`, then any leading or
    /// trailing `/`.
    pub fn new(base_model_path: &str, base_path: &str, base_ckpt_name: Option<String>) -> Self {
        let relative = if base_path.is_empty() {
            base_model_path.to_string()
        } else {
            base_model_path.replace(base_path, "")
        };
        Self {
            base_model_path: relative.trim_matches('/').to_string(),
            base_ckpt_name,
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(Self::FILE_NAME)
    }

    /// Writes `base_model.json` into `dir`, creating `dir` if needed.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, CheckpointError> {
        std::fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
            action: "create",
            path: dir.to_path_buf(),
            source,
        })?;
        let path = Self::path_in(dir);
        let json = serde_json::to_string_pretty(self).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| CheckpointError::Io {
            action: "write",
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Self, CheckpointError> {
        let path = Self::path_in(dir);
        let contents = std::fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            action: "read",
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| CheckpointError::Json { path, source })
    }
}

/// `<root>/<global_steps>`
pub fn checkpoint_dir(root: &Path, global_steps: u64) -> PathBuf {
    root.join(global_steps.to_string())
}
