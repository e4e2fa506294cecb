use std::path::PathBuf;

use super::{write_atomic, VersionId};
use crate::error::{EngineError, EngineResult};
use crate::features::Scaler;

/// Scaler parameters keyed by entity, feature-set version and model version:
/// `<root>/<entity>/scalers/fs<N>/<version>.json`.
#[derive(Debug, Clone)]
pub struct ScalerStore {
    root: PathBuf,
}

impl ScalerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn feature_set_dir(&self, entity: &str, feature_set_version: u32) -> PathBuf {
        self.root
            .join(entity)
            .join("scalers")
            .join(format!("fs{feature_set_version}"))
    }

    pub fn path(&self, entity: &str, feature_set_version: u32, version: VersionId) -> PathBuf {
        self.feature_set_dir(entity, feature_set_version)
            .join(format!("{version}.json"))
    }

    pub fn save(&self, entity: &str, version: VersionId, scaler: &Scaler) -> EngineResult<()> {
        let path = self.path(entity, scaler.feature_set_version, version);
        let json = serde_json::to_vec_pretty(scaler)?;
        write_atomic(&path, &json)?;
        Ok(())
    }

    pub fn load(
        &self,
        entity: &str,
        feature_set_version: u32,
        version: VersionId,
    ) -> EngineResult<Scaler> {
        let path = self.path(entity, feature_set_version, version);
        let bytes = std::fs::read(&path).map_err(|e| {
            EngineError::Storage(format!("failed to read scaler {}: {e}", path.display()))
        })?;
        let scaler: Scaler = serde_json::from_slice(&bytes)?;
        if scaler.feature_set_version != feature_set_version {
            return Err(EngineError::ScalerMismatch {
                expected: feature_set_version,
                found: scaler.feature_set_version,
            });
        }
        Ok(scaler)
    }

    /// Remove every stored scaler of `version`, whatever its feature-set version.
    pub fn remove(&self, entity: &str, version: VersionId) -> EngineResult<()> {
        let dir = self.root.join(entity).join("scalers");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path().join(format!("{version}.json"));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
