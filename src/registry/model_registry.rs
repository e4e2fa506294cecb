use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{write_atomic, ScalerStore, VersionId};
use crate::error::{EngineError, EngineResult};
use crate::features::Scaler;
use crate::nccqr::{ConformalOffset, QuantileNetwork, TrainedModel, TrainingSummary};

const CURRENT_POINTER: &str = "CURRENT";
const LOAD_ATTEMPTS: usize = 3;

/// Shape and quantile levels a model was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub feature_set_version: u32,
    pub window_hours: usize,
    pub horizon_hours: usize,
    pub rolling_window: usize,
    pub tau_lo: f64,
    pub tau_hi: f64,
}

/// Immutable per-version record: network weights, conformal offsets and the
/// training summary. The matching scaler lives in the scaler store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub entity: String,
    pub version: VersionId,
    pub spec: ModelSpec,
    pub network: QuantileNetwork,
    pub offset: ConformalOffset,
    pub summary: TrainingSummary,
}

impl ModelArtifact {
    pub fn new(entity: &str, version: VersionId, spec: ModelSpec, trained: &TrainedModel) -> Self {
        Self {
            entity: entity.to_string(),
            version,
            spec,
            network: trained.network.clone(),
            offset: trained.offset.clone(),
            summary: trained.summary.clone(),
        }
    }
}

/// A fully loaded version: model, offsets and scaler from the same write.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedModel {
    pub artifact: ModelArtifact,
    pub scaler: Scaler,
}

impl DeployedModel {
    pub fn version(&self) -> VersionId {
        self.artifact.version
    }
}

/// Versioned model store on the local filesystem:
///
/// ```text
/// <root>/<entity>/versions/<version>.json
/// <root>/<entity>/scalers/fs<N>/<version>.json
/// <root>/<entity>/CURRENT
/// ```
///
/// Version files are written once and never modified. Readers resolve
/// `CURRENT` and then load that version, so a concurrent write is never
/// observed half done. Writes for one entity are serialised by a per-entity
/// lock; different entities never contend.
pub struct ModelRegistry {
    root: PathBuf,
    scalers: ScalerStore,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn lock_ignoring_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            scalers: ScalerStore::new(root.clone()),
            root,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn scalers(&self) -> &ScalerStore {
        &self.scalers
    }

    fn entity_lock(&self, entity: &str) -> Arc<Mutex<()>> {
        lock_ignoring_poison(&self.write_locks)
            .entry(entity.to_string())
            .or_default()
            .clone()
    }

    fn versions_dir(&self, entity: &str) -> PathBuf {
        self.root.join(entity).join("versions")
    }

    fn version_path(&self, entity: &str, version: VersionId) -> PathBuf {
        self.versions_dir(entity).join(format!("{version}.json"))
    }

    fn pointer_path(&self, entity: &str) -> PathBuf {
        self.root.join(entity).join(CURRENT_POINTER)
    }

    /// Write a new version. Fails if the version already exists.
    pub fn put(&self, artifact: &ModelArtifact, scaler: &Scaler) -> EngineResult<VersionId> {
        let lock = self.entity_lock(&artifact.entity);
        let _guard = lock_ignoring_poison(&lock);
        self.put_locked(artifact, scaler)
    }

    fn put_locked(&self, artifact: &ModelArtifact, scaler: &Scaler) -> EngineResult<VersionId> {
        let path = self.version_path(&artifact.entity, artifact.version);
        if path.exists() {
            return Err(EngineError::VersionExists {
                entity: artifact.entity.clone(),
                version: artifact.version.to_string(),
            });
        }
        self.scalers.save(&artifact.entity, artifact.version, scaler)?;
        let json = serde_json::to_vec(artifact)?;
        write_atomic(&path, &json)?;
        tracing::info!(entity = %artifact.entity, version = %artifact.version, "Stored model version");
        Ok(artifact.version)
    }

    /// Move the current pointer forward to `version`. Never moves it back.
    pub fn promote(&self, entity: &str, version: VersionId) -> EngineResult<()> {
        let lock = self.entity_lock(entity);
        let _guard = lock_ignoring_poison(&lock);
        self.promote_locked(entity, version)
    }

    fn promote_locked(&self, entity: &str, version: VersionId) -> EngineResult<()> {
        self.require_version(entity, version)?;
        if let Some(current) = self.current_version(entity)? {
            if version < current {
                return Err(EngineError::VersionRegression {
                    entity: entity.to_string(),
                    current: current.to_string(),
                    requested: version.to_string(),
                });
            }
            if version == current {
                return Ok(());
            }
        }
        write_atomic(&self.pointer_path(entity), version.to_string().as_bytes())?;
        tracing::info!(entity, version = %version, "Promoted model version");
        Ok(())
    }

    /// Point current at an older retained version.
    pub fn rollback(&self, entity: &str, version: VersionId) -> EngineResult<()> {
        let lock = self.entity_lock(entity);
        let _guard = lock_ignoring_poison(&lock);
        self.require_version(entity, version)?;
        let previous = self.current_version(entity)?;
        write_atomic(&self.pointer_path(entity), version.to_string().as_bytes())?;
        tracing::warn!(
            entity,
            from = %previous.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
            to = %version,
            "Rolled back current model version"
        );
        Ok(())
    }

    /// Store, promote and prune under one lock acquisition. The version id is
    /// `now`, bumped past the newest stored version when needed.
    pub fn publish(
        &self,
        entity: &str,
        now: DateTime<Utc>,
        spec: ModelSpec,
        trained: &TrainedModel,
        retention_days: i64,
    ) -> EngineResult<VersionId> {
        let lock = self.entity_lock(entity);
        let _guard = lock_ignoring_poison(&lock);

        let mut version = VersionId::from_timestamp(now);
        if let Some(latest) = self.versions(entity)?.last().copied() {
            if version <= latest {
                version = latest.next();
            }
        }
        let artifact = ModelArtifact::new(entity, version, spec, trained);
        self.put_locked(&artifact, &trained.scaler)?;
        self.promote_locked(entity, version)?;
        self.prune_locked(entity, now, retention_days)?;
        Ok(version)
    }

    fn require_version(&self, entity: &str, version: VersionId) -> EngineResult<()> {
        if self.version_path(entity, version).exists() {
            Ok(())
        } else {
            Err(EngineError::Storage(format!(
                "version {version} of {entity} is not stored"
            )))
        }
    }

    pub fn current_version(&self, entity: &str) -> EngineResult<Option<VersionId>> {
        let path = self.pointer_path(entity);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        VersionId::parse(&raw).map(Some).ok_or_else(|| {
            EngineError::Storage(format!("corrupt pointer {}: '{}'", path.display(), raw.trim()))
        })
    }

    /// Load the version `CURRENT` points at. If that version is pruned
    /// between reading the pointer and loading it, the pointer is re-read.
    pub fn get_current(&self, entity: &str) -> EngineResult<DeployedModel> {
        let stale = || EngineError::StaleModel {
            entity: entity.to_string(),
        };
        let mut version = self.current_version(entity)?.ok_or_else(stale)?;
        for _ in 0..LOAD_ATTEMPTS {
            match self.load(entity, version) {
                Ok(model) => return Ok(model),
                Err(e) => {
                    let now_current = self.current_version(entity)?.ok_or_else(stale)?;
                    if now_current == version {
                        return Err(e);
                    }
                    version = now_current;
                }
            }
        }
        self.load(entity, version)
    }

    pub fn load(&self, entity: &str, version: VersionId) -> EngineResult<DeployedModel> {
        let path = self.version_path(entity, version);
        let bytes = std::fs::read(&path).map_err(|e| {
            EngineError::Storage(format!("failed to read model {}: {e}", path.display()))
        })?;
        let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
        let scaler = self
            .scalers
            .load(entity, artifact.spec.feature_set_version, version)?;
        Ok(DeployedModel { artifact, scaler })
    }

    /// Stored versions in ascending order.
    pub fn versions(&self, entity: &str) -> EngineResult<Vec<VersionId>> {
        let entries = match std::fs::read_dir(self.versions_dir(entity)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(v) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(VersionId::parse)
            {
                out.push(v);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Delete versions older than the retention window. The current version
    /// is always kept.
    pub fn prune(
        &self,
        entity: &str,
        now: DateTime<Utc>,
        retention_days: i64,
    ) -> EngineResult<Vec<VersionId>> {
        let lock = self.entity_lock(entity);
        let _guard = lock_ignoring_poison(&lock);
        self.prune_locked(entity, now, retention_days)
    }

    fn prune_locked(
        &self,
        entity: &str,
        now: DateTime<Utc>,
        retention_days: i64,
    ) -> EngineResult<Vec<VersionId>> {
        let cutoff = now - Duration::days(retention_days);
        let current = self.current_version(entity)?;
        let mut removed = Vec::new();
        for version in self.versions(entity)? {
            if version.timestamp() >= cutoff || Some(version) == current {
                continue;
            }
            std::fs::remove_file(self.version_path(entity, version))?;
            self.scalers.remove(entity, version)?;
            removed.push(version);
        }
        if !removed.is_empty() {
            tracing::info!(entity, removed = removed.len(), cutoff = %cutoff, "Pruned model versions");
        }
        Ok(removed)
    }
}
