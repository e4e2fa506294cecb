pub mod model_registry;
pub mod scaler_store;

use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub use model_registry::{DeployedModel, ModelArtifact, ModelRegistry, ModelSpec};
pub use scaler_store::ScalerStore;

const VERSION_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Version identifier: the training timestamp at second resolution.
/// Ordering of ids is ordering of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(DateTime<Utc>);

impl VersionId {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.with_nanosecond(0).unwrap_or(ts))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + Duration::seconds(1))
    }

    pub fn parse(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s.trim(), VERSION_FORMAT)
            .ok()
            .map(|naive| Self(Utc.from_utc_datetime(&naive)))
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(VERSION_FORMAT))
    }
}

impl TryFrom<String> for VersionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid version id '{value}'"))
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.to_string()
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
/// Readers see either the previous file or the complete new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
