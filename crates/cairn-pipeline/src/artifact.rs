//! Durable per-node artifacts.
//!
//! An artifact is either a keyed value map plus the metadata document that
//! travelled with it, or a structured failure trace written in place of the
//! values when the node failed. Readers can tell the two apart without an
//! error being raised.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cairn_types::{CairnError, Result};

use crate::layout::backup_path;

/// Normal-shaped artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueArtifact {
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: Value,
}

/// Error-shaped artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureTrace {
    pub node_id: String,
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

impl FailureTrace {
    /// Capture an error and its full source chain.
    pub fn from_error(node_id: &str, err: &CairnError) -> Self {
        let mut trace: Vec<String> = err.to_string().lines().map(String::from).collect();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            trace.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            node_id: node_id.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace,
            occurred_at: chrono::Utc::now(),
        }
    }

    /// Multi-line text for display and for the node's status message.
    pub fn render(&self) -> String {
        let mut out = format!("[{}] node '{}'", self.kind, self.node_id);
        for line in &self.trace {
            out.push('\n');
            out.push_str(line);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ErrorArtifact {
    error: FailureTrace,
}

/// An artifact as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Values(ValueArtifact),
    Error(FailureTrace),
}

/// Classification of whatever sits at an artifact path.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactShape {
    Missing,
    Values,
    Error,
    Malformed,
}

impl Artifact {
    fn to_json(&self) -> Result<Value> {
        let v = match self {
            Artifact::Values(a) => serde_json::to_value(a)?,
            Artifact::Error(t) => serde_json::to_value(ErrorArtifact { error: t.clone() })?,
        };
        Ok(v)
    }

    fn from_json(value: Value) -> Result<Self> {
        if value.get("error").is_some() {
            let e: ErrorArtifact = serde_json::from_value(value)?;
            return Ok(Artifact::Error(e.error));
        }
        Ok(Artifact::Values(serde_json::from_value(value)?))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Artifact::Error(_))
    }

    /// Read an artifact file.
    pub async fn read(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(serde_json::from_str(&json)?)
    }

    /// Write an artifact, replacing any previous one atomically.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.to_json()?)?;
        write_atomic(path, json.as_bytes()).await?;
        tracing::debug!(path = %path.display(), error = self.is_error(), "Artifact written");
        Ok(())
    }

    /// Classify the file at `path` without failing.
    pub async fn inspect(path: &Path) -> ArtifactShape {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(j) => j,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ArtifactShape::Missing,
            Err(_) => return ArtifactShape::Malformed,
        };
        match serde_json::from_str::<Value>(&json).map_err(CairnError::from).and_then(Self::from_json) {
            Ok(Artifact::Values(_)) => ArtifactShape::Values,
            Ok(Artifact::Error(_)) => ArtifactShape::Error,
            Err(_) => ArtifactShape::Malformed,
        }
    }
}

/// Write `bytes` to a temporary sibling and rename it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

pub async fn has_backup(artifact: &Path) -> Result<bool> {
    Ok(tokio::fs::try_exists(backup_path(artifact)).await?)
}

/// Move the artifact to its `.bak` sibling unless a backup already exists.
///
/// Returns `true` if a backup was created.
pub async fn move_to_backup(artifact: &Path) -> Result<bool> {
    let bak = backup_path(artifact);
    if tokio::fs::try_exists(&bak).await? {
        remove_if_exists(artifact).await?;
        return Ok(false);
    }
    if Artifact::inspect(artifact).await != ArtifactShape::Values {
        remove_if_exists(artifact).await?;
        return Ok(false);
    }
    tokio::fs::rename(artifact, &bak).await?;
    tracing::debug!(path = %bak.display(), "Pre-filter backup created");
    Ok(true)
}

/// Rename the `.bak` sibling back over the artifact.
///
/// Returns `true` if the pre-filter artifact was restored. A backup that is
/// not values-shaped is discarded along with the artifact.
pub async fn restore_backup(artifact: &Path) -> Result<bool> {
    let bak = backup_path(artifact);
    match Artifact::inspect(&bak).await {
        ArtifactShape::Values => {
            tokio::fs::rename(&bak, artifact).await?;
            tracing::debug!(path = %artifact.display(), "Pre-filter artifact restored");
            Ok(true)
        }
        ArtifactShape::Missing => Ok(false),
        ArtifactShape::Error | ArtifactShape::Malformed => {
            remove_if_exists(&bak).await?;
            remove_if_exists(artifact).await?;
            Ok(false)
        }
    }
}

pub async fn remove_backup(artifact: &Path) -> Result<bool> {
    remove_if_exists(&backup_path(artifact)).await
}

pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
