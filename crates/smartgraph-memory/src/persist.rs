use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::fs::write_atomic;

/// On-disk layout of the long-term memory file.
///
/// Pretty-printed JSON with two sections so the file stays readable and
/// hand-editable: `entries` (facts, preferences, history, free keys) and
/// `last_accessed` (RFC 3339 timestamps per key).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTermFile {
    #[serde(default)]
    pub entries: BTreeMap<String, Value>,
    #[serde(default)]
    pub last_accessed: BTreeMap<String, DateTime<Utc>>,
}

/// Read the long-term memory file. A missing file is `Ok(None)`.
pub async fn read(path: &Path) -> Result<Option<LongTermFile>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No long-term memory file yet");
            return Ok(None);
        }
        Err(e) => {
            return Err(SmartGraphError::Memory(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if content.trim().is_empty() {
        return Ok(Some(LongTermFile::default()));
    }
    serde_json::from_str(&content).map(Some).map_err(|e| {
        SmartGraphError::Memory(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Write the long-term memory file atomically.
pub async fn write(path: &Path, file: &LongTermFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(file)
        .map_err(|e| SmartGraphError::Memory(format!("Failed to serialize memory: {}", e)))?;
    write_atomic(path, &json).await.map_err(|e| {
        SmartGraphError::Memory(format!("Failed to write {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&dir.path().join("absent.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("long_term.json");

        let mut file = LongTermFile::default();
        file.entries.insert("facts".into(), json!(["cats are pets"]));
        file.last_accessed.insert("facts".into(), Utc::now());

        write(&path, &file).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"entries\""));
        assert!(text.contains("\"last_accessed\""));

        assert_eq!(read(&path).await.unwrap(), Some(file));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_memory_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long_term.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read(&path).await.unwrap_err();
        assert!(matches!(err, SmartGraphError::Memory(_)));
    }
}
