use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// One reattachable partition: `{partitionId, ddsSessionId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePartition {
    pub partition_id: String,
    pub dds_session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreData {
    pub partitions: Vec<RestorePartition>,
}

/// The on-disk restore manifest, `<dir>/<id>.restore`. Writes go through a
/// temp file and rename so a concurrent reader never observes a partial
/// manifest.
#[derive(Debug, Clone)]
pub struct RestoreFile {
    id: String,
    dir: PathBuf,
}

impl RestoreFile {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        RestoreFile { id: id.into(), dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.restore", self.id))
    }

    pub fn write(&self, data: &RestoreData) -> Result<(), ControllerError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ControllerError::RestoreWrite {
            path: self.dir.display().to_string(),
            source: e,
        })?;
        let path = self.path();
        let tmp = path.with_extension("restore.tmp");
        let json = serde_json::to_string_pretty(data).expect("restore data serializes");
        std::fs::write(&tmp, json).map_err(|e| ControllerError::RestoreWrite {
            path: tmp.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| ControllerError::RestoreWrite {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn read(&self) -> Result<RestoreData, ControllerError> {
        let path = self.path();
        let content = std::fs::read_to_string(&path).map_err(|e| ControllerError::RestoreRead {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ControllerError::RestoreParse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Expand a leading `$HOME` the way the CLI defaults are written.
pub fn smart_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("$HOME") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        return PathBuf::from(format!("{}{}", home, rest));
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_the_partition_multiset() {
        let dir = tempfile::tempdir().unwrap();
        let file = RestoreFile::new("backup", dir.path());
        let data = RestoreData {
            partitions: vec![
                RestorePartition { partition_id: "a".into(), dds_session_id: "s1".into() },
                RestorePartition { partition_id: "b".into(), dds_session_id: "s2".into() },
                RestorePartition { partition_id: "a".into(), dds_session_id: "s3".into() },
            ],
        };
        file.write(&data).unwrap();
        assert_eq!(file.read().unwrap(), data);
    }

    #[test]
    fn rewrites_replace_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = RestoreFile::new("backup", dir.path());
        file.write(&RestoreData {
            partitions: vec![RestorePartition { partition_id: "a".into(), dds_session_id: "s1".into() }],
        })
        .unwrap();
        file.write(&RestoreData::default()).unwrap();
        assert!(file.read().unwrap().partitions.is_empty());
    }

    #[test]
    fn missing_manifest_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = RestoreFile::new("nothing", dir.path());
        assert!(matches!(file.read(), Err(ControllerError::RestoreRead { .. })));
    }

    #[test]
    fn smart_path_expands_home() {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        assert_eq!(
            smart_path("$HOME/.ODC/restore/"),
            Path::new(&format!("{}/.ODC/restore/", home))
        );
        assert_eq!(smart_path("/abs/path"), Path::new("/abs/path"));
    }
}
