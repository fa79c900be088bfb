use std::io::Write;
use std::path::Path;

use chrono::Utc;

/// Append one `"<date time>, <partitionId>, <sessionId>"` line to the session
/// history log, creating the directory on first use.
pub fn append_history(dir: &Path, partition_id: &str, session_id: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("odc_session_history.log");
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "{}, {}, {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        partition_id,
        session_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_session() {
        let dir = tempfile::tempdir().unwrap();
        append_history(dir.path(), "pt1", "sid1").unwrap();
        append_history(dir.path(), "pt2", "sid2").unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("odc_session_history.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(", pt1, sid1"));
        assert!(lines[1].ends_with(", pt2, sid2"));
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("history").join("deep");
        append_history(&nested, "pt", "sid").unwrap();
        assert!(nested.join("odc_session_history.log").exists());
    }
}
