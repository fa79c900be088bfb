use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::TopologyError;

/// Resolve the topology source of a request to a file path.
///
/// Exactly one of `topo_file`, `topo_content`, `topo_script` must be
/// non-empty. A script runs under `bash -c` with the request deadline and its
/// stdout becomes the content; content is written to a fresh
/// `<tmp>/<unique>/topology.xml`.
pub async fn resolve_topology_file(
    topo_file: &str,
    topo_content: &str,
    topo_script: &str,
    timeout: Duration,
) -> Result<PathBuf, TopologyError> {
    let sources = [topo_file, topo_content, topo_script]
        .iter()
        .filter(|s| !s.is_empty())
        .count();
    if sources != 1 {
        return Err(TopologyError::SourceSelection);
    }

    if !topo_file.is_empty() {
        return Ok(PathBuf::from(topo_file));
    }

    let content = if topo_script.is_empty() {
        topo_content.to_string()
    } else {
        run_script(topo_script, timeout).await?
    };

    let dir = std::env::temp_dir().join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&dir).map_err(|e| TopologyError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;
    let path = dir.join("topology.xml");
    std::fs::write(&path, content).map_err(|e| TopologyError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    info!(path = %path.display(), "temp topology file created");
    Ok(path)
}

async fn run_script(script: &str, timeout: Duration) -> Result<String, TopologyError> {
    info!(script = %script, "executing topology generation script");

    let child = Command::new("bash")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TopologyError::Io { path: "bash".to_string(), source: e })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| TopologyError::ScriptTimeout)?
        .map_err(|e| TopologyError::Io { path: "bash".to_string(), source: e })?;

    let out = String::from_utf8_lossy(&output.stdout).into_owned();
    let err = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);

    // Keep the log readable when a script dumps a whole topology to stdout.
    const SHORT_SIZE: usize = 75;
    let short_out: String = out.chars().take(SHORT_SIZE).collect();
    let suffix = if out.len() > SHORT_SIZE { " [...]" } else { "" };

    if exit_code != 0 {
        for line in format!(
            "topology generation script failed with exit code {}, stderr: {:?}, stdout: {:?}{}",
            exit_code, err, short_out, suffix
        )
        .lines()
        {
            error!("{}", line);
        }
        return Err(TopologyError::ScriptFailed { exit_code, stderr: err });
    }

    let shown = format!("{}{}", short_out, suffix);
    info!(stderr = %err, stdout = %shown, "topology generation script successful");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requires_exactly_one_source() {
        assert!(matches!(
            resolve_topology_file("", "", "", Duration::from_secs(1)).await,
            Err(TopologyError::SourceSelection)
        ));
        assert!(matches!(
            resolve_topology_file("a.xml", "<topology/>", "", Duration::from_secs(1)).await,
            Err(TopologyError::SourceSelection)
        ));
    }

    #[tokio::test]
    async fn file_source_passes_through() {
        let path = resolve_topology_file("/data/topo.xml", "", "", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/data/topo.xml"));
    }

    #[tokio::test]
    async fn content_source_lands_in_a_temp_file() {
        let path = resolve_topology_file("", "<topology name=\"x\"/>", "", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "topology.xml");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<topology name=\"x\"/>");
    }

    #[tokio::test]
    async fn script_stdout_becomes_content() {
        let path = resolve_topology_file("", "", "echo '<topology name=\"s\"/>'", Duration::from_secs(5))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("<topology name=\"s\"/>"));
    }

    #[tokio::test]
    async fn failing_script_is_an_error() {
        let result = resolve_topology_file("", "", "echo oops >&2; exit 3", Duration::from_secs(5)).await;
        match result {
            Err(TopologyError::ScriptFailed { exit_code, stderr }) => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected ScriptFailed, got {:?}", other.map(|p| p.display().to_string())),
        }
    }
}
