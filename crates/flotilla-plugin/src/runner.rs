use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use crate::error::PluginError;

/// Execute a plugin command with the standard argument triple and deadline.
///
/// The full invocation is `<cmd> --res "<resources>" --id "<partition>" --rn
/// <run_nr>`, run through a shell so registered commands may carry their own
/// arguments. Returns trimmed stdout. The child is killed when the deadline
/// expires.
pub async fn exec_plugin(
    cmd: &str,
    resources: &str,
    partition_id: &str,
    run_nr: u64,
    timeout: Duration,
) -> Result<String, PluginError> {
    let full_cmd = format!(
        "{} --res \"{}\" --id \"{}\" --rn {}",
        cmd,
        shell_escape(resources),
        shell_escape(partition_id),
        run_nr
    );
    info!(cmd = %full_cmd, "executing plugin");

    let child = Command::new("bash")
        .arg("-c")
        .arg(&full_cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PluginError::Spawn { cmd: full_cmd.clone(), source: e })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| PluginError::Timeout)?
        .map_err(|e| PluginError::Spawn { cmd: full_cmd, source: e })?;

    let exit_code = output.status.code().unwrap_or(-1);
    if exit_code != 0 {
        return Err(PluginError::Failed {
            exit_code,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Escape for embedding in a double-quoted shell argument.
fn shell_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$").replace('`', "\\`")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_trimmed_stdout() {
        let out = exec_plugin("echo hello; true", "", "p1", 0, Duration::from_secs(5))
            .await
            .unwrap();
        // the argument triple lands on the trailing `true`
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn passes_the_argument_triple() {
        let out = exec_plugin("echo", "<res/>", "p1", 7, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "--res <res/> --id p1 --rn 7");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let err = exec_plugin("echo bad >&2; exit 2 #", "", "p1", 0, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            PluginError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert!(stderr.contains("bad"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_the_plugin() {
        let err = exec_plugin("sleep 10 #", "", "p1", 0, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Timeout));
    }
}
