use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no plugin registered under {0:?}")]
    NotRegistered(String),

    #[error("failed to spawn {cmd:?}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin timed out")]
    Timeout,

    #[error("plugin exited with code {exit_code}, stderr: {stderr:?}")]
    Failed { exit_code: i32, stderr: String },

    #[error("failed to parse plugin output: {0}")]
    Parse(String),

    #[error("zone {0:?} not found. Check --zones setting of the resource plugin")]
    ZoneNotFound(String),

    #[error("invalid plugin spec {0:?}, expected name:cmd")]
    InvalidSpec(String),
}
