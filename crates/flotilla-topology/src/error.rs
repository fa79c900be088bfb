use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed topology XML: {0}")]
    Xml(String),

    #[error("requirement {name} has an invalid value {value:?}")]
    InvalidRequirement { name: String, value: String },

    #[error("either topology filepath, content or script has to be set")]
    SourceSelection,

    #[error("topology generation script failed with exit code {exit_code}, stderr: {stderr:?}")]
    ScriptFailed { exit_code: i32, stderr: String },

    #[error("topology generation script timed out")]
    ScriptTimeout,

    #[error("no tasks found matching the path {0:?}")]
    NoTasksMatching(String),

    #[error("no states found for path {0:?}")]
    NoStates(String),

    #[error("DDS topology is not initialized")]
    NotInitialized,
}
