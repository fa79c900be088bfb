use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to add request trigger {name:?}: invalid request name. Valid names are: {valid}")]
    InvalidTrigger { name: String, valid: String },

    #[error("failed to read restore file {path}: {source}")]
    RestoreRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write restore file {path}: {source}")]
    RestoreWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed restore file {path}: {source}")]
    RestoreParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
