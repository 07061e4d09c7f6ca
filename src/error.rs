use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot encode flow {flow_id}: {reason}")]
    Encoding { flow_id: String, reason: String },

    #[error("write to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("capture log is closed")]
    Closed,
}

pub type CaptureResult<T> = Result<T, CaptureError>;
