use std::io;
use std::path::PathBuf;

/// Errors surfaced by a training or inference run.
///
/// Nothing in the loop retries: every variant aborts the run once it reaches `main`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("environment rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("failed to launch environment {path:?}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("environment did not answer on port {port} within {seconds}s")]
    StartupTimeout { port: u16, seconds: u64 },

    #[error("brain {0:?} not present in environment")]
    MissingBrain(String),

    #[error("malformed step result: {0}")]
    MalformedStep(String),

    #[error("action does not match the policy: {0}")]
    ActionMismatch(String),

    #[error("buffer misaligned: {actions} actions for {states} states")]
    BufferMisaligned { states: usize, actions: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("no checkpoints found in {0:?}")]
    NoCheckpoints(PathBuf),

    #[error("failed to decode frozen graph: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<burn::record::RecorderError> for Error {
    fn from(e: burn::record::RecorderError) -> Self {
        Error::Recorder(e.to_string())
    }
}
