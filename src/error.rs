use crate::config::InstrumenterKind;

/// Failure reported by a region sink. Propagated to the instrumented program unchanged.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink writer is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("instrumenter kind mismatch: `{active}` is already selected, `{requested}` was requested")]
    KindMismatch {
        active: InstrumenterKind,
        requested: InstrumenterKind,
    },

    #[error("unknown instrumenter kind `{0}`")]
    UnknownKind(String),

    #[error("region `{found}` ended while `{innermost}` is still open")]
    RegionMismatch { innermost: String, found: String },

    #[error("rewind region `{0}` ended but never begun")]
    RewindNotBegun(String),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("failed to swap the instrumentation layer: {0}")]
    Reload(#[from] tracing_subscriber::reload::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
