use std::fmt;
use std::sync::Arc;

use dealstore_common::layout::UnknownLayout;
use dealstore_common::Handle;

use crate::api::ApiError;

/// Step of repository initialization that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Probe,
    Stage,
    DealApply,
    Link,
}

impl fmt::Display for InitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitPhase::Probe => "probe",
            InitPhase::Stage => "stage",
            InitPhase::DealApply => "deal-apply",
            InitPhase::Link => "link",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("repository already initialized at {0}")]
    AlreadyInitialized(String),
    #[error("initialization failed during {phase}: {source}")]
    Init {
        phase: InitPhase,
        #[source]
        source: Box<BackendError>,
    },
    #[error("{op} {path}: {source}")]
    Remote {
        op: &'static str,
        path: String,
        #[source]
        source: ApiError,
    },
    #[error("{0} already holds different content; refusing to overwrite")]
    ContentMismatch(Handle),
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),
    #[error("batch flush failed: {0}")]
    Batch(#[source] Arc<BackendError>),
    #[error("list callback failed: {0}")]
    Callback(#[source] anyhow::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("backend is closed")]
    Closed,
    #[error("staging failed: {0}")]
    Staging(#[from] std::io::Error),
    #[error(transparent)]
    Layout(#[from] UnknownLayout),
    #[error("client setup failed: {0}")]
    Client(#[from] ApiError),
}

impl BackendError {
    /// Wrap a failed remote call, keeping not-found distinct from everything else.
    pub fn remote(op: &'static str, path: &str, source: ApiError) -> Self {
        match source {
            ApiError::NotFound(_) => BackendError::NotFound(path.to_string()),
            source => BackendError::Remote {
                op,
                path: path.to_string(),
                source,
            },
        }
    }

    pub fn init(phase: InitPhase, source: BackendError) -> Self {
        BackendError::Init {
            phase,
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            BackendError::Cancelled => true,
            BackendError::Init { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Phase that failed, for initialization errors.
    pub fn init_phase(&self) -> Option<InitPhase> {
        match self {
            BackendError::Init { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The error behind a failed batch, or `self`.
    pub fn root_cause(&self) -> &BackendError {
        match self {
            BackendError::Batch(inner) => inner.root_cause(),
            other => other,
        }
    }
}
