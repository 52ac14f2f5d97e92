use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Failed to render template against {entity}: {reason}")]
    RenderFailed { entity: String, reason: String },

    #[error("Unsupported kind {0}: resources without a spec field need a registered adapter")]
    UnsupportedKind(String),

    #[error("Unknown kind {0}: not served by the API server")]
    UnknownKind(String),

    #[error("Rendered manifest is not a valid resource: {0}")]
    InvalidManifest(String),

    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn display_aggregate(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::InvalidSelector(_) => "InvalidSelector",
            Error::RenderFailed { .. } => "RenderFailed",
            Error::UnsupportedKind(_) => "UnsupportedKind",
            Error::UnknownKind(_) => "UnknownKind",
            Error::InvalidManifest(_) => "InvalidManifest",
            Error::Aggregate(_) => "Aggregate",
        }
    }

    /// Collapse per-item errors into a single error, or `Ok` if there were none.
    pub fn aggregate(errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

pub mod controllers;
pub use controllers::{run, State};

/// The selector/render/diff/apply engine shared by all configuration kinds
pub mod enforcer;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRDs: our configuration kinds plus the external user API types
pub mod resources;
