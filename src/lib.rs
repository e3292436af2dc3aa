use thiserror::Error;

use controllers::kibana::reconcilers::certificates::CertificateError;
use validation::FieldErrors;
use webhook::WebhookError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML Error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error(transparent)]
    ValidationError(#[from] FieldErrors),

    #[error("Invalid version {version}: {message}")]
    InvalidVersion { version: String, message: String },

    #[error("Invalid association configuration in annotation {annotation}: {source}")]
    InvalidAssociationConf {
        annotation: String,
        source: serde_json::Error,
    },

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),

    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error(transparent)]
    CertificateError(#[from] CertificateError),

    #[error("Invalid Kibana configuration: {0}")]
    InvalidKibanaConfig(String),

    #[error(transparent)]
    WebhookError(#[from] WebhookError),

    #[error("{source}; while updating status: {status_error}")]
    StatusUpdate {
        source: Box<Error>,
        status_error: kube::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ValidationError(_) => "ValidationError",
            Error::InvalidVersion { .. } => "InvalidVersion",
            Error::InvalidAssociationConf { .. } => "InvalidAssociationConf",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::CertificateError(_) => "CertificateError",
            Error::InvalidKibanaConfig(_) => "InvalidKibanaConfig",
            Error::WebhookError(_) => "WebhookError",
            Error::StatusUpdate { .. } => "StatusUpdate",
        }
    }
}

pub mod controllers;
pub use controllers::kibana::run;
pub use controllers::{BuildInfo, OperatorParams, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Custom resources
pub mod resources;

/// Version parsing and the supported version window
pub mod version;

/// Resource validation shared by the reconciler and the admission webhook
pub mod validation;

/// Admission webhook handling
pub mod webhook;

/// Runtime registry of watched secrets
pub mod watches;
