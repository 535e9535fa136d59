//! Taxonomía de errores del núcleo del pipeline.
//!
//! Ninguno de estos errores cruza `RagPipeline::run`: cada variante tiene su
//! política de degradación (fuente vacía, texto de respaldo, chunk omitido o
//! traza descartada).

use std::time::Duration;
use thiserror::Error;

/// Fallos del servicio externo de generación de respuestas.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl GenerationError {
    /// Clasifica un mensaje de error del proveedor en cuota o transporte.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429")
            || lower.contains("quota")
            || lower.contains("rate limit")
            || lower.contains("insufficient_quota")
        {
            Self::Quota(message)
        } else {
            Self::Transport(message)
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("malformed chunk '{id}': missing {field}")]
    MalformedChunk { id: String, field: &'static str },

    #[error("audit write failed: {0}")]
    AuditWrite(String),

    #[error("audit read failed: {0}")]
    AuditRead(String),

    #[error("operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl PipelineError {
    pub fn backend(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<neo4rs::Error> for PipelineError {
    fn from(err: neo4rs::Error) -> Self {
        Self::backend("neo4j", err)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
