//! Error taxonomy shared by every pipeline stage.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Failures that abort a clustering run.
///
/// The enum is `Clone` so a teed stream can hand the same failure to every
/// consumer; foreign errors are shared behind an `Arc`.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// A stage was used before the stage it depends on ran (predict before fit,
    /// serialize before cluster).
    NotFitted {
        /// Component that was called out of order.
        component: &'static str,
        /// What the caller has to run first.
        hint: &'static str,
    },
    /// Configuration rejected during validation.
    InvalidConfig(String),
    /// Fewer samples than clusters; centroids cannot be initialized.
    TooFewSamples {
        /// Samples seen during the fit pass.
        samples: usize,
        /// Requested cluster count.
        clusters: usize,
    },
    /// A vector did not have the dimensionality the fitted state expects.
    DimensionMismatch {
        /// Dimensionality the component was fitted on.
        expected: usize,
        /// Dimensionality that was supplied.
        found: usize,
    },
    /// Parallel streams (metadata, embeddings, labels) disagreed on batch layout.
    Misaligned(String),
    /// The upstream story source failed; never retried here.
    Source(Arc<anyhow::Error>),
    /// The sentence encoder failed.
    Encoder(Arc<anyhow::Error>),
    /// Writing an embedding back to the persistent store failed.
    Store(Arc<anyhow::Error>),
    /// Writing an output artifact failed.
    Io(Arc<std::io::Error>),
}

impl PipelineError {
    pub(crate) fn not_fitted(component: &'static str, hint: &'static str) -> Self {
        Self::NotFitted { component, hint }
    }

    pub(crate) fn from_source(err: anyhow::Error) -> Self {
        Self::Source(Arc::new(err))
    }

    pub(crate) fn from_encoder(err: anyhow::Error) -> Self {
        Self::Encoder(Arc::new(err))
    }

    pub(crate) fn from_store(err: anyhow::Error) -> Self {
        Self::Store(Arc::new(err))
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFitted { component, hint } => {
                write!(f, "{component} has nothing to work with yet; run {hint} first")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::TooFewSamples { samples, clusters } => write!(
                f,
                "cannot fit {clusters} clusters from {samples} sample(s)"
            ),
            Self::DimensionMismatch { expected, found } => write!(
                f,
                "expected {expected}-dimensional vectors, got {found}"
            ),
            Self::Misaligned(msg) => write!(f, "streams out of step: {msg}"),
            Self::Source(err) => write!(f, "story source failed: {err:#}"),
            Self::Encoder(err) => write!(f, "sentence encoder failed: {err:#}"),
            Self::Store(err) => write!(f, "embedding store failed: {err:#}"),
            Self::Io(err) => write!(f, "artifact write failed: {err}"),
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Source(err) | Self::Encoder(err) | Self::Store(err) => Some(&***err),
            Self::Io(err) => Some(err.as_ref()),
            Self::NotFitted { .. }
            | Self::InvalidConfig(_)
            | Self::Misaligned(_)
            | Self::TooFewSamples { .. }
            | Self::DimensionMismatch { .. } => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Convenience alias used across the library.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_fitted_names_the_missing_step() {
        let err = PipelineError::not_fitted("clusterer", "`fit`");
        assert_eq!(
            err.to_string(),
            "clusterer has nothing to work with yet; run `fit` first"
        );
        assert!(err.source().is_none());
    }

    #[test]
    fn wrapped_errors_keep_their_source() {
        let err = PipelineError::from_source(anyhow::anyhow!("connection reset"));
        let cloned = err.clone();
        assert!(cloned.to_string().contains("connection reset"));
        assert!(cloned.source().is_some());
    }
}
