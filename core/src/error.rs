//! Estimator error type.
//!
//! Only conditions that the estimator cannot absorb on its own become an [`EstimatorError`]. Innovation
//! rejections, sensor timeouts and unhealthy channels are handled by the fusion mode controller and are
//! reported through [`crate::status::FaultStatus`] and [`crate::status::FilterEvent`] instead.

use thiserror::Error;

use crate::messages::SensorKind;

/// Primary error type for the estimator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    /// The state or covariance became non-finite. The filter instance has been discarded and will
    /// reinitialize on the next usable inertial sample.
    #[error("Numerical failure in {context}; filter reinitialized")]
    NumericalFailure {
        /// Operation that produced the non-finite value
        context: String,
    },

    /// A configuration parameter is out of range
    #[error("Invalid configuration parameter `{parameter}`: {reason}")]
    InvalidConfiguration {
        /// Dotted path of the offending parameter
        parameter: String,
        reason: String,
    },

    /// A pushed sample cannot be used and was dropped
    #[error("Invalid {kind} sample: {reason}")]
    InvalidSample { kind: String, reason: String },
}

impl EstimatorError {
    pub fn numerical(context: impl Into<String>) -> Self {
        EstimatorError::NumericalFailure {
            context: context.into(),
        }
    }
    pub fn configuration(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        EstimatorError::InvalidConfiguration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
    pub fn sample(kind: SensorKind, reason: impl Into<String>) -> Self {
        EstimatorError::InvalidSample {
            kind: kind.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience result alias
pub type EstimatorResult<T> = Result<T, EstimatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = EstimatorError::numerical("height fusion");
        assert_eq!(
            err.to_string(),
            "Numerical failure in height fusion; filter reinitialized"
        );
        let err = EstimatorError::configuration("baro.noise", "must be positive");
        assert!(err.to_string().contains("baro.noise"));
        let err = EstimatorError::sample(SensorKind::Gnss, "latitude out of range");
        assert_eq!(err.to_string(), "Invalid gnss sample: latitude out of range");
    }
}
