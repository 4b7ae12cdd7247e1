//! Error types for the era comparison and reduction engines.
//!
//! Per-metric and per-column failures are captured and attached to the
//! affected unit's report entry; only a schema-level error aborts a run.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by table assembly, model fitting, imputation, and
/// dimensionality reduction.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[non_exhaustive]
pub enum AnalysisError {
    /// Malformed input row. Fatal: the table cannot be trusted.
    #[error("schema error in record {record_index}: {reason}")]
    Schema {
        /// Zero-based index of the offending record in the input sequence.
        record_index: usize,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// Too few observations or era levels for the requested analysis unit.
    #[error("insufficient data for {unit}: {reason}")]
    InsufficientData {
        /// Metric name, or the name of the non-metric unit (e.g. the
        /// feature table handed to the reduction engine).
        unit: String,
        /// Why the unit cannot be analyzed.
        reason: String,
    },

    /// The REML estimator did not reach a usable optimum.
    #[error("model did not converge for metric '{metric}': {reason}")]
    NonConvergence {
        /// Metric whose fit failed.
        metric: String,
        /// Description of the failure.
        reason: String,
    },

    /// A feature column has no observed values, so its mean is undefined.
    #[error("column '{column}' has no observed values to impute from")]
    EmptyColumn {
        /// Name of the all-missing column.
        column: String,
    },

    /// A feature column has zero variance and cannot be scaled.
    #[error("column '{column}' has zero variance and cannot be standardized")]
    DegenerateColumn {
        /// Name of the constant column.
        column: String,
    },
}

/// Result alias used throughout the crate.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

impl AnalysisError {
    /// Whether this error aborts the whole run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalysisError::Schema { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_errors_are_fatal_others_are_not() {
        let schema = AnalysisError::Schema {
            record_index: 3,
            reason: "empty subject id".to_string(),
        };
        assert!(schema.is_fatal());

        let empty = AnalysisError::EmptyColumn {
            column: "Comb".to_string(),
        };
        assert!(!empty.is_fatal());
    }

    #[test]
    fn display_includes_unit_names() {
        let err = AnalysisError::NonConvergence {
            metric: "Solo".to_string(),
            reason: "criterion not finite".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("Solo"));
        assert!(text.contains("criterion not finite"));
    }
}
