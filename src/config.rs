//! Analysis configuration.
//!
//! All policy knobs live here: the fixed metric ordering, the era label
//! domain, the missing-data ceiling, and the parameters of the REML
//! variance-ratio search. The engines themselves hold no ambient state.

use serde::{Deserialize, Serialize};

use crate::table::Era;

/// The categorical domain of era labels.
///
/// The reference level is fixed by configuration, never inferred from data
/// order, so the direction of the era contrast is reproducible. Labels are
/// matched case-insensitively after trimming, matching how the upstream
/// spreadsheets tag their season-group rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraDomain {
    /// Label of the reference ("before") era.
    pub reference: String,
    /// Label of the comparison ("after") era.
    pub comparison: String,
    /// Reserved sentinel marking derived per-subject difference rows.
    /// These rows are precomputed deltas, not primary data, and are
    /// excluded before either engine runs.
    pub derived_sentinel: String,
}

impl Default for EraDomain {
    fn default() -> Self {
        Self {
            reference: "Before".to_string(),
            comparison: "After".to_string(),
            derived_sentinel: "Difference".to_string(),
        }
    }
}

impl EraDomain {
    /// Maps a raw era label onto the categorical domain.
    /// Returns `None` for labels outside the domain.
    pub fn classify(&self, label: &str) -> Option<Era> {
        let label = label.trim();
        if label.eq_ignore_ascii_case(&self.reference) {
            Some(Era::Reference)
        } else if label.eq_ignore_ascii_case(&self.comparison) {
            Some(Era::Comparison)
        } else if label.eq_ignore_ascii_case(&self.derived_sentinel) {
            Some(Era::Derived)
        } else {
            None
        }
    }
}

/// Parameters of the one-dimensional REML search over the variance ratio
/// `lambda = subject_variance / residual_variance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemlSearchConfig {
    /// Number of log-spaced grid points scanned before refinement.
    pub grid_points: usize,
    /// Smallest nonzero ratio on the grid.
    pub ratio_floor: f64,
    /// Largest ratio on the grid.
    pub ratio_ceiling: f64,
    /// Width of the bracketing interval (in log-ratio units) at which the
    /// golden-section refinement stops.
    pub refine_tolerance: f64,
    /// Hard cap on refinement iterations.
    pub max_refine_iterations: usize,
}

impl Default for RemlSearchConfig {
    fn default() -> Self {
        Self {
            grid_points: 61,
            ratio_floor: 1e-8,
            ratio_ceiling: 1e8,
            refine_tolerance: 1e-10,
            max_refine_iterations: 200,
        }
    }
}

/// Top-level configuration for one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Metrics to fit, in the order they are reported. The set is fixed at
    /// configuration time, never inferred from the table.
    pub metrics: Vec<String>,
    /// Era label domain, including the derived-row sentinel.
    pub era_domain: EraDomain,
    /// Maximum tolerated fraction of missing values in a metric column
    /// before the fit is refused with an insufficient-data error.
    pub max_missing_fraction: f64,
    /// Columns excluded from numeric-column selection even when their
    /// values happen to be numeric (identifiers, provenance tags).
    pub identifier_columns: Vec<String>,
    /// Optional cap on the number of reported principal components. The
    /// structural cap `min(rows, columns) - 1` always applies on top.
    pub max_components: Option<usize>,
    /// REML search parameters.
    pub reml: RemlSearchConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            metrics: Vec::new(),
            era_domain: EraDomain::default(),
            max_missing_fraction: 0.5,
            identifier_columns: Vec::new(),
            max_components: None,
            reml: RemlSearchConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Convenience constructor: default policy with a fixed metric list.
    pub fn with_metrics(metrics: Vec<String>) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }
}
