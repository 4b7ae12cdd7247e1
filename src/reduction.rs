//! Dimensionality reduction engine.
//!
//! Projects the imputed numeric feature table onto orthogonal components
//! that maximize explained variance. Each column is centered and scaled to
//! unit variance, the covariance of the standardized columns is
//! eigendecomposed, and components are reported in descending eigenvalue
//! order together with loadings, per-row coordinates, and ranked variable
//! contributions. Row metadata (category, cohort) rides along for
//! stratified presentation and never influences the fit.

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::eigh::Eigh;
use ndarray_linalg::UPLO;
use serde::Serialize;

use crate::error::{AnalysisError, AnalysisResult};
use crate::table::{FeatureTable, RowMeta};

/// Standard deviations at or below this are treated as zero variance.
const DEGENERATE_STD_FLOOR: f64 = 1e-12;

/// A standardized feature matrix with degenerate columns removed.
#[derive(Debug)]
pub struct Standardized {
    /// Column-standardized data (mean 0, unit variance per column).
    pub data: Array2<f64>,
    /// Names of the surviving columns, in matrix order.
    pub columns: Vec<String>,
    /// Column means of the surviving columns.
    pub means: Vec<f64>,
    /// Sample standard deviations of the surviving columns.
    pub std_devs: Vec<f64>,
    /// One [`AnalysisError::DegenerateColumn`] per dropped column.
    pub degenerate: Vec<AnalysisError>,
}

/// One variable's share of a component's variance, as a percentage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub variable: String,
    pub percent: f64,
}

/// Result of the reduction. Immutable once computed.
#[derive(Debug)]
pub struct Reduction {
    /// Surviving variable names, in loadings-row order.
    pub columns: Vec<String>,
    /// Row metadata aligned 1:1 with `coordinates` rows.
    pub rows: Vec<RowMeta>,
    /// Eigenvalues in descending order (round-off negatives clamped to 0).
    pub eigenvalues: Vec<f64>,
    /// Explained-variance fraction per component, same order.
    pub explained_variance: Vec<f64>,
    /// Loadings matrix, shape (variables, components).
    pub loadings: Array2<f64>,
    /// Coordinates matrix, shape (rows, components).
    pub coordinates: Array2<f64>,
    /// Per-component variable contributions, ranked descending.
    pub contributions: Vec<Vec<Contribution>>,
    /// Degenerate-column errors carried through from standardization.
    pub degenerate: Vec<AnalysisError>,
}

/// Centers and scales each column to unit variance.
///
/// Columns whose standard deviation is zero cannot be scaled; each one is
/// captured as [`AnalysisError::DegenerateColumn`] and dropped, and the run
/// continues with the remaining columns. The input must be fully
/// populated: imputation runs first by pipeline order, and a NaN here is a
/// contract violation rather than a missing value.
pub fn standardize(features: &FeatureTable) -> AnalysisResult<Standardized> {
    let n_rows = features.nrows();
    if n_rows < 2 {
        return Err(AnalysisError::InsufficientData {
            unit: "feature table".to_string(),
            reason: format!("standardization needs at least 2 rows, got {}", n_rows),
        });
    }
    if features.data().iter().any(|v| v.is_nan()) {
        return Err(AnalysisError::InsufficientData {
            unit: "feature table".to_string(),
            reason: "matrix contains missing cells; impute before reduction".to_string(),
        });
    }

    let mut kept_columns = Vec::new();
    let mut kept_indices = Vec::new();
    let mut means = Vec::new();
    let mut std_devs = Vec::new();
    let mut degenerate = Vec::new();

    for (j, column) in features.columns().iter().enumerate() {
        let col = features.data().column(j);
        let mut sum = 0.0f64;
        for v in col.iter() {
            sum += *v;
        }
        let mean = sum / n_rows as f64;
        let mut sum_sq = 0.0f64;
        for v in col.iter() {
            sum_sq += (*v - mean).powi(2);
        }
        let std_dev = (sum_sq / (n_rows as f64 - 1.0)).sqrt();

        if std_dev <= DEGENERATE_STD_FLOOR || !std_dev.is_finite() {
            warn!("Column '{}' is constant; excluding it from the reduction.", column);
            degenerate.push(AnalysisError::DegenerateColumn {
                column: column.clone(),
            });
        } else {
            kept_columns.push(column.clone());
            kept_indices.push(j);
            means.push(mean);
            std_devs.push(std_dev);
        }
    }

    if kept_columns.is_empty() {
        return Err(AnalysisError::InsufficientData {
            unit: "feature table".to_string(),
            reason: "no columns with nonzero variance remain".to_string(),
        });
    }

    let mut data = features.data().select(Axis(1), &kept_indices);
    for (k, mut col) in data.axis_iter_mut(Axis(1)).enumerate() {
        let mean = means[k];
        let std_dev = std_devs[k];
        col.mapv_inplace(|v| (v - mean) / std_dev);
    }

    debug!(
        "Standardized {} columns ({} degenerate dropped).",
        kept_columns.len(),
        degenerate.len()
    );
    Ok(Standardized {
        data,
        columns: kept_columns,
        means,
        std_devs,
        degenerate,
    })
}

/// Computes the principal components of a fully populated feature table.
///
/// The number of computable components is capped at
/// `min(rows, columns) - 1`, which keeps aggregate tables with more
/// columns than rows well behaved; `max_components` may lower the cap
/// further. Explained-variance fractions divide each eigenvalue by the sum
/// over all eigenvalues of the standardized covariance.
pub fn principal_components(
    features: &FeatureTable,
    max_components: Option<usize>,
) -> AnalysisResult<Reduction> {
    let standardized = standardize(features)?;
    let n_rows = standardized.data.nrows();
    let n_cols = standardized.data.ncols();

    info!(
        "Reducing {} rows x {} columns via covariance eigendecomposition.",
        n_rows, n_cols
    );

    let mut covariance = standardized.data.t().dot(&standardized.data);
    covariance /= (n_rows - 1) as f64;

    let (values, vectors) = covariance.eigh(UPLO::Upper).map_err(|e| {
        AnalysisError::InsufficientData {
            unit: "feature table".to_string(),
            reason: format!("eigendecomposition of the covariance failed: {}", e),
        }
    })?;

    // Descending eigenvalue order, clamping tiny negatives from round-off.
    let mut eig_pairs: Vec<(f64, Array1<f64>)> = values
        .iter()
        .map(|v| v.max(0.0))
        .zip(vectors.columns().into_iter().map(|col| col.to_owned()))
        .collect();
    eig_pairs.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let total_variance: f64 = eig_pairs.iter().map(|(v, _)| v).sum();
    if total_variance <= 0.0 {
        return Err(AnalysisError::InsufficientData {
            unit: "feature table".to_string(),
            reason: "covariance has no positive eigenvalues".to_string(),
        });
    }

    let structural_cap = n_rows.min(n_cols).saturating_sub(1).max(1);
    let n_components = match max_components {
        Some(cap) => structural_cap.min(cap.max(1)),
        None => structural_cap,
    };

    let mut loadings = Array2::<f64>::zeros((n_cols, n_components));
    let mut eigenvalues = Vec::with_capacity(n_components);
    for (k, (value, vector)) in eig_pairs.iter().take(n_components).enumerate() {
        loadings.slice_mut(s![.., k]).assign(vector);
        eigenvalues.push(*value);
    }

    let explained_variance: Vec<f64> =
        eigenvalues.iter().map(|v| v / total_variance).collect();
    let coordinates = standardized.data.dot(&loadings);

    // Contribution of a variable to a component: squared loading
    // normalized to sum to 100% across variables, ranked descending.
    let mut contributions = Vec::with_capacity(n_components);
    for k in 0..n_components {
        let column = loadings.column(k);
        let norm: f64 = column.iter().map(|l| l * l).sum();
        let mut ranked: Vec<Contribution> = standardized
            .columns
            .iter()
            .zip(column.iter())
            .map(|(variable, l)| Contribution {
                variable: variable.clone(),
                percent: if norm > 0.0 { l * l / norm * 100.0 } else { 0.0 },
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.percent
                .partial_cmp(&a.percent)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.variable.cmp(&b.variable))
        });
        contributions.push(ranked);
    }

    debug!(
        "Kept {} components; leading fraction {:.4}.",
        n_components,
        explained_variance.first().copied().unwrap_or(0.0)
    );

    Ok(Reduction {
        columns: standardized.columns,
        rows: features.rows().to_vec(),
        eigenvalues,
        explained_variance,
        loadings,
        coordinates,
        contributions,
        degenerate: standardized.degenerate,
    })
}
