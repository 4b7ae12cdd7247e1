//! Missing-data imputation.
//!
//! Column-mean imputation only: every missing cell is replaced by the
//! arithmetic mean of the observed values in the same column, computed
//! within the current run. This is deliberately plain (no regression or
//! nearest-neighbor machinery) and is documented as a known limitation.

use std::collections::BTreeMap;

use log::{debug, warn};
use ndarray::Array2;

use crate::error::AnalysisError;
use crate::table::FeatureTable;

/// Outcome of imputing a feature table.
///
/// Columns with zero observed values cannot be imputed; they are dropped
/// from `features` and reported in `failures` as [`AnalysisError::EmptyColumn`]
/// so the caller can explain their absence.
#[derive(Debug)]
pub struct Imputation {
    /// The fully populated feature table (empty columns removed).
    pub features: FeatureTable,
    /// Mask aligned with `features`: `true` where a cell was imputed.
    pub mask: Array2<bool>,
    /// Total number of imputed cells.
    pub imputed_cells: usize,
    /// Imputed-cell count per surviving column.
    pub imputed_per_column: BTreeMap<String, usize>,
    /// One [`AnalysisError::EmptyColumn`] per dropped column.
    pub failures: Vec<AnalysisError>,
}

/// Replaces missing (NaN) cells with their column means.
///
/// Imputing an already fully populated column returns it unchanged and
/// marks zero cells imputed.
pub fn impute_column_means(features: &FeatureTable) -> Imputation {
    let n_rows = features.nrows();
    let mut kept_indices = Vec::with_capacity(features.ncols());
    let mut failures = Vec::new();

    // Locate the all-missing columns first so the output mask can be built
    // against the surviving shape directly.
    for (j, column) in features.columns().iter().enumerate() {
        let observed = features.data().column(j).iter().filter(|v| !v.is_nan()).count();
        if observed == 0 {
            warn!("Column '{}' has no observed values; dropping it.", column);
            failures.push(AnalysisError::EmptyColumn {
                column: column.clone(),
            });
        } else {
            kept_indices.push(j);
        }
    }

    let kept = features.select_columns(&kept_indices);
    let mut data = kept.data().clone();
    let mut mask = Array2::<bool>::from_elem((n_rows, kept.ncols()), false);
    let mut imputed_per_column = BTreeMap::new();
    let mut imputed_cells = 0usize;

    for (j, column) in kept.columns().iter().enumerate() {
        let mut sum = 0.0f64;
        let mut observed = 0usize;
        for v in data.column(j).iter() {
            if !v.is_nan() {
                sum += *v;
                observed += 1;
            }
        }
        // kept_indices guarantees observed > 0 here
        let mean = sum / observed as f64;

        let mut filled = 0usize;
        for i in 0..n_rows {
            if data[[i, j]].is_nan() {
                data[[i, j]] = mean;
                mask[[i, j]] = true;
                filled += 1;
            }
        }
        if filled > 0 {
            imputed_per_column.insert(column.clone(), filled);
            imputed_cells += filled;
        }
    }

    if imputed_cells > 0 {
        debug!(
            "Imputed {} cells across {} columns.",
            imputed_cells,
            imputed_per_column.len()
        );
    }

    let features = FeatureTable::from_parts(
        data,
        kept.columns().to_vec(),
        kept.rows().to_vec(),
    )
    .expect("imputed matrix keeps the shape of its source table");

    Imputation {
        features,
        mask,
        imputed_cells,
        imputed_per_column,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::RowMeta;
    use ndarray::array;

    fn meta(n: usize) -> Vec<RowMeta> {
        (0..n)
            .map(|i| RowMeta {
                subject_id: format!("S{}", i),
                category: None,
                cohort: None,
            })
            .collect()
    }

    fn features(data: Array2<f64>, columns: &[&str]) -> FeatureTable {
        let rows = meta(data.nrows());
        FeatureTable::from_parts(
            data,
            columns.iter().map(|c| c.to_string()).collect(),
            rows,
        )
        .unwrap()
    }

    #[test]
    fn fills_missing_cells_with_column_mean() {
        let table = features(
            array![[1.0, 10.0], [f64::NAN, 20.0], [3.0, f64::NAN]],
            &["a", "b"],
        );
        let result = impute_column_means(&table);
        assert_eq!(result.imputed_cells, 2);
        assert_eq!(result.features.data()[[1, 0]], 2.0);
        assert_eq!(result.features.data()[[2, 1]], 15.0);
        assert!(result.mask[[1, 0]]);
        assert!(result.mask[[2, 1]]);
        assert!(!result.mask[[0, 0]]);
        assert_eq!(result.imputed_per_column.get("a"), Some(&1));
        assert!(result.failures.is_empty());
    }

    #[test]
    fn imputation_is_idempotent_on_complete_columns() {
        let table = features(array![[1.0, 2.0], [3.0, 4.0]], &["a", "b"]);
        let result = impute_column_means(&table);
        assert_eq!(result.imputed_cells, 0);
        assert!(result.mask.iter().all(|&m| !m));
        assert_eq!(result.features.data(), table.data());

        // Imputing the output again changes nothing.
        let again = impute_column_means(&result.features);
        assert_eq!(again.imputed_cells, 0);
        assert_eq!(again.features.data(), result.features.data());
    }

    #[test]
    fn all_missing_column_is_dropped_with_a_captured_error() {
        let table = features(
            array![[1.0, f64::NAN], [2.0, f64::NAN]],
            &["ok", "hollow"],
        );
        let result = impute_column_means(&table);
        assert_eq!(result.features.columns(), &["ok".to_string()]);
        assert_eq!(result.failures.len(), 1);
        assert!(matches!(
            &result.failures[0],
            AnalysisError::EmptyColumn { column } if column == "hollow"
        ));
        // The run still completes for the surviving column.
        assert_eq!(result.features.nrows(), 2);
    }
}
