//! Result aggregation.
//!
//! Assembles per-metric fits and the reduction into one serializable
//! report. Metric ordering follows the configured fixed order, component
//! ordering follows descending explained variance, and every missing unit
//! is explained by a captured error or a diagnostics entry; silent
//! omission is disallowed.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::Serialize;

use crate::error::AnalysisError;
use crate::mixed_model::MetricFit;
use crate::reduction::{Contribution, Reduction};
use crate::table::{Era, MetricTable, RowMeta};

/// Outcome of one metric's comparison: a fit, or the captured failure.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricOutcome {
    Fit(MetricFit),
    Failed { error: AnalysisError },
}

/// One row of the comparison report.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRow {
    pub metric: String,
    pub outcome: MetricOutcome,
}

/// Per-metric comparison results in the configured metric order.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub metrics: Vec<MetricRow>,
}

impl ComparisonReport {
    /// The successfully fitted rows, in report order.
    pub fn fits(&self) -> impl Iterator<Item = &MetricFit> {
        self.metrics.iter().filter_map(|row| match &row.outcome {
            MetricOutcome::Fit(fit) => Some(fit),
            MetricOutcome::Failed { .. } => None,
        })
    }
}

/// Serializable view of the reduction result.
#[derive(Debug, Serialize)]
pub struct ReductionReport {
    /// Variable names, aligned with loadings rows.
    pub columns: Vec<String>,
    /// Row metadata aligned with coordinate rows (category and cohort
    /// labels for stratified presentation).
    pub rows: Vec<RowMeta>,
    /// Explained-variance fraction per component, descending.
    pub explained_variance: Vec<f64>,
    /// Loadings, shape (variables, components).
    pub loadings: Array2<f64>,
    /// Coordinates, shape (rows, components).
    pub coordinates: Array2<f64>,
    /// Ranked variable contributions per component.
    pub contributions: Vec<Vec<Contribution>>,
}

impl From<Reduction> for ReductionReport {
    fn from(reduction: Reduction) -> Self {
        Self {
            columns: reduction.columns,
            rows: reduction.rows,
            explained_variance: reduction.explained_variance,
            loadings: reduction.loadings,
            coordinates: reduction.coordinates,
            contributions: reduction.contributions,
        }
    }
}

/// Diagnostics accompanying every report. A consumer must be able to tell
/// from this object why any expected metric or component is absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisDiagnostics {
    /// Derived difference rows removed before analysis.
    pub derived_rows_excluded: usize,
    /// Total imputed cells in the reduction input.
    pub imputed_cells: usize,
    /// Imputed-cell count per column.
    pub imputed_per_column: BTreeMap<String, usize>,
    /// Columns dropped because they had no observed values.
    pub empty_columns: Vec<String>,
    /// Columns dropped because they had zero variance.
    pub degenerate_columns: Vec<String>,
    /// Metrics whose REML fit did not converge.
    pub non_convergent_metrics: Vec<String>,
    /// Metrics refused for insufficient data.
    pub insufficient_data_metrics: Vec<String>,
    /// Per metric: subjects observed in only one era (still modeled).
    pub partially_observed_subjects: BTreeMap<String, Vec<String>>,
    /// Why the reduction is absent from the report, when it is.
    pub reduction_failure: Option<AnalysisError>,
}

/// Average derived-row differences for one category.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryAverage {
    pub category: String,
    /// Distinct subjects contributing derived rows in this category.
    pub subjects: usize,
    /// Mean difference per metric over the category's derived rows.
    pub per_metric: BTreeMap<String, f64>,
    /// Mean over all observed difference cells in the category.
    pub overall: f64,
}

/// Categories ranked by overall average difference, descending.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryRanking {
    pub entries: Vec<CategoryAverage>,
}

/// Ranks categories by their average derived-row differences.
///
/// Uses the precomputed difference rows, so it must run before
/// [`MetricTable::exclude_derived_rows`]. Returns `None` when the table
/// carries no categorized derived rows.
pub fn rank_categories(table: &MetricTable, metrics: &[String]) -> Option<CategoryRanking> {
    struct Accumulator {
        subjects: std::collections::BTreeSet<String>,
        per_metric: BTreeMap<String, (f64, usize)>,
        cell_sum: f64,
        cell_count: usize,
    }

    let mut by_category: BTreeMap<String, Accumulator> = BTreeMap::new();
    for obs in table.observations() {
        if obs.era != Era::Derived {
            continue;
        }
        let category = match &obs.category {
            Some(c) => c.clone(),
            None => continue,
        };
        let acc = by_category.entry(category).or_insert_with(|| Accumulator {
            subjects: Default::default(),
            per_metric: Default::default(),
            cell_sum: 0.0,
            cell_count: 0,
        });
        acc.subjects.insert(obs.subject_id.clone());
        for metric in metrics {
            if let Some(v) = obs.value(metric) {
                let slot = acc.per_metric.entry(metric.clone()).or_insert((0.0, 0));
                slot.0 += v;
                slot.1 += 1;
                acc.cell_sum += v;
                acc.cell_count += 1;
            }
        }
    }

    if by_category.is_empty() {
        return None;
    }

    let mut entries: Vec<CategoryAverage> = by_category
        .into_iter()
        .filter(|(_, acc)| acc.cell_count > 0)
        .map(|(category, acc)| CategoryAverage {
            category,
            subjects: acc.subjects.len(),
            per_metric: acc
                .per_metric
                .into_iter()
                .map(|(metric, (sum, count))| (metric, sum / count as f64))
                .collect(),
            overall: acc.cell_sum / acc.cell_count as f64,
        })
        .collect();
    if entries.is_empty() {
        return None;
    }
    entries.sort_by(|a, b| {
        b.overall
            .partial_cmp(&a.overall)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.category.cmp(&b.category))
    });
    Some(CategoryRanking { entries })
}

/// The full analysis report handed to the presentation layer.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub comparison: ComparisonReport,
    pub reduction: Option<ReductionReport>,
    /// Category ranking over derived difference rows, when present.
    pub category_ranking: Option<CategoryRanking>,
    pub diagnostics: AnalysisDiagnostics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EraDomain;
    use crate::table::RawRecord;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn derived(subject: &str, category: &str, comb: f64, solo: Option<f64>) -> RawRecord {
        let mut metrics = BTreeMap::new();
        metrics.insert("Comb".to_string(), Some(comb));
        metrics.insert("Solo".to_string(), solo);
        RawRecord {
            subject_id: subject.to_string(),
            era: "Difference".to_string(),
            category: Some(category.to_string()),
            metrics,
        }
    }

    #[test]
    fn ranks_categories_by_overall_average_difference() {
        let table = MetricTable::from_records(
            vec![
                derived("A", "LB", 2.0, Some(4.0)),
                derived("B", "LB", 4.0, None),
                derived("C", "CB", -1.0, Some(1.0)),
            ],
            &EraDomain::default(),
        )
        .unwrap();
        let metrics = vec!["Comb".to_string(), "Solo".to_string()];
        let ranking = rank_categories(&table, &metrics).unwrap();

        assert_eq!(ranking.entries.len(), 2);
        assert_eq!(ranking.entries[0].category, "LB");
        assert_eq!(ranking.entries[0].subjects, 2);
        // LB cells: 2, 4, 4 -> 10/3
        assert_relative_eq!(ranking.entries[0].overall, 10.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(ranking.entries[0].per_metric["Comb"], 3.0, epsilon = 1e-12);
        assert_relative_eq!(ranking.entries[1].overall, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn no_derived_rows_means_no_ranking() {
        let mut metrics = BTreeMap::new();
        metrics.insert("Comb".to_string(), Some(1.0));
        let table = MetricTable::from_records(
            vec![RawRecord {
                subject_id: "A".to_string(),
                era: "Before".to_string(),
                category: Some("LB".to_string()),
                metrics,
            }],
            &EraDomain::default(),
        )
        .unwrap();
        assert!(rank_categories(&table, &["Comb".to_string()]).is_none());
    }

    #[test]
    fn reports_serialize_to_json() {
        let report = AnalysisReport {
            comparison: ComparisonReport {
                metrics: vec![MetricRow {
                    metric: "Comb".to_string(),
                    outcome: MetricOutcome::Failed {
                        error: AnalysisError::InsufficientData {
                            unit: "Comb".to_string(),
                            reason: "only one era level observed".to_string(),
                        },
                    },
                }],
            },
            reduction: None,
            category_ranking: None,
            diagnostics: AnalysisDiagnostics::default(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("only one era level observed"));
    }
}
