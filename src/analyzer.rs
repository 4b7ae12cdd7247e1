//! Pipeline orchestration.
//!
//! Drives one analysis run: table assembly, derived-row exclusion,
//! per-metric comparison fits, imputation, reduction, and report
//! aggregation. Per-metric fits are mutually independent and run in
//! parallel; a failure in one metric is captured into its report row and
//! never aborts the others. Only a schema error is fatal.

use std::collections::BTreeSet;

use log::{info, warn};
use rayon::prelude::*;

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::impute::impute_column_means;
use crate::mixed_model::{fit_era_contrast, partially_observed_subjects};
use crate::reduction::principal_components;
use crate::report::{
    rank_categories, AnalysisDiagnostics, AnalysisReport, ComparisonReport, MetricOutcome,
    MetricRow, ReductionReport,
};
use crate::table::{FeatureTable, MetricTable, RawRecord};

/// Owns the configuration and runs the full pipeline over raw records.
#[derive(Debug, Clone)]
pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Runs both engines over one set of records and aggregates the report.
    pub fn run(&self, records: Vec<RawRecord>) -> AnalysisResult<AnalysisReport> {
        let mut table = MetricTable::from_records(records, &self.config.era_domain)?;

        // Category ranking reads the precomputed difference rows, so it
        // runs before they are excluded.
        let category_ranking = rank_categories(&table, &self.config.metrics);
        let derived_rows_excluded = table.exclude_derived_rows();

        let mut diagnostics = AnalysisDiagnostics {
            derived_rows_excluded,
            ..AnalysisDiagnostics::default()
        };

        let comparison = self.run_comparisons(&table, &mut diagnostics);
        let reduction = self.run_reduction(&table, &mut diagnostics);

        Ok(AnalysisReport {
            comparison,
            reduction,
            category_ranking,
            diagnostics,
        })
    }

    /// Fits every configured metric, in parallel, capturing each metric's
    /// fit or error independently. Rows come back in the configured order.
    fn run_comparisons(
        &self,
        table: &MetricTable,
        diagnostics: &mut AnalysisDiagnostics,
    ) -> ComparisonReport {
        info!(
            "Fitting era contrasts for {} metrics over {} observations.",
            self.config.metrics.len(),
            table.n_observations()
        );

        let rows: Vec<MetricRow> = self
            .config
            .metrics
            .par_iter()
            .map(|metric| {
                let outcome = match fit_era_contrast(table, metric, &self.config) {
                    Ok(fit) => MetricOutcome::Fit(fit),
                    Err(error) => {
                        warn!("Comparison for '{}' failed: {}", metric, error);
                        MetricOutcome::Failed { error }
                    }
                };
                MetricRow {
                    metric: metric.clone(),
                    outcome,
                }
            })
            .collect();

        for row in &rows {
            match &row.outcome {
                MetricOutcome::Failed {
                    error: AnalysisError::NonConvergence { .. },
                } => diagnostics.non_convergent_metrics.push(row.metric.clone()),
                MetricOutcome::Failed {
                    error: AnalysisError::InsufficientData { .. },
                } => diagnostics
                    .insufficient_data_metrics
                    .push(row.metric.clone()),
                _ => {}
            }
            let partial = partially_observed_subjects(table, &row.metric);
            if !partial.is_empty() {
                diagnostics
                    .partially_observed_subjects
                    .insert(row.metric.clone(), partial);
            }
        }

        ComparisonReport { metrics: rows }
    }

    /// Imputes and reduces the numeric feature table, folding imputation
    /// and column diagnostics into the run's diagnostics object.
    fn run_reduction(
        &self,
        table: &MetricTable,
        diagnostics: &mut AnalysisDiagnostics,
    ) -> Option<ReductionReport> {
        let columns = table.numeric_columns(&self.config.identifier_columns);
        let features = FeatureTable::from_table(table, &columns, None);
        self.reduce_features(features, diagnostics)
    }

    fn reduce_features(
        &self,
        features: FeatureTable,
        diagnostics: &mut AnalysisDiagnostics,
    ) -> Option<ReductionReport> {
        let imputation = impute_column_means(&features);
        diagnostics.imputed_cells = imputation.imputed_cells;
        diagnostics.imputed_per_column = imputation.imputed_per_column.clone();
        for failure in &imputation.failures {
            if let AnalysisError::EmptyColumn { column } = failure {
                diagnostics.empty_columns.push(column.clone());
            }
        }

        match principal_components(&imputation.features, self.config.max_components) {
            Ok(reduction) => {
                for degenerate in &reduction.degenerate {
                    if let AnalysisError::DegenerateColumn { column } = degenerate {
                        diagnostics.degenerate_columns.push(column.clone());
                    }
                }
                Some(ReductionReport::from(reduction))
            }
            Err(error) => {
                warn!("Reduction skipped: {}", error);
                diagnostics.reduction_failure = Some(error);
                None
            }
        }
    }

    /// Reduction over several cohorts at once: each cohort's records become
    /// a feature table tagged with the cohort label, the tables are
    /// row-concatenated, and the combined table is imputed and reduced.
    /// The reduction itself is cohort-agnostic; the tags only stratify the
    /// resulting coordinates.
    pub fn reduce_cohorts(
        &self,
        cohorts: Vec<(String, Vec<RawRecord>)>,
    ) -> AnalysisResult<(Option<ReductionReport>, AnalysisDiagnostics)> {
        let mut tables = Vec::with_capacity(cohorts.len());
        let mut diagnostics = AnalysisDiagnostics::default();
        for (label, records) in cohorts {
            let mut table = MetricTable::from_records(records, &self.config.era_domain)?;
            diagnostics.derived_rows_excluded += table.exclude_derived_rows();
            tables.push((label, table));
        }

        // One shared column set so the cohort tables concatenate cleanly.
        let columns: Vec<String> = tables
            .iter()
            .flat_map(|(_, table)| table.numeric_columns(&self.config.identifier_columns))
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();

        let mut combined: Option<FeatureTable> = None;
        for (label, table) in &tables {
            let features = FeatureTable::from_table(table, &columns, Some(label));
            combined = Some(match combined {
                Some(existing) => existing.concat(&features)?,
                None => features,
            });
        }

        let combined = combined.ok_or_else(|| AnalysisError::InsufficientData {
            unit: "feature table".to_string(),
            reason: "no cohorts supplied".to_string(),
        })?;

        info!(
            "Combined {} cohorts into {} rows x {} columns.",
            tables.len(),
            combined.nrows(),
            combined.ncols()
        );
        let reduction = self.reduce_features(combined, &mut diagnostics);
        Ok((reduction, diagnostics))
    }
}
