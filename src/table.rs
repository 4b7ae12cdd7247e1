//! Tabular data model.
//!
//! Holds validated observations and exposes column-oriented views for the
//! comparison and reduction engines. The table is immutable once loaded,
//! apart from the explicit derived-row exclusion step which must run before
//! either engine does.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::EraDomain;
use crate::error::{AnalysisError, AnalysisResult};

/// One of the two time periods being compared, or the reserved sentinel for
/// precomputed per-subject difference rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Era {
    /// The "before" condition; the reference level of the era contrast.
    Reference,
    /// The "after" condition; the contrast is comparison minus reference.
    Comparison,
    /// Derived difference row. Excluded before analysis.
    Derived,
}

/// A normalized input row as handed over by the ingestion collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stable subject identifier. Must be non-empty.
    pub subject_id: String,
    /// Raw era label; normalized against the configured [`EraDomain`].
    pub era: String,
    /// Optional external classification label (e.g. a position group).
    pub category: Option<String>,
    /// Flat mapping from metric name to value; `None` marks a missing cell.
    pub metrics: BTreeMap<String, Option<f64>>,
}

/// One validated (subject, era) row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Observation {
    pub subject_id: String,
    pub era: Era,
    pub category: Option<String>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl Observation {
    /// The value of one metric in this observation, if present and observed.
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).copied().flatten()
    }
}

/// Validated in-memory table of observations.
#[derive(Clone, Debug)]
pub struct MetricTable {
    observations: Vec<Observation>,
}

impl MetricTable {
    /// Assembles a table from raw records.
    ///
    /// Fails with a schema error (fatal) on an empty subject id, an era
    /// label outside the configured domain, a non-finite metric value, or a
    /// duplicate (subject, era) pair. Missing cells must arrive as `None`,
    /// never as NaN, so that NaN inside the numeric views always means
    /// "missing by policy".
    pub fn from_records(
        records: Vec<RawRecord>,
        era_domain: &EraDomain,
    ) -> AnalysisResult<Self> {
        let mut observations = Vec::with_capacity(records.len());
        let mut seen: HashSet<(String, Era)> = HashSet::with_capacity(records.len());

        for (record_index, record) in records.into_iter().enumerate() {
            let subject_id = record.subject_id.trim().to_string();
            if subject_id.is_empty() {
                return Err(AnalysisError::Schema {
                    record_index,
                    reason: "empty subject id".to_string(),
                });
            }

            let era = era_domain.classify(&record.era).ok_or_else(|| {
                AnalysisError::Schema {
                    record_index,
                    reason: format!("era label '{}' outside the configured domain", record.era),
                }
            })?;

            for (metric, value) in &record.metrics {
                if let Some(v) = value {
                    if !v.is_finite() {
                        return Err(AnalysisError::Schema {
                            record_index,
                            reason: format!(
                                "non-finite value {} for metric '{}' (missing cells must be null)",
                                v, metric
                            ),
                        });
                    }
                }
            }

            if !seen.insert((subject_id.clone(), era)) {
                return Err(AnalysisError::Schema {
                    record_index,
                    reason: format!(
                        "duplicate observation for subject '{}' in era {:?}",
                        subject_id, era
                    ),
                });
            }

            let category = record
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);

            observations.push(Observation {
                subject_id,
                era,
                category,
                metrics: record.metrics,
            });
        }

        info!("Assembled metric table with {} observations.", observations.len());
        Ok(Self { observations })
    }

    /// Removes derived difference rows and returns the count removed.
    /// Idempotent: a second call removes nothing.
    pub fn exclude_derived_rows(&mut self) -> usize {
        let before = self.observations.len();
        self.observations.retain(|obs| obs.era != Era::Derived);
        let removed = before - self.observations.len();
        if removed > 0 {
            debug!("Excluded {} derived difference rows.", removed);
        }
        removed
    }

    /// The validated observations, in input order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Observations restricted to one era.
    pub fn observations_in_era(&self, era: Era) -> impl Iterator<Item = &Observation> {
        self.observations.iter().filter(move |obs| obs.era == era)
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Distinct subject identifiers in deterministic (sorted) order.
    pub fn subject_ids(&self) -> BTreeSet<String> {
        self.observations
            .iter()
            .map(|obs| obs.subject_id.clone())
            .collect()
    }

    /// Columns whose values are uniformly numeric-or-missing across all
    /// rows, excluding designated identifier/label columns. The
    /// numeric-or-missing guarantee is structural here (the record type
    /// only admits numbers or nulls); what this selects is the sorted
    /// union of metric names minus the exclusions.
    pub fn numeric_columns(&self, identifier_columns: &[String]) -> Vec<String> {
        let excluded: BTreeSet<&str> = identifier_columns.iter().map(String::as_str).collect();
        let names: BTreeSet<String> = self
            .observations
            .iter()
            .flat_map(|obs| obs.metrics.keys())
            .filter(|name| !excluded.contains(name.as_str()))
            .cloned()
            .collect();
        names.into_iter().collect()
    }
}

/// Non-numeric identifying metadata for one feature-table row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RowMeta {
    pub subject_id: String,
    /// Stratification label carried through for presentation only.
    pub category: Option<String>,
    /// Origin tag when several cohorts are row-concatenated.
    pub cohort: Option<String>,
}

/// A numeric feature matrix with a row-aligned metadata table.
///
/// Missing cells are NaN. The matrix and the metadata vector are aligned
/// 1:1 by construction; every filtering operation on this type applies to
/// both sides at once.
#[derive(Clone, Debug)]
pub struct FeatureTable {
    data: Array2<f64>,
    columns: Vec<String>,
    rows: Vec<RowMeta>,
}

impl FeatureTable {
    /// Builds a feature table over the given columns, one row per
    /// non-derived observation. A cohort tag, when given, is attached to
    /// every row's metadata.
    pub fn from_table(table: &MetricTable, columns: &[String], cohort: Option<&str>) -> Self {
        let kept: Vec<&Observation> = table
            .observations()
            .iter()
            .filter(|obs| obs.era != Era::Derived)
            .collect();

        let mut data = Array2::<f64>::from_elem((kept.len(), columns.len()), f64::NAN);
        let mut rows = Vec::with_capacity(kept.len());
        for (i, obs) in kept.iter().enumerate() {
            for (j, column) in columns.iter().enumerate() {
                if let Some(v) = obs.value(column) {
                    data[[i, j]] = v;
                }
            }
            rows.push(RowMeta {
                subject_id: obs.subject_id.clone(),
                category: obs.category.clone(),
                cohort: cohort.map(str::to_string),
            });
        }

        debug!(
            "Built feature table: {} rows x {} columns{}.",
            rows.len(),
            columns.len(),
            cohort.map(|c| format!(" (cohort '{}')", c)).unwrap_or_default()
        );
        Self {
            data,
            columns: columns.to_vec(),
            rows,
        }
    }

    /// Constructs a feature table from parts. The matrix shape must agree
    /// with the column and row metadata lengths.
    pub fn from_parts(
        data: Array2<f64>,
        columns: Vec<String>,
        rows: Vec<RowMeta>,
    ) -> AnalysisResult<Self> {
        if data.nrows() != rows.len() || data.ncols() != columns.len() {
            return Err(AnalysisError::Schema {
                record_index: 0,
                reason: format!(
                    "feature matrix {}x{} does not align with {} row labels and {} columns",
                    data.nrows(),
                    data.ncols(),
                    rows.len(),
                    columns.len()
                ),
            });
        }
        Ok(Self { data, columns, rows })
    }

    /// Row-concatenates two cohorts. The column sets must agree exactly;
    /// the reduction itself is cohort-agnostic and only the row metadata
    /// keeps the origin apart.
    pub fn concat(&self, other: &FeatureTable) -> AnalysisResult<FeatureTable> {
        if self.columns != other.columns {
            return Err(AnalysisError::Schema {
                record_index: 0,
                reason: "cohort feature tables have differing column sets".to_string(),
            });
        }
        let data = ndarray::concatenate(
            ndarray::Axis(0),
            &[self.data.view(), other.data.view()],
        )
        .map_err(|e| AnalysisError::Schema {
            record_index: 0,
            reason: format!("cohort concatenation failed: {}", e),
        })?;
        let mut rows = self.rows.clone();
        rows.extend(other.rows.iter().cloned());
        Ok(FeatureTable {
            data,
            columns: self.columns.clone(),
            rows,
        })
    }

    /// A copy restricted to the columns at `keep` (in that order). Row
    /// metadata is untouched, so alignment is preserved.
    pub fn select_columns(&self, keep: &[usize]) -> FeatureTable {
        let data = self.data.select(ndarray::Axis(1), keep);
        let columns = keep.iter().map(|&j| self.columns[j].clone()).collect();
        FeatureTable {
            data,
            columns,
            rows: self.rows.clone(),
        }
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[RowMeta] {
        &self.rows
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }
}
