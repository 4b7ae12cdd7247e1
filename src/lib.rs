// Repeated-measures era comparison and principal component analysis

#![doc = include_str!("../README.md")]

pub mod analyzer;
pub mod config;
pub mod error;
pub mod impute;
pub mod mixed_model;
pub mod reduction;
pub mod report;
pub mod table;

pub use analyzer::Analyzer;
pub use config::{AnalysisConfig, EraDomain, RemlSearchConfig};
pub use error::{AnalysisError, AnalysisResult};
pub use impute::{impute_column_means, Imputation};
pub use mixed_model::{fit_era_contrast, DfMethod, MetricFit};
pub use reduction::{principal_components, standardize, Contribution, Reduction};
pub use report::{
    AnalysisDiagnostics, AnalysisReport, CategoryRanking, ComparisonReport, MetricOutcome,
    MetricRow, ReductionReport,
};
pub use table::{Era, FeatureTable, MetricTable, Observation, RawRecord, RowMeta};
