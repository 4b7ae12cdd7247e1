//! Group comparison engine.
//!
//! For one metric at a time, fits the repeated-measures model
//! `metric ~ era + (1 | subject)` (a fixed effect for the era contrast and
//! a random intercept per subject) by restricted maximum likelihood, and
//! reports whether the era contrast is distinguishable from zero.
//!
//! The random-intercept covariance is block diagonal per subject
//! (`sigma_e^2 * I + sigma_u^2 * J`), so for a candidate variance ratio
//! `lambda = sigma_u^2 / sigma_e^2` the GLS weights, the profiled residual
//! variance, and the REML criterion all have closed forms via the
//! Sherman-Morrison inverse and the matrix determinant lemma. REML then
//! reduces to a one-dimensional minimization over `lambda`, done here with
//! a log-spaced grid scan followed by golden-section refinement. No
//! general-purpose mixed-model solver is involved.

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::table::{Era, MetricTable};

/// Degrees-of-freedom approximation used for the era contrast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DfMethod {
    /// Between-within (containment) approximation:
    /// `df = n_observations - n_subjects - 1`, clamped to at least 1.
    /// Reduces to the paired-t degrees of freedom (m - 1) for complete
    /// two-era data.
    Containment,
}

/// Fitted era contrast for a single metric. Immutable once computed.
#[derive(Debug, Clone, Serialize)]
pub struct MetricFit {
    /// Metric this fit describes.
    pub metric: String,
    /// Fixed-effect point estimate: comparison era minus reference era.
    pub estimate: f64,
    /// Standard error of the estimate, from the estimated variance
    /// components.
    pub std_error: f64,
    /// `estimate / std_error`.
    pub t_statistic: f64,
    /// Two-sided p-value from a Student-t distribution.
    pub p_value: f64,
    /// Degrees of freedom behind the p-value.
    pub degrees_of_freedom: f64,
    /// Which approximation produced `degrees_of_freedom`.
    pub df_method: DfMethod,
    /// Estimated between-subject (random intercept) variance.
    pub subject_variance: f64,
    /// Estimated residual variance.
    pub residual_variance: f64,
    /// Number of observations with an observed value for this metric.
    pub n_observations: usize,
    /// Number of distinct subjects contributing observations.
    pub n_subjects: usize,
    /// Convergence status. Fits are only returned when the estimator
    /// converged; a failed estimation surfaces as
    /// [`AnalysisError::NonConvergence`] instead of a silent result.
    pub converged: bool,
}

/// Per-subject sufficient statistics for one metric.
///
/// `x` is the era indicator (0 = reference, 1 = comparison); only the sums
/// below are needed to evaluate the blockwise REML criterion.
#[derive(Debug, Clone, Copy, Default)]
struct SubjectBlock {
    n: f64,
    sx: f64,
    sy: f64,
    sxx: f64,
    sxy: f64,
    syy: f64,
}

/// GLS quantities at one candidate variance ratio.
struct ProfilePoint {
    criterion: f64,
    beta1: f64,
    sigma_e2: f64,
    se1: f64,
}

/// Evaluates the profiled REML criterion at variance ratio `lambda`.
///
/// Returns `None` when the weighted normal equations are singular at this
/// ratio (e.g. the era indicator carries no within- or between-subject
/// information).
fn evaluate_profile(blocks: &[SubjectBlock], n_total: f64, lambda: f64) -> Option<ProfilePoint> {
    // W_i = I - c_i * J with c_i = lambda / (1 + n_i * lambda); the
    // residual variance is profiled out, so sigma_e^2 cancels from W.
    let mut a00 = 0.0;
    let mut a01 = 0.0;
    let mut a11 = 0.0;
    let mut b0 = 0.0;
    let mut b1 = 0.0;
    let mut ywy = 0.0;
    let mut logdet_v = 0.0;

    for block in blocks {
        let c = lambda / (1.0 + block.n * lambda);
        a00 += block.n - c * block.n * block.n;
        a01 += block.sx - c * block.n * block.sx;
        a11 += block.sxx - c * block.sx * block.sx;
        b0 += block.sy - c * block.n * block.sy;
        b1 += block.sxy - c * block.sx * block.sy;
        ywy += block.syy - c * block.sy * block.sy;
        logdet_v += (1.0 + block.n * lambda).ln();
    }

    let det = a00 * a11 - a01 * a01;
    let scale = (a00.abs() * a11.abs()).max(1.0);
    if !det.is_finite() || det <= 1e-12 * scale {
        return None;
    }

    let beta0 = (a11 * b0 - a01 * b1) / det;
    let beta1 = (a00 * b1 - a01 * b0) / det;

    // r^T W r = y^T W y - beta^T X^T W y, clamped away from zero so the
    // criterion stays finite when the fit is exact. The finiteness check
    // comes first: f64::max would swallow a NaN produced by an overflowed
    // sum of squares and turn it into the floor value.
    let rss_raw = ywy - beta0 * b0 - beta1 * b1;
    if !ywy.is_finite() || !rss_raw.is_finite() {
        return None;
    }
    let rss = rss_raw.max(1e-12 * ywy.abs().max(1.0));
    let df_resid = n_total - 2.0;
    let sigma_e2 = rss / df_resid;

    let criterion = df_resid * sigma_e2.ln() + logdet_v + det.ln();
    if !criterion.is_finite() {
        return None;
    }

    let se1 = (sigma_e2 * a00 / det).sqrt();
    if !beta1.is_finite() || !sigma_e2.is_finite() || !se1.is_finite() {
        return None;
    }
    Some(ProfilePoint {
        criterion,
        beta1,
        sigma_e2,
        se1,
    })
}

/// Golden-section minimization of `f` over `[a, b]`.
fn golden_section_min<F: Fn(f64) -> f64>(
    f: F,
    mut a: f64,
    mut b: f64,
    tolerance: f64,
    max_iterations: usize,
) -> f64 {
    const INV_PHI: f64 = 0.618_033_988_749_894_8;
    let mut c = b - INV_PHI * (b - a);
    let mut d = a + INV_PHI * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    let mut iterations = 0;
    while (b - a) > tolerance && iterations < max_iterations {
        if fc <= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_PHI * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_PHI * (b - a);
            fd = f(d);
        }
        iterations += 1;
    }
    0.5 * (a + b)
}

/// Collects per-subject sufficient statistics for `metric`, counting only
/// primary (non-derived) observations with an observed value.
fn collect_blocks(table: &MetricTable, metric: &str) -> BTreeMap<String, SubjectBlock> {
    let mut blocks: BTreeMap<String, SubjectBlock> = BTreeMap::new();
    for obs in table.observations() {
        let x = match obs.era {
            Era::Reference => 0.0,
            Era::Comparison => 1.0,
            Era::Derived => continue,
        };
        let y = match obs.value(metric) {
            Some(y) => y,
            None => continue,
        };
        let block = blocks.entry(obs.subject_id.clone()).or_default();
        block.n += 1.0;
        block.sx += x;
        block.sy += y;
        block.sxx += x * x;
        block.sxy += x * y;
        block.syy += y * y;
    }
    blocks
}

/// Fits the era contrast for one metric.
///
/// Input constraints (violations surface as
/// [`AnalysisError::InsufficientData`]): both era levels must be observed
/// for the metric, at least two subjects and three observations must
/// remain, and the missing fraction must not exceed the configured
/// ceiling. A subject observed in only one era still contributes to the
/// intercept variance through its single observation; that situation is
/// expected and handled by the blockwise estimator, not special-cased.
pub fn fit_era_contrast(
    table: &MetricTable,
    metric: &str,
    config: &AnalysisConfig,
) -> AnalysisResult<MetricFit> {
    let primary: Vec<_> = table
        .observations()
        .iter()
        .filter(|obs| obs.era != Era::Derived)
        .collect();
    let total = primary.len();
    let missing = primary
        .iter()
        .filter(|obs| obs.value(metric).is_none())
        .count();

    if total == 0 {
        return Err(AnalysisError::InsufficientData {
            unit: metric.to_string(),
            reason: "table has no primary observations".to_string(),
        });
    }
    let missing_fraction = missing as f64 / total as f64;
    if missing_fraction > config.max_missing_fraction {
        return Err(AnalysisError::InsufficientData {
            unit: metric.to_string(),
            reason: format!(
                "missing fraction {:.2} exceeds ceiling {:.2}",
                missing_fraction, config.max_missing_fraction
            ),
        });
    }

    let blocks_by_subject = collect_blocks(table, metric);
    let n_subjects = blocks_by_subject.len();
    let blocks: Vec<SubjectBlock> = blocks_by_subject.values().copied().collect();
    let n_obs: f64 = blocks.iter().map(|b| b.n).sum();
    let n_comparison: f64 = blocks.iter().map(|b| b.sx).sum();

    if n_comparison == 0.0 || n_comparison == n_obs {
        return Err(AnalysisError::InsufficientData {
            unit: metric.to_string(),
            reason: "only one era level observed for this metric".to_string(),
        });
    }
    if n_subjects < 2 {
        return Err(AnalysisError::InsufficientData {
            unit: metric.to_string(),
            reason: format!("needs at least 2 subjects, got {}", n_subjects),
        });
    }
    if n_obs < 3.0 {
        return Err(AnalysisError::InsufficientData {
            unit: metric.to_string(),
            reason: format!("needs at least 3 observations, got {}", n_obs),
        });
    }

    let reml = &config.reml;
    let criterion_at = |lambda: f64| -> f64 {
        evaluate_profile(&blocks, n_obs, lambda)
            .map(|p| p.criterion)
            .unwrap_or(f64::INFINITY)
    };

    // Grid scan over the variance ratio, including the boundary lambda = 0
    // (no between-subject variance).
    let grid_points = reml.grid_points.max(2);
    let mut candidates = Vec::with_capacity(grid_points + 1);
    candidates.push(0.0);
    let log_floor = reml.ratio_floor.ln();
    let log_ceiling = reml.ratio_ceiling.ln();
    for i in 0..grid_points {
        let t = i as f64 / (grid_points - 1) as f64;
        candidates.push((log_floor + t * (log_ceiling - log_floor)).exp());
    }

    let mut best_index = None;
    let mut best_value = f64::INFINITY;
    for (i, &lambda) in candidates.iter().enumerate() {
        let value = criterion_at(lambda);
        trace!("REML grid: lambda={:e} criterion={}", lambda, value);
        if value < best_value {
            best_value = value;
            best_index = Some(i);
        }
    }

    let best_index = best_index.filter(|_| best_value.is_finite()).ok_or_else(|| {
        AnalysisError::NonConvergence {
            metric: metric.to_string(),
            reason: "REML criterion was not finite at any candidate variance ratio".to_string(),
        }
    })?;

    // Refine inside the bracket around the best grid point. Below the
    // first nonzero grid point the search runs on the linear scale so the
    // lambda = 0 boundary stays reachable.
    let lambda_hat = if best_index <= 1 {
        let upper = candidates[2.min(candidates.len() - 1)];
        golden_section_min(
            &criterion_at,
            0.0,
            upper,
            reml.refine_tolerance * upper.max(1.0),
            reml.max_refine_iterations,
        )
    } else {
        let lower = candidates[best_index - 1];
        let upper = candidates[(best_index + 1).min(candidates.len() - 1)];
        if best_index == candidates.len() - 1 {
            warn!(
                "REML optimum for '{}' sits at the ratio ceiling {:e}; \
                 between-subject variance dominates.",
                metric, reml.ratio_ceiling
            );
        }
        let log_best = golden_section_min(
            |u: f64| criterion_at(u.exp()),
            lower.ln(),
            upper.max(lower * (1.0 + 1e-9)).ln(),
            reml.refine_tolerance,
            reml.max_refine_iterations,
        );
        log_best.exp()
    };

    let profile = evaluate_profile(&blocks, n_obs, lambda_hat).ok_or_else(|| {
        AnalysisError::NonConvergence {
            metric: metric.to_string(),
            reason: "weighted normal equations singular at the optimum".to_string(),
        }
    })?;

    let degrees_of_freedom = (n_obs - n_subjects as f64 - 1.0).max(1.0);
    let t_statistic = profile.beta1 / profile.se1;
    let dist = StudentsT::new(0.0, 1.0, degrees_of_freedom).map_err(|e| {
        AnalysisError::NonConvergence {
            metric: metric.to_string(),
            reason: format!("t-distribution with df {} rejected: {}", degrees_of_freedom, e),
        }
    })?;
    let p_value = (2.0 * (1.0 - dist.cdf(t_statistic.abs()))).clamp(0.0, 1.0);

    debug!(
        "Fit '{}': estimate={:.6} se={:.6} t={:.3} df={} p={:.4} lambda={:e}",
        metric, profile.beta1, profile.se1, t_statistic, degrees_of_freedom, p_value, lambda_hat
    );

    Ok(MetricFit {
        metric: metric.to_string(),
        estimate: profile.beta1,
        std_error: profile.se1,
        t_statistic,
        p_value,
        degrees_of_freedom,
        df_method: DfMethod::Containment,
        subject_variance: lambda_hat * profile.sigma_e2,
        residual_variance: profile.sigma_e2,
        n_observations: n_obs as usize,
        n_subjects,
        converged: true,
    })
}

/// Subjects contributing observed values for `metric` in exactly one of
/// the two eras. Reported as a diagnostic, never as an error: such
/// subjects still inform the intercept variance.
pub fn partially_observed_subjects(table: &MetricTable, metric: &str) -> Vec<String> {
    collect_blocks(table, metric)
        .into_iter()
        .filter(|(_, block)| block.sx == 0.0 || block.sx == block.n)
        .map(|(subject, _)| subject)
        .collect()
}
