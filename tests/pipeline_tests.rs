// End-to-end pipeline tests: raw records in, serializable report out.

use approx::assert_relative_eq;
use era_metrics::{
    AnalysisConfig, Analyzer, MetricOutcome, RawRecord,
};

fn record(
    subject: &str,
    era: &str,
    category: Option<&str>,
    values: &[(&str, Option<f64>)],
) -> RawRecord {
    RawRecord {
        subject_id: subject.to_string(),
        era: era.to_string(),
        category: category.map(str::to_string),
        metrics: values
            .iter()
            .map(|(name, v)| (name.to_string(), *v))
            .collect(),
    }
}

fn tackle_records() -> Vec<RawRecord> {
    // Four count-type metrics per observation, in the shape the ingestion
    // collaborator hands over.
    let rows: &[(&str, &str, [f64; 4])] = &[
        ("A", "Before", [10.0, 7.0, 3.0, 1.0]),
        ("A", "After", [12.0, 8.0, 4.0, 2.0]),
        ("B", "Before", [8.0, 5.0, 3.0, 0.0]),
        ("B", "After", [9.0, 6.0, 3.0, 1.0]),
        ("C", "Before", [11.0, 8.0, 3.0, 2.0]),
        ("C", "After", [10.0, 7.0, 3.5, 1.0]),
        ("D", "Before", [9.5, 6.0, 3.5, 1.5]),
        ("D", "After", [11.0, 7.5, 3.0, 2.5]),
        ("E", "Before", [7.0, 4.0, 3.0, 0.5]),
        ("E", "After", [8.5, 5.5, 2.5, 1.5]),
    ];
    rows.iter()
        .map(|(subject, era, [comb, solo, ast, pd])| {
            record(
                subject,
                era,
                Some("LB"),
                &[
                    ("Comb", Some(*comb)),
                    ("Solo", Some(*solo)),
                    ("Ast", Some(*ast)),
                    ("PD", Some(*pd)),
                ],
            )
        })
        .collect()
}

fn metric_config() -> AnalysisConfig {
    AnalysisConfig::with_metrics(vec![
        "Comb".to_string(),
        "Solo".to_string(),
        "Ast".to_string(),
        "PD".to_string(),
    ])
}

#[test]
fn three_subject_comb_scenario_matches_the_paired_difference() {
    let records = vec![
        record("A", "Before", None, &[("Comb", Some(10.0))]),
        record("A", "After", None, &[("Comb", Some(12.0))]),
        record("B", "Before", None, &[("Comb", Some(8.0))]),
        record("B", "After", None, &[("Comb", Some(9.0))]),
        record("C", "Before", None, &[("Comb", Some(11.0))]),
        record("C", "After", None, &[("Comb", Some(10.0))]),
    ];
    let analyzer = Analyzer::new(AnalysisConfig::with_metrics(vec!["Comb".to_string()]));
    let report = analyzer.run(records).unwrap();

    let fit = report.comparison.fits().next().expect("Comb should fit");
    assert!(fit.estimate > 0.0);
    assert_relative_eq!(fit.estimate, 2.0 / 3.0, epsilon = 1e-6);
    assert!(fit.converged);
}

#[test]
fn full_report_covers_all_configured_metrics_in_order() {
    let analyzer = Analyzer::new(metric_config());
    let report = analyzer.run(tackle_records()).unwrap();

    let names: Vec<&str> = report
        .comparison
        .metrics
        .iter()
        .map(|row| row.metric.as_str())
        .collect();
    assert_eq!(names, vec!["Comb", "Solo", "Ast", "PD"]);
    for row in &report.comparison.metrics {
        assert!(
            matches!(row.outcome, MetricOutcome::Fit(_)),
            "metric {} unexpectedly failed",
            row.metric
        );
    }

    let reduction = report.reduction.expect("reduction should run");
    assert_eq!(reduction.coordinates.nrows(), 10);
    assert_eq!(reduction.loadings.nrows(), 4);
    // Components are capped at min(rows, columns) - 1 = 3.
    assert_eq!(reduction.explained_variance.len(), 3);
    for pair in reduction.explained_variance.windows(2) {
        assert!(pair[0] >= pair[1], "explained variance must be descending");
    }
}

#[test]
fn input_row_order_does_not_change_any_result() {
    let analyzer = Analyzer::new(metric_config());
    let forward = analyzer.run(tackle_records()).unwrap();

    let mut reversed_records = tackle_records();
    reversed_records.reverse();
    let reversed = analyzer.run(reversed_records).unwrap();

    for (a, b) in forward.comparison.fits().zip(reversed.comparison.fits()) {
        assert_eq!(a.metric, b.metric);
        assert_relative_eq!(a.estimate, b.estimate, epsilon = 1e-9);
        assert_relative_eq!(a.std_error, b.std_error, epsilon = 1e-9);
        assert_relative_eq!(a.p_value, b.p_value, epsilon = 1e-9);
    }

    let fwd = forward.reduction.unwrap();
    let rev = reversed.reduction.unwrap();
    for (a, b) in fwd
        .explained_variance
        .iter()
        .zip(rev.explained_variance.iter())
    {
        assert_relative_eq!(*a, *b, epsilon = 1e-9);
    }
}

#[test]
fn missing_cells_are_imputed_and_counted() {
    let mut records = tackle_records();
    records[0].metrics.insert("Solo".to_string(), None);
    records[3].metrics.insert("PD".to_string(), None);

    let analyzer = Analyzer::new(metric_config());
    let report = analyzer.run(records).unwrap();

    assert_eq!(report.diagnostics.imputed_cells, 2);
    assert_eq!(report.diagnostics.imputed_per_column.get("Solo"), Some(&1));
    assert_eq!(report.diagnostics.imputed_per_column.get("PD"), Some(&1));
    assert!(report.reduction.is_some());
}

#[test]
fn constant_metric_is_reported_degenerate_and_reduction_continues() {
    let mut records = tackle_records();
    for r in records.iter_mut() {
        r.metrics.insert("Fixed".to_string(), Some(4.0));
    }
    let analyzer = Analyzer::new(metric_config());
    let report = analyzer.run(records).unwrap();

    assert_eq!(
        report.diagnostics.degenerate_columns,
        vec!["Fixed".to_string()]
    );
    let reduction = report.reduction.expect("other columns still reduce");
    assert!(!reduction.columns.contains(&"Fixed".to_string()));
}

#[test]
fn subject_without_an_after_observation_is_a_diagnostic_not_an_error() {
    let mut records = tackle_records();
    // Drop E's After row entirely.
    records.retain(|r| !(r.subject_id == "E" && r.era == "After"));

    let analyzer = Analyzer::new(metric_config());
    let report = analyzer.run(records).unwrap();

    for row in &report.comparison.metrics {
        assert!(matches!(row.outcome, MetricOutcome::Fit(_)));
    }
    let partial = report
        .diagnostics
        .partially_observed_subjects
        .get("Comb")
        .expect("E should be flagged");
    assert_eq!(partial, &vec!["E".to_string()]);
}

#[test]
fn all_missing_metric_is_explained_never_silently_dropped() {
    let mut records = tackle_records();
    for r in records.iter_mut() {
        r.metrics.insert("Hollow".to_string(), None);
    }
    let mut config = metric_config();
    config.metrics.push("Hollow".to_string());
    let analyzer = Analyzer::new(config);
    let report = analyzer.run(records).unwrap();

    // The comparison row is present and carries the failure.
    let hollow = report
        .comparison
        .metrics
        .iter()
        .find(|row| row.metric == "Hollow")
        .unwrap();
    assert!(matches!(hollow.outcome, MetricOutcome::Failed { .. }));
    // The reduction dropped the empty column and said so.
    assert_eq!(report.diagnostics.empty_columns, vec!["Hollow".to_string()]);
}

#[test]
fn report_serializes_with_estimates_and_diagnostics() {
    let analyzer = Analyzer::new(metric_config());
    let report = analyzer.run(tackle_records()).unwrap();
    let json = serde_json::to_value(&report).unwrap();

    let metrics = json["comparison"]["metrics"].as_array().unwrap();
    assert_eq!(metrics.len(), 4);
    assert_eq!(metrics[0]["metric"], "Comb");
    assert_eq!(metrics[0]["outcome"]["status"], "fit");
    assert!(metrics[0]["outcome"]["p_value"].as_f64().unwrap() <= 1.0);
    assert!(json["diagnostics"]["derived_rows_excluded"].as_u64().is_some());
    assert!(json["reduction"]["explained_variance"].as_array().is_some());
}

#[test]
fn two_cohorts_combine_for_reduction_without_mixing_their_identity() {
    let early: Vec<RawRecord> = tackle_records()
        .into_iter()
        .filter(|r| r.era == "Before")
        .collect();
    let late: Vec<RawRecord> = tackle_records()
        .into_iter()
        .filter(|r| r.era == "After")
        .collect();

    let analyzer = Analyzer::new(metric_config());
    let (reduction, _) = analyzer
        .reduce_cohorts(vec![
            ("1990s".to_string(), early),
            ("2020s".to_string(), late),
        ])
        .unwrap();
    let reduction = reduction.expect("combined reduction should run");

    let early_rows = reduction
        .rows
        .iter()
        .filter(|r| r.cohort.as_deref() == Some("1990s"))
        .count();
    assert_eq!(early_rows, 5);
    assert_eq!(reduction.rows.len(), 10);
}
