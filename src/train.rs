// Trains the classifier on the frozen dataset: held-out split, grid search over boosting
// parameters scored by k-fold log-loss, test metrics, and the feature-importance chart.
use std::path::Path;

use linfa::DatasetBase;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use plotters::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{Config, TrainConfig};
use crate::error::{PipelineError, Result};
use crate::io::{self, FeatureTable};
use crate::model::{BoostParams, GradientBoostedClassifier};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub accuracy: f64,
    pub log_loss: f64,
    /// `None` when the evaluated labels hold a single class.
    pub auc: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub best_params: BoostParams,
    pub cv_log_loss: f64,
    pub train_rows: usize,
    /// `None` when the held-out split came out empty.
    pub test: Option<Metrics>,
    pub model: GradientBoostedClassifier,
}

/// Feature matrix (nulls as 0.0) and label vector of a frozen dataset.
pub fn design_matrix(table: &FeatureTable) -> (Array2<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((table.rows.len(), table.columns.len()), |(i, j)| {
        table.rows[i].values.get(j).copied().flatten().unwrap_or(0.0)
    });
    let y = table.rows.iter().map(|r| f64::from(r.result)).collect();
    (x, y)
}

/// Every combination of the configured grid, in config order with the last axis varying fastest.
pub fn param_grid(cfg: &TrainConfig) -> Vec<BoostParams> {
    let mut grid = Vec::new();
    for &max_depth in &cfg.max_depth {
        for &learning_rate in &cfg.learning_rate {
            for &n_estimators in &cfg.n_estimators {
                for &subsample in &cfg.subsample {
                    for &colsample_bytree in &cfg.colsample_bytree {
                        grid.push(BoostParams {
                            max_depth,
                            learning_rate,
                            n_estimators,
                            subsample,
                            colsample_bytree,
                            seed: cfg.seed,
                            ..BoostParams::default()
                        });
                    }
                }
            }
        }
    }
    grid
}

pub fn log_loss(y: ArrayView1<f64>, proba: ArrayView1<f64>) -> f64 {
    let total: f64 = y
        .iter()
        .zip(proba.iter())
        .map(|(&t, &p)| {
            let p = p.clamp(1e-15, 1.0 - 1e-15);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum();
    total / y.len() as f64
}

pub fn accuracy(y: ArrayView1<f64>, proba: ArrayView1<f64>) -> f64 {
    let correct = y
        .iter()
        .zip(proba.iter())
        .filter(|&(&t, &p)| (p > 0.5) == (t == 1.0))
        .count();
    correct as f64 / y.len() as f64
}

/// Area under the ROC curve via the rank-sum statistic, averaging ranks over tied scores.
pub fn roc_auc(y: ArrayView1<f64>, proba: ArrayView1<f64>) -> Option<f64> {
    let positives = y.iter().filter(|&&t| t == 1.0).count();
    let negatives = y.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..y.len()).collect();
    order.sort_by(|&a, &b| proba[a].total_cmp(&proba[b]));
    let mut ranks = vec![0.0; y.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && proba[order[end]] == proba[order[start]] {
            end += 1;
        }
        // ranks are 1-based; tied block shares the mean rank
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }

    let positive_rank_sum: f64 = (0..y.len()).filter(|&i| y[i] == 1.0).map(|i| ranks[i]).sum();
    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

pub fn evaluate(y: ArrayView1<f64>, proba: ArrayView1<f64>) -> Metrics {
    Metrics {
        accuracy: accuracy(y, proba),
        log_loss: log_loss(y, proba),
        auc: roc_auc(y, proba),
    }
}

/// Contiguous (train, validation) index splits, the first `n % k` folds one row larger.
fn fold_indices(n: usize, k: usize) -> Vec<(Vec<usize>, Vec<usize>)> {
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = n / k + usize::from(fold < n % k);
        let valid: Vec<usize> = (start..start + size).collect();
        let train: Vec<usize> = (0..start).chain(start + size..n).collect();
        folds.push((train, valid));
        start += size;
    }
    folds
}

pub fn cross_val_log_loss(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
    params: BoostParams,
    k: usize,
) -> Result<f64> {
    let mut total = 0.0;
    for (train, valid) in fold_indices(x.nrows(), k) {
        let model = GradientBoostedClassifier::fit(
            x.select(Axis(0), &train).view(),
            y.select(Axis(0), &train).view(),
            feature_names.to_vec(),
            params,
        )?;
        let proba = model.predict_proba(x.select(Axis(0), &valid).view())?;
        total += log_loss(y.select(Axis(0), &valid).view(), proba.view());
    }
    Ok(total / k as f64)
}

/// input: frozen dataset, training settings
/// output: best grid parameters, their CV log-loss, held-out metrics and the refitted model
/// logic: shuffle with the configured seed, hold out `test_ratio`, score every grid point by
/// k-fold log-loss on the training part (ties keep the earlier point), refit the winner on
/// the whole training part and evaluate on the held-out rows
pub fn train_and_evaluate(table: &FeatureTable, cfg: &TrainConfig) -> Result<TrainReport> {
    let folds = cfg.cv_folds;
    if folds < 2 {
        return Err(PipelineError::Validation("cv_folds must be at least 2".to_string()));
    }
    let grid = param_grid(cfg);
    if grid.is_empty() {
        return Err(PipelineError::Validation("training grid is empty".to_string()));
    }
    let positives = table.rows.iter().filter(|r| r.result == 1).count();
    if positives == 0 || positives == table.rows.len() {
        return Err(PipelineError::Validation(
            "dataset needs both home wins and home losses to train".to_string(),
        ));
    }

    let (x, y) = design_matrix(table);
    let mut order: Vec<usize> = (0..table.rows.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(cfg.seed));
    let dataset = DatasetBase::new(x.select(Axis(0), &order), y.select(Axis(0), &order));
    let (train, test) = dataset.split_with_ratio(1.0 - cfg.test_ratio);
    let (train_x, train_y) = (train.records(), train.targets());
    if train_x.nrows() < folds {
        return Err(PipelineError::Validation(format!(
            "{} training rows is fewer than {folds} folds",
            train_x.nrows()
        )));
    }

    println!(
        "Grid search: {} candidates x {folds} folds on {} rows...",
        grid.len(),
        train_x.nrows()
    );
    let mut best: Option<(BoostParams, f64)> = None;
    for params in grid {
        let loss = cross_val_log_loss(train_x.view(), train_y.view(), &table.columns, params, folds)?;
        if best.map_or(true, |(_, best_loss)| loss < best_loss) {
            best = Some((params, loss));
        }
    }
    let Some((best_params, cv_log_loss)) = best else {
        return Err(PipelineError::Validation("training grid is empty".to_string()));
    };

    let model = GradientBoostedClassifier::fit(
        train_x.view(),
        train_y.view(),
        table.columns.clone(),
        best_params,
    )?;
    let test_metrics = if test.records().nrows() > 0 {
        let proba = model.predict_proba(test.records().view())?;
        Some(evaluate(test.targets().view(), proba.view()))
    } else {
        None
    };

    Ok(TrainReport {
        best_params,
        cv_log_loss,
        train_rows: train_x.nrows(),
        test: test_metrics,
        model,
    })
}

/// Draws a horizontal bar chart of feature importances and saves it to `path`
/// input: feature names with their total split gain
/// output: none (writes the PNG)
/// logic: one bar per feature from 0 to its gain, feature names as Y tick labels
fn plot_importances(results: &[(String, f64)], path: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
    let gains: Vec<f64> = results.iter().map(|(_, g)| *g).collect();
    let count = results.len();

    let max_x = gains.iter().cloned().fold(0.0_f64, f64::max);
    let x_max = if max_x > 0.0 { max_x * 1.1 } else { 1.0 };
    let x_range = 0.0..x_max;

    let root = BitMapBackend::new(path, (1000, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Feature Importance (total gain)", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(260)
        .build_cartesian_2d(x_range, 0..count)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .y_labels(count)
        .y_label_formatter(&|idx| {
            let i = *idx;
            if i < count {
                names[i].to_string()
            } else {
                String::new()
            }
        })
        .x_desc("Gain")
        .y_desc("Feature")
        .draw()?;

    chart.draw_series(
        gains
            .iter()
            .enumerate()
            .map(|(i, &gain)| Rectangle::new([(0.0, i), (gain, i + 1)], BLUE.mix(0.5).filled())),
    )?;
    root.present()?;

    Ok(())
}

pub fn run(config: &Config) -> Result<TrainReport> {
    let path = config.dataset_path("parquet");
    println!("Loading dataset from {}...", path.display());
    let table = io::load_feature_table(&path)?;
    println!("Loaded {} games with {} features", table.rows.len(), table.columns.len());

    let report = train_and_evaluate(&table, &config.train)?;
    let p = &report.best_params;
    println!(
        "Best params: max_depth={} learning_rate={} n_estimators={} subsample={} colsample_bytree={} (CV log-loss {:.4})",
        p.max_depth, p.learning_rate, p.n_estimators, p.subsample, p.colsample_bytree, report.cv_log_loss
    );
    match &report.test {
        Some(m) => {
            println!("Accuracy: {:.4}", m.accuracy);
            println!("LogLoss: {:.4}", m.log_loss);
            match m.auc {
                Some(auc) => println!("AUC: {auc:.4}"),
                None => println!("AUC: n/a (single class in test split)"),
            }
        }
        None => println!("No held-out rows; skipped test metrics"),
    }

    let model_path = config.model_path();
    report.model.save(&model_path)?;
    println!("Model saved to {}", model_path.display());

    let top: Vec<(String, f64)> = report
        .model
        .feature_importance()
        .into_iter()
        .take(config.train.plot_top)
        .collect();
    if top.is_empty() {
        println!("No features to plot");
    } else {
        let plot_path = config.importance_plot_path();
        std::fs::create_dir_all(&config.artifacts_dir)?;
        plot_importances(&top, &plot_path).map_err(|e| PipelineError::Plot(e.to_string()))?;
        println!("Wrote {}", plot_path.display());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FeatureRow, Matchup};
    use ndarray::array;

    fn dataset(n: usize) -> FeatureTable {
        FeatureTable {
            columns: vec!["epa_L3_diff".to_string(), "sack_STD_diff".to_string()],
            rows: (0..n)
                .map(|i| {
                    let edge = i as f64 - n as f64 / 2.0 + 0.5;
                    FeatureRow {
                        matchup: Matchup {
                            game_id: format!("g{i}"),
                            season: 2023,
                            week: (i % 18) as i32 + 1,
                            home_team: "AAA".to_string(),
                            away_team: "BBB".to_string(),
                        },
                        result: i32::from(edge > 0.0),
                        values: vec![Some(edge), if i % 3 == 0 { None } else { Some(0.1) }],
                    }
                })
                .collect(),
        }
    }

    fn small_grid() -> TrainConfig {
        TrainConfig {
            max_depth: vec![1, 2],
            learning_rate: vec![0.3],
            n_estimators: vec![20],
            subsample: vec![1.0],
            colsample_bytree: vec![1.0],
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_metrics_on_known_scores() {
        let y = array![0.0, 0.0, 1.0, 1.0];
        let p = array![0.1, 0.4, 0.35, 0.8];
        let m = evaluate(y.view(), p.view());
        assert!((m.accuracy - 0.75).abs() < 1e-12);
        assert!((m.auc.unwrap() - 0.75).abs() < 1e-12);
        let expected = -((0.9f64).ln() + (0.6f64).ln() + (0.35f64).ln() + (0.8f64).ln()) / 4.0;
        assert!((m.log_loss - expected).abs() < 1e-12);
    }

    #[test]
    fn test_auc_ties_and_single_class() {
        let y = array![0.0, 1.0];
        let p = array![0.5, 0.5];
        assert_eq!(roc_auc(y.view(), p.view()), Some(0.5));
        assert_eq!(roc_auc(array![1.0, 1.0].view(), p.view()), None);
    }

    #[test]
    fn test_fold_indices_cover_every_row_once() {
        let folds = fold_indices(10, 3);
        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0].1, vec![0, 1, 2, 3]);
        assert_eq!(folds[2].1, vec![7, 8, 9]);
        let mut seen: Vec<usize> = folds.iter().flat_map(|(_, v)| v.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        for (train, valid) in &folds {
            assert_eq!(train.len() + valid.len(), 10);
        }
    }

    #[test]
    fn test_design_matrix_fills_nulls_with_zero() {
        let (x, y) = design_matrix(&dataset(4));
        assert_eq!(x.dim(), (4, 2));
        assert_eq!(x[[0, 1]], 0.0);
        assert_eq!(x[[1, 1]], 0.1);
        assert_eq!(y, array![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_param_grid_is_cartesian() {
        let grid = param_grid(&TrainConfig::default());
        assert_eq!(grid.len(), 3 * 3 * 2 * 2 * 2);
        assert_eq!(grid[0].max_depth, 3);
        assert_eq!(grid[1].colsample_bytree, 1.0);
        assert!(grid.iter().all(|p| p.seed == 42));
    }

    #[test]
    fn test_train_and_evaluate_learns_separable_data() -> Result<()> {
        let report = train_and_evaluate(&dataset(60), &small_grid())?;
        assert!((47..=49).contains(&report.train_rows));
        let test = report.test.expect("held-out rows");
        assert!(test.accuracy >= 0.75, "accuracy {}", test.accuracy);
        assert!(report.cv_log_loss < 0.69);
        assert_eq!(report.model.feature_names, vec!["epa_L3_diff", "sack_STD_diff"]);
        Ok(())
    }

    #[test]
    fn test_single_class_dataset_is_rejected() {
        let mut table = dataset(10);
        for row in table.rows.iter_mut() {
            row.result = 0;
        }
        assert!(matches!(
            train_and_evaluate(&table, &small_grid()),
            Err(PipelineError::Validation(_))
        ));
    }
}
