/// Gradient-boosted decision trees for the home-win classifier.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub max_depth: usize,
    pub learning_rate: f64,
    pub n_estimators: usize,
    /// Fraction of rows drawn for each tree.
    pub subsample: f64,
    /// Fraction of features drawn for each tree.
    pub colsample_bytree: f64,
    /// L2 penalty on leaf weights.
    pub lambda: f64,
    /// Minimum hessian sum per child.
    pub min_child_weight: f64,
    pub max_bins: usize,
    pub seed: u64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            max_depth: 3,
            learning_rate: 0.1,
            n_estimators: 100,
            subsample: 1.0,
            colsample_bytree: 1.0,
            lambda: 1.0,
            min_child_weight: 1.0,
            max_bins: 64,
            seed: 42,
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf(value) => return *value,
                Node::Split { feature, threshold, left, right } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Histogram bins per feature. A value goes left of split `k` when it is `<= cuts[k]`,
/// which is the same as its bin index being `<= k`.
struct Binned {
    cuts: Vec<Vec<f64>>,
    bins: Vec<Vec<u16>>,
}

fn quantize(x: ArrayView2<f64>, max_bins: usize) -> Binned {
    let max_bins = max_bins.clamp(2, usize::from(u16::MAX));
    let mut cuts = Vec::with_capacity(x.ncols());
    let mut bins = Vec::with_capacity(x.ncols());
    for column in x.axis_iter(Axis(1)) {
        let mut sorted: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(f64::total_cmp);
        sorted.dedup();
        let mut feature_cuts: Vec<f64> = if sorted.len() <= max_bins {
            sorted.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
        } else {
            (1..max_bins).map(|i| sorted[i * sorted.len() / max_bins]).collect()
        };
        feature_cuts.dedup();
        bins.push(
            column
                .iter()
                .map(|&v| feature_cuts.partition_point(|&c| c < v) as u16)
                .collect(),
        );
        cuts.push(feature_cuts);
    }
    Binned { cuts, bins }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

/// Depth-wise growth of one regression tree on second-order gradients.
struct TreeGrower<'a> {
    binned: &'a Binned,
    grad: &'a [f64],
    hess: &'a [f64],
    features: &'a [usize],
    params: &'a BoostParams,
    nodes: Vec<Node>,
    gains: Vec<f64>,
}

impl TreeGrower<'_> {
    fn grow(&mut self, rows: &[usize], depth: usize) -> usize {
        let (g, h) = rows
            .iter()
            .fold((0.0, 0.0), |(g, h), &r| (g + self.grad[r], h + self.hess[r]));
        let id = self.nodes.len();
        let weight = -g / (h + self.params.lambda) * self.params.learning_rate;
        self.nodes.push(Node::Leaf(weight));

        if depth >= self.params.max_depth || rows.len() < 2 {
            return id;
        }
        let Some(split) = self.best_split(rows, g, h) else {
            return id;
        };

        let binned = self.binned;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&r| usize::from(binned.bins[split.feature][r]) <= split.bin);
        self.gains[split.feature] += split.gain;
        let left = self.grow(&left_rows, depth + 1);
        let right = self.grow(&right_rows, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: binned.cuts[split.feature][split.bin],
            left,
            right,
        };
        id
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let lambda = self.params.lambda;
        let min_child = self.params.min_child_weight;
        let parent = g * g / (h + lambda);
        let mut best: Option<SplitCandidate> = None;

        for &feature in self.features {
            let cuts = &self.binned.cuts[feature];
            if cuts.is_empty() {
                continue;
            }
            let mut hist = vec![(0.0, 0.0); cuts.len() + 1];
            for &r in rows {
                let bin = usize::from(self.binned.bins[feature][r]);
                hist[bin].0 += self.grad[r];
                hist[bin].1 += self.hess[r];
            }

            let (mut gl, mut hl) = (0.0, 0.0);
            for (bin, &(bg, bh)) in hist.iter().enumerate().take(cuts.len()) {
                gl += bg;
                hl += bh;
                let (gr, hr) = (g - gl, h - hl);
                if hl < min_child || hr < min_child {
                    continue;
                }
                let gain = 0.5 * (gl * gl / (hl + lambda) + gr * gr / (hr + lambda) - parent);
                if gain > 1e-12 && best.map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate { feature, bin, gain });
                }
            }
        }
        best
    }
}

/// Binary classifier over named numeric features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedClassifier {
    pub params: BoostParams,
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
    base_score: f64,
    trees: Vec<Tree>,
    importance: Vec<f64>,
}

impl GradientBoostedClassifier {
    /// input: feature matrix (rows = games), 0/1 labels, column names, boosting parameters
    /// output: fitted classifier
    /// logic: start every row at the log-odds of the positive rate; for each round compute
    /// log-loss gradients, sample rows and columns, grow one tree on the binned features and
    /// add its shrunken leaf weights to the running scores
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        feature_names: Vec<String>,
        params: BoostParams,
    ) -> Result<Self> {
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 {
            return Err(PipelineError::Model("cannot fit on an empty dataset".to_string()));
        }
        if y.len() != n_rows {
            return Err(PipelineError::Model(format!(
                "{} labels for {n_rows} rows",
                y.len()
            )));
        }
        if feature_names.len() != n_features {
            return Err(PipelineError::Model(format!(
                "{} feature names for {n_features} columns",
                feature_names.len()
            )));
        }
        if y.iter().any(|&t| t != 0.0 && t != 1.0) {
            return Err(PipelineError::Model("labels must be 0 or 1".to_string()));
        }

        let p = (y.sum() / n_rows as f64).clamp(1e-6, 1.0 - 1e-6);
        let base_score = (p / (1.0 - p)).ln();
        let binned = quantize(x, params.max_bins);
        let mut rng = StdRng::seed_from_u64(params.seed);
        let n_sampled = ((params.colsample_bytree * n_features as f64).ceil() as usize)
            .clamp(n_features.min(1), n_features);

        let mut raw = vec![base_score; n_rows];
        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut importance = vec![0.0; n_features];

        for _ in 0..params.n_estimators {
            let (grad, hess): (Vec<f64>, Vec<f64>) = raw
                .iter()
                .zip(y.iter())
                .map(|(&score, &target)| {
                    let p = sigmoid(score);
                    (p - target, (p * (1.0 - p)).max(1e-16))
                })
                .unzip();

            let mut rows: Vec<usize> = if params.subsample < 1.0 {
                (0..n_rows).filter(|_| rng.random::<f64>() < params.subsample).collect()
            } else {
                (0..n_rows).collect()
            };
            if rows.is_empty() {
                rows = (0..n_rows).collect();
            }
            let mut features: Vec<usize> = if n_sampled < n_features {
                sample(&mut rng, n_features, n_sampled).into_vec()
            } else {
                (0..n_features).collect()
            };
            features.sort_unstable();

            let mut grower = TreeGrower {
                binned: &binned,
                grad: &grad,
                hess: &hess,
                features: &features,
                params: &params,
                nodes: Vec::new(),
                gains: vec![0.0; n_features],
            };
            grower.grow(&rows, 0);
            let TreeGrower { nodes, gains, .. } = grower;

            let tree = Tree { nodes };
            for (score, row) in raw.iter_mut().zip(x.outer_iter()) {
                *score += tree.predict(row);
            }
            for (total, gain) in importance.iter_mut().zip(gains) {
                *total += gain;
            }
            trees.push(tree);
        }

        Ok(Self {
            params,
            feature_names,
            trained_at: Utc::now(),
            base_score,
            trees,
            importance,
        })
    }

    fn raw_score(&self, row: ArrayView1<f64>) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    /// Probability of label 1 for each row.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.feature_names.len() {
            return Err(PipelineError::Model(format!(
                "model expects {} features, got {}",
                self.feature_names.len(),
                x.ncols()
            )));
        }
        Ok(x.outer_iter().map(|row| sigmoid(self.raw_score(row))).collect())
    }

    /// Total split gain per feature, largest first.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.importance.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fixtures::temp_dir;
    use ndarray::{array, Array2};

    /// Two features: the first decides the label, the second is noise.
    fn separable(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                i as f64 - n as f64 / 2.0
            } else {
                ((i * 7919) % 13) as f64
            }
        });
        let y = x.column(0).mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        (x, y)
    }

    fn names() -> Vec<String> {
        vec!["epa_L3_diff".to_string(), "noise".to_string()]
    }

    #[test]
    fn test_fit_separates_classes() -> Result<()> {
        let (x, y) = separable(40);
        let params = BoostParams { n_estimators: 50, ..BoostParams::default() };
        let model = GradientBoostedClassifier::fit(x.view(), y.view(), names(), params)?;
        let proba = model.predict_proba(x.view())?;
        let correct = proba
            .iter()
            .zip(y.iter())
            .filter(|&(&p, &t)| (p > 0.5) == (t == 1.0))
            .count();
        assert_eq!(correct, 40);
        assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(model.feature_importance()[0].0, "epa_L3_diff");
        Ok(())
    }

    #[test]
    fn test_tiny_dataset_predicts_base_rate() -> Result<()> {
        let x = array![[1.0], [2.0], [3.0]];
        let y = array![1.0, 0.0, 0.0];
        let model = GradientBoostedClassifier::fit(
            x.view(),
            y.view(),
            vec!["epa_STD_diff".to_string()],
            BoostParams::default(),
        )?;
        // hessians are too small for any split, so every tree is a single leaf
        let proba = model.predict_proba(x.view())?;
        assert!(proba.iter().all(|&p| (p - proba[0]).abs() < 1e-12));
        assert!(proba[0] > 0.0 && proba[0] < 0.5);
        Ok(())
    }

    #[test]
    fn test_subsampling_is_reproducible_for_a_seed() -> Result<()> {
        let (x, y) = separable(30);
        let params = BoostParams {
            subsample: 0.8,
            colsample_bytree: 0.5,
            n_estimators: 20,
            ..BoostParams::default()
        };
        let a = GradientBoostedClassifier::fit(x.view(), y.view(), names(), params)?;
        let b = GradientBoostedClassifier::fit(x.view(), y.view(), names(), params)?;
        assert_eq!(a.predict_proba(x.view())?, b.predict_proba(x.view())?);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let x = array![[1.0, 2.0]];
        let y = array![1.0];
        let wrong_names = GradientBoostedClassifier::fit(
            x.view(),
            y.view(),
            vec!["only_one".to_string()],
            BoostParams::default(),
        );
        assert!(matches!(wrong_names, Err(PipelineError::Model(_))));

        let bad_label = GradientBoostedClassifier::fit(x.view(), array![0.5].view(), names(), BoostParams::default());
        assert!(matches!(bad_label, Err(PipelineError::Model(_))));
    }

    #[test]
    fn test_save_load_keeps_predictions() -> Result<()> {
        let dir = temp_dir("model_save");
        let (x, y) = separable(20);
        let model = GradientBoostedClassifier::fit(x.view(), y.view(), names(), BoostParams::default())?;
        let path = dir.join("models").join("model.json");
        model.save(&path)?;
        let loaded = GradientBoostedClassifier::load(&path)?;
        assert_eq!(loaded.feature_names, model.feature_names);
        assert_eq!(loaded.n_trees(), model.n_trees());
        let wrong_width = loaded.predict_proba(array![[1.0]].view());
        assert!(matches!(wrong_width, Err(PipelineError::Model(_))));
        let before = model.predict_proba(x.view())?;
        let after = loaded.predict_proba(x.view())?;
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        Ok(())
    }
}
