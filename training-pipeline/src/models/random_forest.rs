use common::{
    error::AppError,
    jobs::model_config::{RandomForestParams, TaskKind},
};
use ndarray::{Array1, Array2, ArrayView1};
use rand::{seq::index::sample, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
    /// Class distribution for classification, single mean for regression.
    Leaf { value: Vec<f64> },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

/// Best split found for one node.
struct Candidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Parameters shared by every tree of the forest.
#[derive(Debug, Clone, Copy)]
struct TreeSettings {
    max_depth: Option<usize>,
    min_samples_split: usize,
    min_samples_leaf: usize,
    max_features: usize,
    n_classes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionTree {
    root: TreeNode,
}

impl DecisionTree {
    fn fit(
        x: &Array2<f64>,
        y: &Array1<f64>,
        indices: Vec<usize>,
        settings: TreeSettings,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let root = build_node(x, y, indices, 0, settings, rng);
        Self { root }
    }

    fn leaf_for(&self, sample: ArrayView1<'_, f64>) -> &[f64] {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf { value } => return value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = sample.get(*feature).copied().unwrap_or(0.0);
                    node = if v <= *threshold { left } else { right };
                }
            }
        }
    }
}

fn leaf_value(y: &Array1<f64>, indices: &[usize], n_classes: usize) -> Vec<f64> {
    if n_classes == 0 {
        let mean = if indices.is_empty() {
            0.0
        } else {
            indices.iter().map(|&i| y[i]).sum::<f64>() / indices.len() as f64
        };
        return vec![mean];
    }

    let mut counts = vec![0.0; n_classes];
    for &i in indices {
        if let Some(slot) = counts.get_mut(y[i].round() as usize) {
            *slot += 1.0;
        }
    }
    let total = indices.len().max(1) as f64;
    counts.iter_mut().for_each(|c| *c /= total);
    counts
}

fn is_pure(y: &Array1<f64>, indices: &[usize]) -> bool {
    let Some(&first) = indices.first() else {
        return true;
    };
    indices.iter().all(|&i| (y[i] - y[first]).abs() < f64::EPSILON)
}

fn build_node(
    x: &Array2<f64>,
    y: &Array1<f64>,
    indices: Vec<usize>,
    depth: usize,
    settings: TreeSettings,
    rng: &mut ChaCha8Rng,
) -> TreeNode {
    let stop = indices.len() < settings.min_samples_split
        || indices.len() < 2 * settings.min_samples_leaf
        || settings.max_depth.is_some_and(|d| depth >= d)
        || is_pure(y, &indices);

    if stop {
        return TreeNode::Leaf {
            value: leaf_value(y, &indices, settings.n_classes),
        };
    }

    let Some(candidate) = best_split(x, y, &indices, settings, rng) else {
        return TreeNode::Leaf {
            value: leaf_value(y, &indices, settings.n_classes),
        };
    };

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .partition(|&&i| x[[i, candidate.feature]] <= candidate.threshold);

    TreeNode::Split {
        feature: candidate.feature,
        threshold: candidate.threshold,
        left: Box::new(build_node(x, y, left_idx, depth + 1, settings, rng)),
        right: Box::new(build_node(x, y, right_idx, depth + 1, settings, rng)),
    }
}

/// Running impurity statistics for one side of a split.
#[derive(Clone)]
struct SideStats {
    count: usize,
    sum: f64,
    sq_sum: f64,
    class_counts: Vec<usize>,
}

impl SideStats {
    fn new(n_classes: usize) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sq_sum: 0.0,
            class_counts: vec![0; n_classes],
        }
    }

    fn add(&mut self, value: f64) {
        self.update(value, true);
    }

    fn remove(&mut self, value: f64) {
        self.update(value, false);
    }

    fn update(&mut self, value: f64, add: bool) {
        let class = value.round() as usize;
        if add {
            self.count += 1;
            self.sum += value;
            self.sq_sum += value * value;
            if let Some(c) = self.class_counts.get_mut(class) {
                *c += 1;
            }
        } else {
            self.count -= 1;
            self.sum -= value;
            self.sq_sum -= value * value;
            if let Some(c) = self.class_counts.get_mut(class) {
                *c -= 1;
            }
        }
    }

    /// Gini impurity for classification, variance for regression.
    fn impurity(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        if self.class_counts.is_empty() {
            let mean = self.sum / n;
            (self.sq_sum / n - mean * mean).max(0.0)
        } else {
            1.0 - self
                .class_counts
                .iter()
                .map(|&c| (c as f64 / n).powi(2))
                .sum::<f64>()
        }
    }
}

fn best_split(
    x: &Array2<f64>,
    y: &Array1<f64>,
    indices: &[usize],
    settings: TreeSettings,
    rng: &mut ChaCha8Rng,
) -> Option<Candidate> {
    let n_features = x.ncols();
    let n_try = settings.max_features.clamp(1, n_features);
    let features = sample(rng, n_features, n_try).into_vec();

    let mut parent = SideStats::new(settings.n_classes);
    for &i in indices {
        parent.add(y[i]);
    }
    let parent_impurity = parent.impurity();
    let n = indices.len() as f64;

    let mut best: Option<Candidate> = None;
    for feature in features {
        let mut order = indices.to_vec();
        order.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));

        let mut left = SideStats::new(settings.n_classes);
        let mut right = parent.clone();

        for pos in 0..order.len() - 1 {
            let current = order[pos];
            left.add(y[current]);
            right.remove(y[current]);

            let here = x[[current, feature]];
            let next = x[[order[pos + 1], feature]];
            if next <= here {
                continue;
            }
            if left.count < settings.min_samples_leaf || right.count < settings.min_samples_leaf {
                continue;
            }

            let weighted = (left.count as f64 * left.impurity()
                + right.count as f64 * right.impurity())
                / n;
            let gain = parent_impurity - weighted;
            if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(Candidate {
                    feature,
                    threshold: (here + next) / 2.0,
                    gain,
                });
            }
        }
    }

    best
}

/// Bagged ensemble of CART trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub params: RandomForestParams,
    pub task: TaskKind,
    n_classes: usize,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn new(params: RandomForestParams, task: TaskKind, n_classes: usize) -> Self {
        Self {
            params,
            task,
            n_classes,
            n_features: 0,
            trees: Vec::new(),
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<(), AppError> {
        let n_samples = x.nrows();
        if n_samples == 0 || n_samples != y.len() {
            return Err(AppError::Processing(format!(
                "random forest needs matching, non-empty inputs (got {n_samples} rows and {} targets)",
                y.len()
            )));
        }
        if self.params.n_estimators == 0 {
            return Err(AppError::Validation(
                "n_estimators must be at least 1".to_string(),
            ));
        }

        let n_features = x.ncols();
        let max_features = match self.task {
            TaskKind::Classification => (n_features as f64).sqrt().floor().max(1.0) as usize,
            TaskKind::Regression => n_features,
        };
        let settings = TreeSettings {
            max_depth: self.params.max_depth,
            min_samples_split: self.params.min_samples_split.max(2),
            min_samples_leaf: self.params.min_samples_leaf.max(1),
            max_features,
            n_classes: match self.task {
                TaskKind::Classification => self.n_classes,
                TaskKind::Regression => 0,
            },
        };
        let seed = self.params.random_state;

        self.trees = (0..self.params.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(tree_idx as u64));
                let bootstrap: Vec<usize> = (0..n_samples)
                    .map(|_| rng.gen_range(0..n_samples))
                    .collect();
                DecisionTree::fit(x, y, bootstrap, settings, &mut rng)
            })
            .collect();
        self.n_features = n_features;

        Ok(())
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>, AppError> {
        if self.trees.is_empty() {
            return Err(AppError::Processing(
                "random forest is not fitted".to_string(),
            ));
        }
        if x.ncols() != self.n_features {
            return Err(AppError::Processing(format!(
                "expected {} features, got {}",
                self.n_features,
                x.ncols()
            )));
        }

        let n_trees = self.trees.len() as f64;
        let predictions: Vec<f64> = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row = x.row(i);
                match self.task {
                    TaskKind::Regression => {
                        self.trees
                            .iter()
                            .map(|t| t.leaf_for(row).first().copied().unwrap_or(0.0))
                            .sum::<f64>()
                            / n_trees
                    }
                    TaskKind::Classification => {
                        let mut proba = vec![0.0; self.n_classes.max(1)];
                        for tree in &self.trees {
                            for (acc, p) in proba.iter_mut().zip(tree.leaf_for(row)) {
                                *acc += p;
                            }
                        }
                        argmax(&proba) as f64
                    }
                }
            })
            .collect();

        Ok(Array1::from(predictions))
    }
}

/// Index of the largest value; ties resolve to the lowest index.
fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{accuracy, r2_score};
    use ndarray::Array2;

    fn blobs(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 3), |(i, j)| {
            let base = if i % 2 == 0 { 0.0 } else { 4.0 };
            base + ((i * 7 + j * 3) % 10) as f64 / 10.0
        });
        let y = Array1::from_shape_fn(n, |i| (i % 2) as f64);
        (x, y)
    }

    #[test]
    fn separates_two_blobs() {
        let (x, y) = blobs(60);
        let params = RandomForestParams {
            n_estimators: 15,
            ..Default::default()
        };
        let mut forest = RandomForest::new(params, TaskKind::Classification, 2);
        forest.fit(&x, &y).expect("fit");

        assert_eq!(forest.n_trees(), 15);
        let predictions = forest.predict(&x).expect("predict");
        assert!(accuracy(&y, &predictions) > 0.95);
    }

    #[test]
    fn same_seed_gives_same_forest() {
        let (x, y) = blobs(40);
        let params = RandomForestParams {
            n_estimators: 5,
            max_depth: Some(3),
            ..Default::default()
        };
        let mut a = RandomForest::new(params.clone(), TaskKind::Classification, 2);
        let mut b = RandomForest::new(params, TaskKind::Classification, 2);
        a.fit(&x, &y).expect("fit");
        b.fit(&x, &y).expect("fit");

        assert_eq!(
            serde_json::to_string(&a).expect("serialize"),
            serde_json::to_string(&b).expect("serialize")
        );
    }

    #[test]
    fn regresses_linear_target() {
        let x = Array2::from_shape_fn((80, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| 2.0 * v + 1.0);
        let params = RandomForestParams {
            n_estimators: 20,
            ..Default::default()
        };
        let mut forest = RandomForest::new(params, TaskKind::Regression, 0);
        forest.fit(&x, &y).expect("fit");

        let predictions = forest.predict(&x).expect("predict");
        assert!(r2_score(&y, &predictions) > 0.9);
    }

    #[test]
    fn rejects_wrong_feature_count() {
        let (x, y) = blobs(20);
        let mut forest = RandomForest::new(
            RandomForestParams {
                n_estimators: 2,
                ..Default::default()
            },
            TaskKind::Classification,
            2,
        );
        forest.fit(&x, &y).expect("fit");
        assert!(forest.predict(&Array2::zeros((1, 2))).is_err());
    }
}
