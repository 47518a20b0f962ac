use std::{cmp::Ordering, collections::BinaryHeap};

use common::{
    error::AppError,
    jobs::model_config::{KnnParams, KnnWeights, TaskKind},
};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Lazy learner: fitting stores the training set, prediction scans it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnModel {
    pub params: KnnParams,
    pub task: TaskKind,
    n_classes: usize,
    x_train: Option<Array2<f64>>,
    y_train: Option<Array1<f64>>,
}

/// Max-heap entry keyed on distance, so the farthest neighbour is on top.
#[derive(Debug, Clone, Copy)]
struct Neighbor {
    distance: f64,
    label: f64,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

impl KnnModel {
    pub fn new(params: KnnParams, task: TaskKind, n_classes: usize) -> Self {
        Self {
            params,
            task,
            n_classes,
            x_train: None,
            y_train: None,
        }
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<(), AppError> {
        if x.nrows() == 0 || x.nrows() != y.len() {
            return Err(AppError::Processing(format!(
                "KNN needs matching, non-empty inputs (got {} rows and {} targets)",
                x.nrows(),
                y.len()
            )));
        }
        if self.params.n_neighbors == 0 {
            return Err(AppError::Validation(
                "n_neighbors must be at least 1".to_string(),
            ));
        }
        if self.params.p <= 0.0 {
            return Err(AppError::Validation("p must be positive".to_string()));
        }

        self.x_train = Some(x.clone());
        self.y_train = Some(y.clone());
        Ok(())
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>, AppError> {
        let (Some(x_train), Some(y_train)) = (&self.x_train, &self.y_train) else {
            return Err(AppError::Processing("KNN model is not fitted".to_string()));
        };
        if x.ncols() != x_train.ncols() {
            return Err(AppError::Processing(format!(
                "expected {} features, got {}",
                x_train.ncols(),
                x.ncols()
            )));
        }

        let k = self.params.n_neighbors.min(x_train.nrows());
        let predictions: Vec<f64> = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let neighbors = self.find_k_nearest(x.row(i), x_train, y_train, k);
                match self.task {
                    TaskKind::Classification => self.vote(&neighbors),
                    TaskKind::Regression => self.average(&neighbors),
                }
            })
            .collect();

        Ok(Array1::from(predictions))
    }

    fn find_k_nearest(
        &self,
        point: ArrayView1<'_, f64>,
        x_train: &Array2<f64>,
        y_train: &Array1<f64>,
        k: usize,
    ) -> Vec<Neighbor> {
        let mut heap = BinaryHeap::with_capacity(k + 1);

        for (row, label) in x_train.rows().into_iter().zip(y_train.iter()) {
            let distance = minkowski(point, row, self.params.p);
            if heap.len() < k {
                heap.push(Neighbor {
                    distance,
                    label: *label,
                });
            } else if heap.peek().is_some_and(|top| distance < top.distance) {
                heap.pop();
                heap.push(Neighbor {
                    distance,
                    label: *label,
                });
            }
        }

        heap.into_vec()
    }

    /// Neighbour weights. With distance weighting, exact matches take all
    /// the weight.
    fn weights(&self, neighbors: &[Neighbor]) -> Vec<f64> {
        match self.params.weights {
            KnnWeights::Uniform => vec![1.0; neighbors.len()],
            KnnWeights::Distance => {
                if neighbors.iter().any(|n| n.distance == 0.0) {
                    neighbors
                        .iter()
                        .map(|n| if n.distance == 0.0 { 1.0 } else { 0.0 })
                        .collect()
                } else {
                    neighbors.iter().map(|n| 1.0 / n.distance).collect()
                }
            }
        }
    }

    fn vote(&self, neighbors: &[Neighbor]) -> f64 {
        let weights = self.weights(neighbors);
        let mut tally = vec![0.0; self.n_classes.max(1)];
        for (neighbor, weight) in neighbors.iter().zip(weights) {
            if let Some(slot) = tally.get_mut(neighbor.label.round() as usize) {
                *slot += weight;
            }
        }

        // Ties go to the lowest class index
        tally
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (class, &score)| {
                if score > best.1 {
                    (class, score)
                } else {
                    best
                }
            })
            .0 as f64
    }

    fn average(&self, neighbors: &[Neighbor]) -> f64 {
        let weights = self.weights(neighbors);
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        neighbors
            .iter()
            .zip(weights)
            .map(|(n, w)| n.label * w)
            .sum::<f64>()
            / total
    }
}

fn minkowski(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>, p: f64) -> f64 {
    if (p - 2.0).abs() < f64::EPSILON {
        return a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt();
    }
    if (p - 1.0).abs() < f64::EPSILON {
        return a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum();
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs().powf(p))
        .sum::<f64>()
        .powf(1.0 / p)
}
