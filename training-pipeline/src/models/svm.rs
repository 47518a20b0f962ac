use common::{
    error::AppError,
    jobs::model_config::{SvmKernel, SvmParams, TaskKind},
};
use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Largest training set an SVM accepts. The Gram matrix is dense, so this
/// bounds it at 5 000² f64 values (about 200 MB).
pub const MAX_KERNEL_ROWS: usize = 5_000;
/// Hard stop for SMO sweeps, independent of `max_passes`.
const MAX_SMO_ITERATIONS: usize = 1_000;
const CG_MAX_ITERATIONS: usize = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum Kernel {
    Linear,
    Rbf { gamma: f64 },
}

impl Kernel {
    fn eval(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        match self {
            Kernel::Linear => a.dot(&b),
            Kernel::Rbf { gamma } => {
                let sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
                (-gamma * sq).exp()
            }
        }
    }

    /// Gram matrix, filled row by row in a single buffer.
    fn matrix(&self, x: &Array2<f64>) -> Result<Array2<f64>, AppError> {
        let n = x.nrows();
        let mut values = vec![0.0; n * n];
        values
            .par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                let xi = x.row(i);
                for (j, value) in row.iter_mut().enumerate() {
                    *value = self.eval(xi, x.row(j));
                }
            });
        Array2::from_shape_vec((n, n), values)
            .map_err(|err| AppError::Processing(format!("kernel matrix: {err}")))
    }
}

/// `1 / (n_features * var(X))`, falling back to 1 for constant input.
fn scale_gamma(x: &Array2<f64>) -> f64 {
    let n = x.len() as f64;
    if n == 0.0 {
        return 1.0;
    }
    let mean = x.sum() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let denom = x.ncols() as f64 * var;
    if denom > 0.0 {
        1.0 / denom
    } else {
        1.0
    }
}

/// Kernel expansion `sum(coef_i * K(sv_i, x)) + bias`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KernelExpansion {
    support_vectors: Array2<f64>,
    coefficients: Array1<f64>,
    bias: f64,
}

impl KernelExpansion {
    fn decision(&self, kernel: &Kernel, sample: ArrayView1<'_, f64>) -> f64 {
        self.support_vectors
            .rows()
            .into_iter()
            .zip(self.coefficients.iter())
            .map(|(sv, coef)| coef * kernel.eval(sv, sample))
            .sum::<f64>()
            + self.bias
    }

    fn from_indices(x: &Array2<f64>, coefficients: &Array1<f64>, bias: f64, keep: &[usize]) -> Self {
        let support_vectors = x.select(ndarray::Axis(0), keep);
        let coefficients = keep.iter().map(|&i| coefficients[i]).collect();
        Self {
            support_vectors,
            coefficients,
            bias,
        }
    }
}

/// Support vector machine. Classification trains simplified-SMO binary
/// machines (one-vs-rest beyond two classes); regression solves the
/// least-squares formulation with conjugate gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvmModel {
    pub params: SvmParams,
    pub task: TaskKind,
    n_classes: usize,
    kernel: Option<Kernel>,
    machines: Vec<KernelExpansion>,
}

impl SvmModel {
    pub fn new(params: SvmParams, task: TaskKind, n_classes: usize) -> Self {
        Self {
            params,
            task,
            n_classes,
            kernel: None,
            machines: Vec::new(),
        }
    }

    pub fn n_support_vectors(&self) -> usize {
        self.machines.iter().map(|m| m.support_vectors.nrows()).sum()
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<(), AppError> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(AppError::Processing(format!(
                "SVM needs matching, non-empty inputs (got {n} rows and {} targets)",
                y.len()
            )));
        }
        if n > MAX_KERNEL_ROWS {
            return Err(AppError::Validation(format!(
                "SVM supports at most {MAX_KERNEL_ROWS} training rows, got {n}"
            )));
        }
        if self.params.c <= 0.0 {
            return Err(AppError::Validation("C must be positive".to_string()));
        }

        let kernel = match self.params.kernel {
            SvmKernel::Linear => Kernel::Linear,
            SvmKernel::Rbf => Kernel::Rbf {
                gamma: self.params.gamma.unwrap_or_else(|| scale_gamma(x)),
            },
        };
        let gram = kernel.matrix(x)?;

        self.machines = match self.task {
            TaskKind::Classification => {
                if self.n_classes < 2 {
                    return Err(AppError::Processing(
                        "SVM classification needs at least 2 classes".to_string(),
                    ));
                }
                let positives: Vec<usize> = if self.n_classes == 2 {
                    vec![1]
                } else {
                    (0..self.n_classes).collect()
                };
                positives
                    .into_iter()
                    .map(|class| {
                        let y_binary = y.mapv(|v| {
                            if v.round() as usize == class {
                                1.0
                            } else {
                                -1.0
                            }
                        });
                        self.smo(x, &gram, &y_binary, class as u64)
                    })
                    .collect()
            }
            TaskKind::Regression => vec![self.least_squares(x, gram, y)?],
        };
        self.kernel = Some(kernel);

        Ok(())
    }

    fn smo(
        &self,
        x: &Array2<f64>,
        gram: &Array2<f64>,
        y: &Array1<f64>,
        stream: u64,
    ) -> KernelExpansion {
        let n = x.nrows();
        let c = self.params.c;
        let tol = self.params.tol;
        let mut alphas = Array1::<f64>::zeros(n);
        let mut bias = 0.0;
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.random_state.wrapping_add(stream));

        let decision = |alphas: &Array1<f64>, bias: f64, i: usize| -> f64 {
            (0..n).map(|k| alphas[k] * y[k] * gram[[k, i]]).sum::<f64>() + bias
        };

        let mut passes = 0;
        let mut iterations = 0;
        while n > 1 && passes < self.params.max_passes && iterations < MAX_SMO_ITERATIONS {
            let mut changed = 0;
            for i in 0..n {
                let e_i = decision(&alphas, bias, i) - y[i];
                let violates = (y[i] * e_i < -tol && alphas[i] < c) || (y[i] * e_i > tol && alphas[i] > 0.0);
                if !violates {
                    continue;
                }

                let j = loop {
                    let j = rng.gen_range(0..n);
                    if j != i {
                        break j;
                    }
                };
                let e_j = decision(&alphas, bias, j) - y[j];
                let (ai_old, aj_old) = (alphas[i], alphas[j]);

                let (low, high) = if (y[i] - y[j]).abs() > f64::EPSILON {
                    ((aj_old - ai_old).max(0.0), (c + aj_old - ai_old).min(c))
                } else {
                    ((ai_old + aj_old - c).max(0.0), (ai_old + aj_old).min(c))
                };
                if (high - low).abs() < 1e-10 {
                    continue;
                }

                let eta = 2.0 * gram[[i, j]] - gram[[i, i]] - gram[[j, j]];
                if eta >= 0.0 {
                    continue;
                }

                let aj = (aj_old - y[j] * (e_i - e_j) / eta).clamp(low, high);
                if (aj - aj_old).abs() < 1e-5 {
                    continue;
                }
                let ai = ai_old + y[i] * y[j] * (aj_old - aj);
                alphas[i] = ai;
                alphas[j] = aj;

                let b1 = bias
                    - e_i
                    - y[i] * (ai - ai_old) * gram[[i, i]]
                    - y[j] * (aj - aj_old) * gram[[i, j]];
                let b2 = bias
                    - e_j
                    - y[i] * (ai - ai_old) * gram[[i, j]]
                    - y[j] * (aj - aj_old) * gram[[j, j]];
                bias = if ai > 0.0 && ai < c {
                    b1
                } else if aj > 0.0 && aj < c {
                    b2
                } else {
                    (b1 + b2) / 2.0
                };
                changed += 1;
            }

            iterations += 1;
            passes = if changed == 0 { passes + 1 } else { 0 };
        }

        let coefficients = &alphas * y;
        let keep: Vec<usize> = (0..n).filter(|&i| alphas[i] > 1e-8).collect();
        KernelExpansion::from_indices(x, &coefficients, bias, &keep)
    }

    /// Least-squares SVM: solves `(K + I/C) a + b = y`, `sum(a) = 0`.
    /// The Gram matrix is turned into the system matrix in place.
    fn least_squares(
        &self,
        x: &Array2<f64>,
        mut system: Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<KernelExpansion, AppError> {
        let n = x.nrows();
        let ridge = 1.0 / self.params.c;
        for i in 0..n {
            system[[i, i]] += ridge;
        }

        let ones = Array1::<f64>::ones(n);
        let eta = conjugate_gradient(&system, &ones, self.params.tol);
        let nu = conjugate_gradient(&system, y, self.params.tol);

        let s = ones.dot(&eta);
        if s.abs() < f64::EPSILON {
            return Err(AppError::Processing(
                "SVM regression system is singular".to_string(),
            ));
        }
        let bias = ones.dot(&nu) / s;
        let coefficients = &nu - &(&eta * bias);

        let keep: Vec<usize> = (0..n).collect();
        Ok(KernelExpansion::from_indices(x, &coefficients, bias, &keep))
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>, AppError> {
        let Some(kernel) = self.kernel else {
            return Err(AppError::Processing("SVM model is not fitted".to_string()));
        };
        let expected = self
            .machines
            .first()
            .map_or(0, |m| m.support_vectors.ncols());
        if self.machines.iter().any(|m| m.support_vectors.nrows() > 0) && x.ncols() != expected {
            return Err(AppError::Processing(format!(
                "expected {expected} features, got {}",
                x.ncols()
            )));
        }

        let predictions: Vec<f64> = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row = x.row(i);
                match (self.task, self.machines.as_slice()) {
                    (TaskKind::Regression, [machine, ..]) => machine.decision(&kernel, row),
                    (TaskKind::Classification, [machine]) => {
                        if machine.decision(&kernel, row) >= 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    (TaskKind::Classification, machines) => machines
                        .iter()
                        .map(|m| m.decision(&kernel, row))
                        .enumerate()
                        .fold((0, f64::MIN), |best, (class, score)| {
                            if score > best.1 {
                                (class, score)
                            } else {
                                best
                            }
                        })
                        .0 as f64,
                    (TaskKind::Regression, []) => 0.0,
                }
            })
            .collect();

        Ok(Array1::from(predictions))
    }
}

/// Solves `a x = b` for symmetric positive definite `a`.
fn conjugate_gradient(a: &Array2<f64>, b: &Array1<f64>, tol: f64) -> Array1<f64> {
    let mut x = Array1::<f64>::zeros(b.len());
    let mut r = b.clone();
    let mut p = r.clone();
    let mut rs_old = r.dot(&r);
    let threshold = (tol * tol).max(1e-20) * b.dot(b).max(f64::MIN_POSITIVE);

    for _ in 0..CG_MAX_ITERATIONS.max(b.len()) {
        if rs_old <= threshold {
            break;
        }
        let ap = a.dot(&p);
        let denom = p.dot(&ap);
        if denom.abs() < f64::MIN_POSITIVE {
            break;
        }
        let alpha = rs_old / denom;
        x.scaled_add(alpha, &p);
        r.scaled_add(-alpha, &ap);
        let rs_new = r.dot(&r);
        p = &r + &(&p * (rs_new / rs_old));
        rs_old = rs_new;
    }

    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{accuracy, r2_score};
    use ndarray::array;

    fn separable() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [1.0, 1.0],
            [1.5, 0.5],
            [0.5, 1.2],
            [1.2, 1.4],
            [5.0, 5.0],
            [5.5, 4.5],
            [4.5, 5.2],
            [5.2, 5.4]
        ];
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        (x, y)
    }

    #[test]
    fn linear_kernel_separates_binary_data() {
        let (x, y) = separable();
        let params = SvmParams {
            kernel: SvmKernel::Linear,
            ..Default::default()
        };
        let mut model = SvmModel::new(params, TaskKind::Classification, 2);
        model.fit(&x, &y).expect("fit");

        let predictions = model.predict(&x).expect("predict");
        assert!((accuracy(&y, &predictions) - 1.0).abs() < f64::EPSILON);
        assert!(model.n_support_vectors() > 0);
    }

    #[test]
    fn rbf_one_vs_rest_handles_three_classes() {
        let x = array![
            [0.0, 0.0],
            [0.2, 0.1],
            [0.1, 0.3],
            [5.0, 0.0],
            [5.2, 0.1],
            [4.9, 0.2],
            [0.0, 5.0],
            [0.1, 5.2],
            [0.3, 4.9]
        ];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
        let params = SvmParams {
            c: 10.0,
            ..Default::default()
        };
        let mut model = SvmModel::new(params, TaskKind::Classification, 3);
        model.fit(&x, &y).expect("fit");

        let predictions = model.predict(&x).expect("predict");
        assert!(accuracy(&y, &predictions) > 0.99);
    }

    #[test]
    fn least_squares_regression_fits_smooth_curve() {
        let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64 / 40.0);
        let y = x.column(0).mapv(|v| (v * 3.0).sin());
        let params = SvmParams {
            c: 100.0,
            ..Default::default()
        };
        let mut model = SvmModel::new(params, TaskKind::Regression, 0);
        model.fit(&x, &y).expect("fit");

        let predictions = model.predict(&x).expect("predict");
        assert!(r2_score(&y, &predictions) > 0.9);
    }

    #[test]
    fn conjugate_gradient_solves_small_system() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = conjugate_gradient(&a, &b, 1e-10);
        assert!((x[0] - 1.0 / 11.0).abs() < 1e-8);
        assert!((x[1] - 7.0 / 11.0).abs() < 1e-8);
    }

    #[test]
    fn gram_matrix_is_symmetric_with_unit_rbf_diagonal() {
        let (x, _) = separable();
        let gram = Kernel::Rbf { gamma: 0.5 }.matrix(&x).expect("gram");
        assert_eq!(gram.dim(), (8, 8));
        for i in 0..8 {
            assert!((gram[[i, i]] - 1.0).abs() < 1e-12);
            for j in 0..8 {
                assert!((gram[[i, j]] - gram[[j, i]]).abs() < 1e-12);
            }
        }
        let linear = Kernel::Linear.matrix(&x).expect("gram");
        assert!((linear[[0, 4]] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn oversized_training_sets_are_rejected_before_the_kernel_is_built() {
        let n = MAX_KERNEL_ROWS + 1;
        let x = Array2::<f64>::zeros((n, 1));
        let y = Array1::from_shape_fn(n, |i| (i % 2) as f64);

        for task in [TaskKind::Classification, TaskKind::Regression] {
            let mut model = SvmModel::new(SvmParams::default(), task, 2);
            let err = model.fit(&x, &y).expect_err("too many rows");
            assert!(matches!(err, AppError::Validation(msg) if msg.contains("5000")));
        }
    }

    #[test]
    fn predict_before_fit_fails() {
        let model = SvmModel::new(SvmParams::default(), TaskKind::Classification, 2);
        assert!(model.predict(&array![[1.0, 2.0]]).is_err());
    }
}
