//! Hold-out evaluation metrics. Class labels are encoded as `0..n_classes`.

use common::jobs::record::{AverageScores, ClassScores, ClassificationReport};
use ndarray::Array1;

fn same_class(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.5
}

pub fn accuracy(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true
        .iter()
        .zip(y_pred.iter())
        .filter(|(t, p)| same_class(**t, **p))
        .count();
    correct as f64 / y_true.len() as f64
}

pub fn mean_squared_error(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let sum: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    sum / y_true.len() as f64
}

pub fn mean_absolute_error(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let sum: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).abs())
        .sum();
    sum / y_true.len() as f64
}

pub fn r2_score(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_tot: f64 = y_true.iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();

    if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else {
        0.0
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Per-class precision/recall/f1 with macro and support-weighted averages.
/// Undefined ratios (no predictions or no support) count as zero.
pub fn classification_report(
    y_true: &Array1<f64>,
    y_pred: &Array1<f64>,
    labels: &[String],
) -> ClassificationReport {
    let n_classes = labels.len();
    let mut confusion = vec![vec![0_usize; n_classes]; n_classes];

    for (t, p) in y_true.iter().zip(y_pred.iter()) {
        let (t, p) = (t.round() as usize, p.round() as usize);
        if let Some(cell) = confusion.get_mut(t).and_then(|row| row.get_mut(p)) {
            *cell += 1;
        }
    }

    let classes: Vec<ClassScores> = labels
        .iter()
        .enumerate()
        .map(|(class, label)| {
            let tp = confusion[class][class];
            let support: usize = confusion[class].iter().sum();
            let predicted: usize = confusion.iter().map(|row| row[class]).sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            ClassScores {
                label: label.clone(),
                precision,
                recall,
                f1_score: f1(precision, recall),
                support,
            }
        })
        .collect();

    let total_support: usize = classes.iter().map(|c| c.support).sum();
    let macro_avg = if classes.is_empty() {
        AverageScores::default()
    } else {
        let n = classes.len() as f64;
        AverageScores {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / n,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / n,
            f1_score: classes.iter().map(|c| c.f1_score).sum::<f64>() / n,
            support: total_support,
        }
    };
    let weighted_avg = if total_support == 0 {
        AverageScores::default()
    } else {
        let weight = |c: &ClassScores| c.support as f64 / total_support as f64;
        AverageScores {
            precision: classes.iter().map(|c| c.precision * weight(c)).sum(),
            recall: classes.iter().map(|c| c.recall * weight(c)).sum(),
            f1_score: classes.iter().map(|c| c.f1_score * weight(c)).sum(),
            support: total_support,
        }
    };

    ClassificationReport {
        labels: labels.to_vec(),
        classes,
        accuracy: accuracy(y_true, y_pred),
        macro_avg,
        weighted_avg,
        confusion_matrix: confusion,
    }
}
