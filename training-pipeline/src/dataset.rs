use std::{
    collections::{BTreeMap, HashMap},
    io::Read,
    path::Path,
};

use common::{error::AppError, jobs::model_config::TaskKind};
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Cell values treated as missing.
const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

pub const TEST_FRACTION: f64 = 0.2;
pub const SPLIT_SEED: u64 = 42;

pub fn is_missing(cell: &str) -> bool {
    MISSING_TOKENS.contains(&cell.trim())
}

fn parse_numeric(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Raw tabular data as read from disk, every cell kept as text.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DataTable {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, AppError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns = reader
            .headers()
            .map_err(|e| AppError::Validation(format!("Failed to read dataset header: {e}")))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| AppError::Validation(format!("Malformed dataset row: {e}")))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { columns, rows })
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Removes rows with any missing cell and returns how many were dropped.
    pub fn drop_missing(&mut self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| !row.iter().any(|cell| is_missing(cell)));
        before.saturating_sub(self.rows.len())
    }
}

/// Reads a CSV dataset. A path that does not exist is reported as not found.
pub fn load_csv(path: &Path) -> Result<DataTable, AppError> {
    if !path.is_file() {
        return Err(AppError::NotFound(format!(
            "Dataset not found: {}",
            path.display()
        )));
    }

    let file = std::fs::File::open(path)?;
    DataTable::from_reader(file)
}

/// Checks the preconditions a table must meet before any training work:
/// it has rows and contains the target column.
pub fn validate_table(table: &DataTable, target_column: &str) -> Result<(), AppError> {
    if table.is_empty() {
        return Err(AppError::Validation("Dataset is empty".to_string()));
    }

    if table.column_index(target_column).is_none() {
        return Err(AppError::Validation(format!(
            "Target column '{target_column}' not found. Available: {:?}",
            table.columns
        )));
    }

    Ok(())
}

/// Numeric feature matrix and encoded target.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub features: Array2<f64>,
    pub target: Array1<f64>,
    pub feature_names: Vec<String>,
    /// Original class labels, indexed by encoded class. Empty for regression.
    pub class_labels: Vec<String>,
}

impl PreparedData {
    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }
}

/// Converts a validated, missing-free table into arrays. Feature columns must
/// all be numeric; classification targets are label-encoded in sorted order.
pub fn prepare(
    table: &DataTable,
    target_column: &str,
    task_kind: TaskKind,
) -> Result<PreparedData, AppError> {
    let target_idx = table.column_index(target_column).ok_or_else(|| {
        AppError::Validation(format!(
            "Target column '{target_column}' not found. Available: {:?}",
            table.columns
        ))
    })?;

    let feature_idx: Vec<usize> = (0..table.n_columns()).filter(|i| *i != target_idx).collect();
    if feature_idx.is_empty() {
        return Err(AppError::Validation(
            "Dataset has no feature columns besides the target".to_string(),
        ));
    }

    let non_numeric: Vec<String> = feature_idx
        .iter()
        .filter(|&&col| {
            table
                .rows
                .iter()
                .any(|row| row.get(col).and_then(|cell| parse_numeric(cell)).is_none())
        })
        .filter_map(|&col| table.columns.get(col).cloned())
        .collect();
    if !non_numeric.is_empty() {
        return Err(AppError::Validation(format!(
            "Non-numeric columns found: {non_numeric:?}. Please encode categorical variables."
        )));
    }

    let n_rows = table.n_rows();
    let mut values = Vec::with_capacity(n_rows * feature_idx.len());
    for row in &table.rows {
        for &col in &feature_idx {
            values.push(row.get(col).and_then(|cell| parse_numeric(cell)).unwrap_or(0.0));
        }
    }
    let features = Array2::from_shape_vec((n_rows, feature_idx.len()), values)
        .map_err(|e| AppError::InternalError(format!("feature matrix shape: {e}")))?;

    let raw_target: Vec<&str> = table
        .rows
        .iter()
        .map(|row| row.get(target_idx).map_or("", String::as_str))
        .collect();

    let (target, class_labels) = match task_kind {
        TaskKind::Classification => encode_labels(&raw_target),
        TaskKind::Regression => {
            let parsed: Option<Vec<f64>> = raw_target.iter().map(|v| parse_numeric(v)).collect();
            let parsed = parsed.ok_or_else(|| {
                AppError::Validation(format!(
                    "Target column '{target_column}' must be numeric for regression"
                ))
            })?;
            (Array1::from(parsed), Vec::new())
        }
    };

    let feature_names = feature_idx
        .iter()
        .filter_map(|&col| table.columns.get(col).cloned())
        .collect();

    Ok(PreparedData {
        features,
        target,
        feature_names,
        class_labels,
    })
}

/// Sorted unique labels (numerically when every label is a number) and the
/// index of each sample's label.
fn encode_labels(raw: &[&str]) -> (Array1<f64>, Vec<String>) {
    let mut labels: Vec<String> = raw.iter().map(|v| (*v).to_string()).collect();
    labels.sort_unstable();
    labels.dedup();

    let numeric: Option<Vec<f64>> = labels.iter().map(|l| parse_numeric(l)).collect();
    if let Some(numeric) = numeric {
        let mut paired: Vec<(f64, String)> = numeric.into_iter().zip(labels).collect();
        paired.sort_by(|a, b| a.0.total_cmp(&b.0));
        labels = paired.into_iter().map(|(_, label)| label).collect();
    }

    let index: HashMap<&str, usize> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| (label.as_str(), i))
        .collect();
    let encoded = raw
        .iter()
        .map(|v| index.get(v).copied().unwrap_or_default() as f64)
        .collect::<Array1<f64>>();

    (encoded, labels)
}

#[derive(Debug, Clone)]
pub struct SplitData {
    pub x_train: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_train: Array1<f64>,
    pub y_test: Array1<f64>,
}

impl SplitData {
    pub fn n_train(&self) -> usize {
        self.x_train.nrows()
    }

    pub fn n_test(&self) -> usize {
        self.x_test.nrows()
    }
}

/// Seeded hold-out split. When `stratify` is set every class keeps its share
/// in both halves, which needs at least two samples per class.
pub fn train_test_split(
    data: &PreparedData,
    test_fraction: f64,
    stratify: bool,
    seed: u64,
) -> Result<SplitData, AppError> {
    let n = data.n_samples();
    if n < 2 {
        return Err(AppError::Validation(format!(
            "Dataset too small to split: {n} rows"
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train_idx = Vec::with_capacity(n);
    let mut test_idx = Vec::new();

    if stratify {
        let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, &label) in data.target.iter().enumerate() {
            by_class.entry(label as i64).or_default().push(i);
        }

        if let Some((class, members)) = by_class.iter().find(|(_, members)| members.len() < 2) {
            let label = data
                .class_labels
                .get(*class as usize)
                .cloned()
                .unwrap_or_else(|| class.to_string());
            return Err(AppError::Validation(format!(
                "Class '{label}' has only {} row(s); stratified splitting needs at least 2 per class",
                members.len()
            )));
        }

        for members in by_class.values_mut() {
            members.shuffle(&mut rng);
            let n_test = ((members.len() as f64) * test_fraction).round() as usize;
            let n_test = n_test.clamp(1, members.len() - 1);
            let (test, train) = members.split_at(n_test);
            test_idx.extend_from_slice(test);
            train_idx.extend_from_slice(train);
        }

        train_idx.shuffle(&mut rng);
        test_idx.shuffle(&mut rng);
    } else {
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rng);
        let n_test = ((n as f64) * test_fraction).ceil() as usize;
        let n_test = n_test.clamp(1, n - 1);
        test_idx = indices[..n_test].to_vec();
        train_idx = indices[n_test..].to_vec();
    }

    Ok(SplitData {
        x_train: data.features.select(Axis(0), &train_idx),
        x_test: data.features.select(Axis(0), &test_idx),
        y_train: data.target.select(Axis(0), &train_idx),
        y_test: data.target.select(Axis(0), &test_idx),
    })
}
