use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Learning problem a job solves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Classification,
    Regression,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Classification => "classification",
            TaskKind::Regression => "regression",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KnnWeights {
    #[default]
    Uniform,
    Distance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnnParams {
    pub n_neighbors: usize,
    pub weights: KnnWeights,
    /// Minkowski power; 2 is euclidean, 1 manhattan.
    pub p: f64,
    pub epochs: Option<usize>,
}

impl Default for KnnParams {
    fn default() -> Self {
        Self {
            n_neighbors: 5,
            weights: KnnWeights::Uniform,
            p: 2.0,
            epochs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RandomForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub random_state: u64,
    pub epochs: Option<usize>,
}

impl Default for RandomForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            random_state: 42,
            epochs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SvmKernel {
    #[default]
    Rbf,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SvmParams {
    #[serde(alias = "C")]
    pub c: f64,
    pub kernel: SvmKernel,
    /// Kernel coefficient; `None` means `1 / (n_features * var(X))`.
    pub gamma: Option<f64>,
    pub tol: f64,
    pub max_passes: usize,
    pub random_state: u64,
    pub epochs: Option<usize>,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            kernel: SvmKernel::Rbf,
            gamma: None,
            tol: 1e-3,
            max_passes: 5,
            random_state: 42,
            epochs: None,
        }
    }
}

/// Supported model families, each with its own typed hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "model_type", rename_all = "snake_case")]
pub enum ModelConfig {
    #[serde(alias = "k_nearest_neighbors")]
    Knn(KnnParams),
    #[serde(alias = "rf")]
    RandomForest(RandomForestParams),
    #[serde(alias = "support_vector_machine")]
    Svm(SvmParams),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::RandomForest(RandomForestParams::default())
    }
}

impl ModelConfig {
    /// Parses a raw hyperparameter mapping. A missing `model_type` selects the
    /// random forest; the family name is matched case-insensitively.
    pub fn from_value(raw: &Value) -> Result<Self, AppError> {
        let Value::Object(map) = raw else {
            return Err(AppError::Validation(
                "model_config must be a JSON object".to_string(),
            ));
        };

        let mut map = map.clone();
        let model_type = match map.get("model_type") {
            Some(Value::String(name)) => name.to_lowercase(),
            Some(_) => {
                return Err(AppError::Validation(
                    "model_type must be a string".to_string(),
                ))
            }
            None => "random_forest".to_string(),
        };
        map.insert("model_type".to_string(), Value::String(model_type.clone()));

        serde_json::from_value(Value::Object(map)).map_err(|e| {
            AppError::Validation(format!("Invalid model configuration for '{model_type}': {e}"))
        })
    }

    pub fn epochs(&self) -> Option<usize> {
        let epochs = match self {
            ModelConfig::Knn(params) => params.epochs,
            ModelConfig::RandomForest(params) => params.epochs,
            ModelConfig::Svm(params) => params.epochs,
        };
        epochs.filter(|e| *e > 0)
    }

    pub fn family(&self) -> &'static str {
        match self {
            ModelConfig::Knn(_) => "knn",
            ModelConfig::RandomForest(_) => "random_forest",
            ModelConfig::Svm(_) => "svm",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelConfig::Knn(_) => "K-Nearest Neighbors (KNN)",
            ModelConfig::RandomForest(_) => "Random Forest",
            ModelConfig::Svm(_) => "Support Vector Machine (SVM)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_model_type_defaults_to_random_forest() {
        let config = ModelConfig::from_value(&json!({ "n_estimators": 10 })).expect("parse");
        match config {
            ModelConfig::RandomForest(params) => {
                assert_eq!(params.n_estimators, 10);
                assert_eq!(params.min_samples_leaf, 1);
                assert_eq!(params.random_state, 42);
                assert!(params.max_depth.is_none());
            }
            other => panic!("unexpected family {other:?}"),
        }
    }

    #[test]
    fn aliases_and_case_are_accepted() {
        let knn = ModelConfig::from_value(&json!({
            "model_type": "K_Nearest_Neighbors",
            "n_neighbors": 3,
            "weights": "distance"
        }))
        .expect("parse knn");
        assert_eq!(
            knn,
            ModelConfig::Knn(KnnParams {
                n_neighbors: 3,
                weights: KnnWeights::Distance,
                ..KnnParams::default()
            })
        );

        let svm = ModelConfig::from_value(&json!({ "model_type": "svm", "C": 0.5 }))
            .expect("parse svm");
        match svm {
            ModelConfig::Svm(params) => {
                assert!((params.c - 0.5).abs() < f64::EPSILON);
                assert_eq!(params.kernel, SvmKernel::Rbf);
            }
            other => panic!("unexpected family {other:?}"),
        }

        let rf = ModelConfig::from_value(&json!({ "model_type": "rf" })).expect("parse rf");
        assert_eq!(rf.family(), "random_forest");
        assert_eq!(rf.display_name(), "Random Forest");
    }

    #[test]
    fn unknown_family_is_a_validation_error() {
        let err = ModelConfig::from_value(&json!({ "model_type": "xgboost" }))
            .expect_err("unknown family");
        assert!(matches!(err, AppError::Validation(_)));

        let err = ModelConfig::from_value(&json!("knn")).expect_err("not an object");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn epochs_override_ignores_zero() {
        let config =
            ModelConfig::from_value(&json!({ "model_type": "knn", "epochs": 0 })).expect("parse");
        assert_eq!(config.epochs(), None);

        let config =
            ModelConfig::from_value(&json!({ "model_type": "knn", "epochs": 7 })).expect("parse");
        assert_eq!(config.epochs(), Some(7));
    }
}
