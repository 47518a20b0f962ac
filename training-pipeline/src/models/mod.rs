pub mod knn;
pub mod random_forest;
pub mod svm;

use common::{
    error::AppError,
    jobs::model_config::{ModelConfig, TaskKind},
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use self::{knn::KnnModel, random_forest::RandomForest, svm::SvmModel};

/// A fitted model of one of the supported families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum TrainedModel {
    Knn(KnnModel),
    RandomForest(RandomForest),
    Svm(SvmModel),
}

impl TrainedModel {
    /// Builds the estimator for `config` and fits it. This is the only place
    /// the model family is branched on.
    pub fn fit(
        config: &ModelConfig,
        task: TaskKind,
        n_classes: usize,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<Self, AppError> {
        match config {
            ModelConfig::Knn(params) => {
                let mut model = KnnModel::new(params.clone(), task, n_classes);
                model.fit(x, y)?;
                Ok(TrainedModel::Knn(model))
            }
            ModelConfig::RandomForest(params) => {
                let mut model = RandomForest::new(params.clone(), task, n_classes);
                model.fit(x, y)?;
                Ok(TrainedModel::RandomForest(model))
            }
            ModelConfig::Svm(params) => {
                let mut model = SvmModel::new(params.clone(), task, n_classes);
                model.fit(x, y)?;
                Ok(TrainedModel::Svm(model))
            }
        }
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>, AppError> {
        match self {
            TrainedModel::Knn(model) => model.predict(x),
            TrainedModel::RandomForest(model) => model.predict(x),
            TrainedModel::Svm(model) => model.predict(x),
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            TrainedModel::Knn(_) => "knn",
            TrainedModel::RandomForest(_) => "random_forest",
            TrainedModel::Svm(_) => "svm",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::jobs::model_config::ModelConfig;
    use ndarray::array;
    use serde_json::json;

    #[test]
    fn dispatches_on_family_and_round_trips() {
        let x = array![[0.0], [0.1], [0.2], [3.0], [3.1], [3.2]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];

        for raw in [
            json!({"model_type": "knn", "n_neighbors": 3}),
            json!({"model_type": "random_forest", "n_estimators": 5}),
            json!({"model_type": "svm", "kernel": "linear"}),
        ] {
            let config = ModelConfig::from_value(&raw).expect("config");
            let model = TrainedModel::fit(&config, TaskKind::Classification, 2, &x, &y)
                .expect("fit");
            assert_eq!(model.family(), config.family());

            let encoded = serde_json::to_string(&model).expect("serialize");
            let decoded: TrainedModel = serde_json::from_str(&encoded).expect("deserialize");
            let predictions = decoded.predict(&array![[0.05], [3.05]]).expect("predict");
            assert_eq!(predictions.to_vec(), vec![0.0, 1.0]);
        }
    }
}
