/// Built-in training engine
///
/// Full-batch gradient descent over the encoded dataset:
/// softmax regression (cross-entropy) for classification and linear
/// regression (mean squared error on the standardized target) for
/// regression. Weights start at zero, so a run is reproducible for the
/// same data and configuration.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::preprocess::{preprocess, EncodingPlan, PreparedDataset};
use super::{ModelMetadata, Prediction, ProgressSink, TrainingEngine, TrainingResult};
use crate::error::EngineError;
use crate::files::DataFormat;
use crate::state::data::{ModelArtifact, ModelMetrics, ProblemType, ProgressEvent, TrainingConfig};
use crate::state::library::generate_id;

const ENGINE_NAME: &str = "linear";

/// A fitted model: one weight row per output, bias in the last slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub plan: EncodingPlan,
    pub weights: Vec<Vec<f64>>,
}

impl LinearModel {
    fn zeros(plan: EncodingPlan) -> Self {
        let width = plan.width() + 1;
        let weights = vec![vec![0.0; width]; plan.outputs()];
        Self { plan, weights }
    }

    fn scores(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .map(|w| {
                let bias = w[w.len() - 1];
                w.iter().zip(x).map(|(wi, xi)| wi * xi).sum::<f64>() + bias
            })
            .collect()
    }

    fn predict_encoded(&self, x: &[f64]) -> Prediction {
        let scores = self.scores(x);
        match self.plan.problem_type {
            ProblemType::Classification => {
                let probs = softmax(&scores);
                let (best, confidence) = argmax(&probs);
                Prediction {
                    value: best as f64,
                    label: self.plan.classes.get(best).cloned(),
                    confidence: Some(confidence),
                }
            }
            ProblemType::Regression => Prediction {
                value: scores[0] * self.plan.target_std + self.plan.target_mean,
                label: None,
                confidence: None,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactPayload {
    metadata: ModelMetadata,
    model: LinearModel,
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn argmax(values: &[f64]) -> (usize, f64) {
    values
        .iter()
        .cloned()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
}

/// Loss and accuracy of the current weights, plus the averaged gradient
fn epoch_step(model: &LinearModel, features: &[Vec<f64>], labels: &[f64]) -> (f64, f64, Vec<Vec<f64>>) {
    let n = features.len() as f64;
    let width = model.plan.width();
    let mut grad = vec![vec![0.0; width + 1]; model.weights.len()];

    match model.plan.problem_type {
        ProblemType::Classification => {
            let mut loss = 0.0;
            let mut correct = 0usize;
            for (x, &y) in features.iter().zip(labels) {
                let probs = softmax(&model.scores(x));
                let label = y as usize;
                loss -= probs[label].max(1e-12).ln();
                if argmax(&probs).0 == label {
                    correct += 1;
                }
                for (k, p) in probs.iter().enumerate() {
                    let err = p - if k == label { 1.0 } else { 0.0 };
                    for (g, xi) in grad[k].iter_mut().zip(x) {
                        *g += err * xi;
                    }
                    grad[k][width] += err;
                }
            }
            for row in grad.iter_mut() {
                row.iter_mut().for_each(|g| *g /= n);
            }
            (loss / n, correct as f64 / n, grad)
        }
        ProblemType::Regression => {
            let mean_y = labels.iter().sum::<f64>() / n;
            let total_ss: f64 = labels.iter().map(|y| (y - mean_y).powi(2)).sum();
            let mut residual_ss = 0.0;
            for (x, &y) in features.iter().zip(labels) {
                let err = model.scores(x)[0] - y;
                residual_ss += err * err;
                for (g, xi) in grad[0].iter_mut().zip(x) {
                    *g += err * xi;
                }
                grad[0][width] += err;
            }
            let loss = residual_ss / n;
            grad[0].iter_mut().for_each(|g| *g = 2.0 * *g / n);
            let r2 = if total_ss > 0.0 { 1.0 - residual_ss / total_ss } else { 0.0 };
            (loss, r2.clamp(0.0, 1.0), grad)
        }
    }
}

/// In-process engine holding fitted models in memory
#[derive(Debug, Default)]
pub struct LinearEngine {
    models: RwLock<HashMap<String, LinearModel>>,
}

impl LinearEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of models held in memory
    pub fn loaded_models(&self) -> usize {
        self.models.read().len()
    }
}

#[async_trait]
impl TrainingEngine for LinearEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn preprocess(
        &self,
        raw: &[u8],
        format: DataFormat,
        target_column: &str,
    ) -> Result<PreparedDataset, EngineError> {
        preprocess(raw, format, target_column)
    }

    async fn train(
        &self,
        dataset: PreparedDataset,
        config: &TrainingConfig,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TrainingResult, EngineError> {
        if !self.supports(&config.algorithm) {
            return Err(EngineError::UnsupportedAlgorithm(config.algorithm.clone()));
        }

        let started = Instant::now();
        let total_epochs = config.epochs.max(1);
        let rows = dataset.rows();
        let PreparedDataset {
            features,
            labels,
            problem_type,
            plan,
            ..
        } = dataset;

        let mut model = LinearModel::zeros(plan);
        let mut best = f64::INFINITY;
        let mut stale = 0u32;
        let mut last = (f64::NAN, 0.0);
        let mut epochs_run = 0;

        for epoch in 1..=total_epochs {
            if cancel.is_cancelled() {
                tracing::info!("Training cancelled before epoch {}", epoch);
                return Err(EngineError::Cancelled);
            }

            let (loss, accuracy, grad) = epoch_step(&model, &features, &labels);
            if !loss.is_finite() {
                return Err(EngineError::Numeric(format!("loss diverged at epoch {}", epoch)));
            }
            for (w_row, g_row) in model.weights.iter_mut().zip(&grad) {
                for (w, g) in w_row.iter_mut().zip(g_row) {
                    *w -= config.learning_rate * g;
                }
            }

            last = (loss, accuracy);
            epochs_run = epoch;
            progress
                .on_progress(ProgressEvent {
                    epoch,
                    total_epochs,
                    loss,
                    accuracy,
                })
                .await?;

            if loss < best - config.min_delta {
                best = loss;
                stale = 0;
            } else {
                stale += 1;
            }

            if config.early_stopping_patience > 0 && stale >= config.early_stopping_patience && epoch < total_epochs {
                tracing::info!("Early stopping at epoch {}/{} (loss {:.4})", epoch, total_epochs, loss);
                progress
                    .on_progress(ProgressEvent {
                        epoch: total_epochs,
                        total_epochs,
                        loss,
                        accuracy,
                    })
                    .await?;
                break;
            }

            tokio::task::yield_now().await;
        }

        // The training matrix goes out of scope here; only the weights are kept
        drop(features);
        drop(labels);

        let model_id = generate_id();
        self.models.write().insert(model_id.clone(), model);

        let metrics = ModelMetrics {
            loss: last.0,
            accuracy: last.1,
            epochs_run,
            training_rows: rows,
            training_time_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "Trained {} model {} in {} epochs: loss={:.4} accuracy={:.3}",
            problem_type.as_str(),
            model_id,
            epochs_run,
            metrics.loss,
            metrics.accuracy
        );

        Ok(TrainingResult {
            model_id,
            problem_type,
            metrics,
        })
    }

    fn predict(&self, model_id: &str, input: &HashMap<String, String>) -> Result<Prediction, EngineError> {
        let models = self.models.read();
        let model = models
            .get(model_id)
            .ok_or_else(|| EngineError::UnknownModel(model_id.to_string()))?;
        let x = model.plan.encode_map(input);
        Ok(model.predict_encoded(&x))
    }

    fn save_model(&self, model_id: &str, metadata: ModelMetadata) -> Result<ModelArtifact, EngineError> {
        let models = self.models.read();
        let model = models
            .get(model_id)
            .ok_or_else(|| EngineError::UnknownModel(model_id.to_string()))?;

        let payload = serde_json::to_value(ArtifactPayload {
            metadata,
            model: model.clone(),
        })
        .map_err(|e| EngineError::Artifact(e.to_string()))?;

        Ok(ModelArtifact {
            engine: ENGINE_NAME.to_string(),
            payload,
        })
    }

    fn load_model(&self, model_id: &str, artifact: &ModelArtifact) -> Result<(), EngineError> {
        if artifact.engine != ENGINE_NAME {
            return Err(EngineError::Artifact(format!(
                "artifact was written by engine '{}'",
                artifact.engine
            )));
        }
        let payload: ArtifactPayload = serde_json::from_value(artifact.payload.clone())
            .map_err(|e| EngineError::Artifact(e.to_string()))?;

        tracing::debug!("Loaded model {} ({})", model_id, payload.metadata.name);
        self.models.write().insert(model_id.to_string(), payload.model);
        Ok(())
    }

    fn has_model(&self, model_id: &str) -> bool {
        self.models.read().contains_key(model_id)
    }

    fn unload_model(&self, model_id: &str) -> bool {
        self.models.write().remove(model_id).is_some()
    }
}
