/// Training engine adapter
///
/// The manager talks to numeric training through `TrainingEngine`:
/// preprocess raw tabular bytes, run an iterative fit that reports every
/// epoch to a `ProgressSink`, predict with a trained model, and move models
/// in and out as serialized artifacts. Engines own no durability.
///
/// - `preprocess.rs` - dataset validation, problem type inference, feature encoding
/// - `linear.rs` - built-in gradient-descent engine (softmax / linear regression)

pub mod linear;
pub mod preprocess;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::files::DataFormat;
use crate::state::data::{ModelArtifact, ModelMetrics, ProblemType, ProgressEvent, TrainingConfig};

pub use linear::LinearEngine;
pub use preprocess::{EncodingPlan, FeatureEncoding, PreparedDataset};

/// Receives progress events in order. The engine awaits each call before
/// starting the next epoch.
#[async_trait]
pub trait ProgressSink: Send {
    async fn on_progress(&mut self, event: ProgressEvent) -> Result<(), EngineError>;
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct VecSink(pub Vec<ProgressEvent>);

#[async_trait]
impl ProgressSink for VecSink {
    async fn on_progress(&mut self, event: ProgressEvent) -> Result<(), EngineError> {
        self.0.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingResult {
    pub model_id: String,
    pub problem_type: ProblemType,
    pub metrics: ModelMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    /// Class index for classification, predicted value for regression
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Descriptive data stored alongside a saved model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub name: String,
    pub project_id: String,
}

#[async_trait]
pub trait TrainingEngine: Send + Sync {
    /// Engine identifier recorded in saved artifacts
    fn name(&self) -> &'static str;

    /// Whether `TrainingConfig::algorithm` names something this engine runs
    fn supports(&self, algorithm: &str) -> bool {
        algorithm == self.name()
    }

    /// Validate and encode a raw dataset. Fails with `DatasetInvalid`
    /// before any training state is allocated.
    fn preprocess(
        &self,
        raw: &[u8],
        format: DataFormat,
        target_column: &str,
    ) -> Result<PreparedDataset, EngineError>;

    /// Fit a model, reporting each epoch to `progress`. Epoch numbers are
    /// strictly increasing and the last event always has
    /// `epoch == total_epochs`, even when stopping early.
    async fn train(
        &self,
        dataset: PreparedDataset,
        config: &TrainingConfig,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TrainingResult, EngineError>;

    /// Predict one row given as column name to raw cell value
    fn predict(&self, model_id: &str, input: &HashMap<String, String>) -> Result<Prediction, EngineError>;

    fn save_model(&self, model_id: &str, metadata: ModelMetadata) -> Result<ModelArtifact, EngineError>;

    fn load_model(&self, model_id: &str, artifact: &ModelArtifact) -> Result<(), EngineError>;

    fn has_model(&self, model_id: &str) -> bool;

    /// Forget an in-memory model. Returns whether it was loaded.
    fn unload_model(&self, model_id: &str) -> bool;
}
