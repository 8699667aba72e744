/// Shared data structures for the local store
///
/// These structs represent the data model that flows between
/// the catalog database and the manager. Every record is stored
/// as a JSON body in its collection table.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The named collections of the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Projects,
    Files,
    Models,
    Training,
    Settings,
}

/// Declaration of a collection: table name, key field and secondary indices.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub key: &'static str,
    pub indices: &'static [&'static str],
    /// Whether rows carry a binary payload beside the JSON body
    pub blob: bool,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Projects,
        Collection::Files,
        Collection::Models,
        Collection::Training,
        Collection::Settings,
    ];

    pub fn spec(self) -> CollectionSpec {
        match self {
            Collection::Projects => CollectionSpec {
                name: "projects",
                key: "id",
                indices: &["status"],
                blob: false,
            },
            Collection::Files => CollectionSpec {
                name: "files",
                key: "id",
                indices: &["projectId"],
                blob: true,
            },
            Collection::Models => CollectionSpec {
                name: "models",
                key: "id",
                indices: &["projectId"],
                blob: false,
            },
            Collection::Training => CollectionSpec {
                name: "training",
                key: "id",
                indices: &["projectId", "status"],
                blob: false,
            },
            Collection::Settings => CollectionSpec {
                name: "settings",
                key: "key",
                indices: &[],
                blob: false,
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

/// A value that lives in one of the collections.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    /// Value of a declared secondary index, `None` when the record has no value for it
    fn index_value(&self, _index: &str) -> Option<String> {
        None
    }

    /// Binary payload stored outside the JSON body
    fn blob(&self) -> Option<&[u8]> {
        None
    }

    fn attach_blob(&mut self, _bytes: Vec<u8>) {}
}

// ========== Projects ==========

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Training,
    Deployed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Training => "training",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
        }
    }
}

/// Project stage labels written by the manager
pub mod stage {
    pub const CREATED: &str = "created";
    pub const DATA_UPLOADED: &str = "data_uploaded";
    pub const TRAINING: &str = "training";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ProjectStatus,
    pub stage: String,
    /// 0 to 100
    pub progress: u8,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Record for Project {
    const COLLECTION: Collection = Collection::Projects;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "status" => Some(self.status.as_str().to_string()),
            _ => None,
        }
    }
}

/// Partial update applied by `Manager::update_project`
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub stage: Option<String>,
    pub progress: Option<u8>,
}

impl ProjectPatch {
    pub fn apply(self, project: &mut Project) {
        if let Some(name) = self.name {
            project.name = name;
        }
        if let Some(description) = self.description {
            project.description = Some(description);
        }
        if let Some(status) = self.status {
            project.status = status;
        }
        if let Some(stage) = self.stage {
            project.stage = stage;
        }
        if let Some(progress) = self.progress {
            project.progress = progress.min(100);
        }
    }
}

// ========== Files ==========

/// Where the bytes of a dataset live, and so how they must be fetched again
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileLocation {
    DurableStore,
    InlineBlob,
    UserDownload,
    Error,
}

impl FileLocation {
    pub fn is_retrievable(self) -> bool {
        matches!(self, Self::DurableStore | Self::InlineBlob)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub unique_count: usize,
    pub null_count: usize,
    pub sample_values: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAnalysis {
    pub headers: Vec<String>,
    pub row_count: usize,
    pub columns: Vec<ColumnSummary>,
}

impl DatasetAnalysis {
    pub fn column(&self, name: &str) -> Option<&ColumnSummary> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub location: FileLocation,
    /// Held in the blob column, never in the JSON body
    #[serde(skip)]
    pub inline_content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<DatasetAnalysis>,
}

impl Record for FileRecord {
    const COLLECTION: Collection = Collection::Files;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "projectId" => Some(self.project_id.clone()),
            _ => None,
        }
    }

    fn blob(&self) -> Option<&[u8]> {
        self.inline_content.as_deref()
    }

    fn attach_blob(&mut self, bytes: Vec<u8>) {
        self.inline_content = Some(bytes);
    }
}

// ========== Training ==========

/// Parameters of one training run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingConfig {
    pub target_column: String,
    pub algorithm: String,
    pub epochs: u32,
    pub learning_rate: f64,
    /// Epochs without improvement before stopping early, 0 disables
    pub early_stopping_patience: u32,
    pub min_delta: f64,
    pub model_name: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            target_column: "target".to_string(),
            algorithm: "linear".to_string(),
            epochs: 50,
            learning_rate: 0.1,
            early_stopping_patience: 10,
            min_delta: 1e-4,
            model_name: None,
        }
    }
}

impl TrainingConfig {
    pub fn new(target_column: impl Into<String>) -> Self {
        Self {
            target_column: target_column.into(),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Training,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Training)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSession {
    pub id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub config: TrainingConfig,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_epoch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Record for TrainingSession {
    const COLLECTION: Collection = Collection::Training;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "projectId" => Some(self.project_id.clone()),
            "status" => Some(self.status.as_str().to_string()),
            _ => None,
        }
    }
}

/// One `{epoch, totalEpochs, loss, accuracy}` tuple emitted during fitting
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub epoch: u32,
    pub total_epochs: u32,
    pub loss: f64,
    pub accuracy: f64,
}

impl ProgressEvent {
    /// Percentage of the run completed, 0 to 100
    pub fn percent(&self) -> u8 {
        if self.total_epochs == 0 {
            return 100;
        }
        let pct = (self.epoch.min(self.total_epochs) as u64 * 100) / self.total_epochs as u64;
        pct as u8
    }
}

// ========== Models ==========

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    Classification,
    Regression,
}

impl ProblemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Regression => "regression",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetrics {
    pub loss: f64,
    /// Classification accuracy, or R² clamped to [0, 1] for regression
    pub accuracy: f64,
    pub epochs_run: u32,
    pub training_rows: usize,
    pub training_time_ms: u64,
}

/// Engine-specific serialized model, opaque to the store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    pub engine: String,
    pub payload: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ProblemType,
    pub metrics: ModelMetrics,
    pub config: TrainingConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ModelArtifact>,
}

impl Record for ModelRecord {
    const COLLECTION: Collection = Collection::Models;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "projectId" => Some(self.project_id.clone()),
            _ => None,
        }
    }
}

// ========== Settings ==========

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
}

impl Record for Setting {
    const COLLECTION: Collection = Collection::Settings;

    fn id(&self) -> &str {
        &self.key
    }

    fn set_id(&mut self, id: String) {
        self.key = id;
    }
}

/// Setting keys written by the store itself
pub mod setting_keys {
    pub const ACCESS_GRANTED: &str = "storage.access_granted";
    pub const STRATEGY: &str = "storage.strategy";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_serializes_kebab_case() {
        let json = serde_json::to_string(&FileLocation::DurableStore).unwrap();
        assert_eq!(json, "\"durable-store\"");
        let back: FileLocation = serde_json::from_str("\"user-download\"").unwrap();
        assert_eq!(back, FileLocation::UserDownload);
        assert!(!back.is_retrievable());
    }

    #[test]
    fn test_inline_content_stays_out_of_body() {
        let record = FileRecord {
            id: "f1".into(),
            project_id: "p1".into(),
            name: "data.csv".into(),
            size: 3,
            mime_type: "text/csv".into(),
            uploaded_at: Utc::now(),
            location: FileLocation::InlineBlob,
            inline_content: Some(vec![1, 2, 3]),
            analysis: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("inlineContent").is_none());
        assert_eq!(json["projectId"], "p1");
        assert_eq!(record.blob(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_progress_percent() {
        let event = ProgressEvent { epoch: 5, total_epochs: 20, loss: 0.3, accuracy: 0.8 };
        assert_eq!(event.percent(), 25);
        let last = ProgressEvent { epoch: 20, ..event };
        assert_eq!(last.percent(), 100);
    }

    #[test]
    fn test_patch_clamps_progress() {
        let now = Utc::now();
        let mut project = Project {
            id: "p".into(),
            name: "Demo".into(),
            description: None,
            status: ProjectStatus::Created,
            stage: stage::CREATED.into(),
            progress: 0,
            created: now,
            updated: now,
        };
        ProjectPatch { progress: Some(140), name: Some("Renamed".into()), ..Default::default() }
            .apply(&mut project);
        assert_eq!(project.progress, 100);
        assert_eq!(project.name, "Renamed");
    }
}
