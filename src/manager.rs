/// Project and training-session orchestration
///
/// The `Manager` is the only writer of projects, training sessions and
/// model records. It owns the catalog (`Library`), the dataset byte store
/// (`DurableFileStore`) and a `TrainingEngine`, and turns engine failures
/// into persisted session state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::engine::{ModelMetadata, Prediction, PreparedDataset, ProgressSink, TrainingEngine};
use crate::error::{EngineError, Result, StoreError};
use crate::files::analysis::analyze_bytes;
use crate::files::{AccessPrompt, Backup, DataFormat, DurableFileStore, StorageStrategy};
use crate::state::data::{
    setting_keys, stage, FileLocation, FileRecord, ModelMetrics, ModelRecord, ProblemType, ProgressEvent,
    Project, ProjectPatch, ProjectStatus, SessionStatus, Setting, TrainingConfig, TrainingSession,
};
use crate::state::library::Library;

/// Caller-side progress observer
pub type ProgressCallback = Box<dyn FnMut(ProgressEvent) + Send>;

/// Projects with a run in flight, each with the token that cancels it
type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Holds a project's in-flight slot; released on drop
struct RunSlot {
    in_flight: InFlight,
    project_id: String,
}

impl RunSlot {
    fn acquire(in_flight: &InFlight, project_id: &str) -> Result<(Self, CancellationToken)> {
        let mut map = in_flight.lock();
        if map.contains_key(project_id) {
            return Err(StoreError::SessionAlreadyRunning(project_id.to_string()));
        }
        let token = CancellationToken::new();
        map.insert(project_id.to_string(), token.clone());

        Ok((
            Self {
                in_flight: in_flight.clone(),
                project_id: project_id.to_string(),
            },
            token,
        ))
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.project_id);
    }
}

/// Everything a run needs once its session row exists
struct PreparedRun {
    session: TrainingSession,
    prior_status: ProjectStatus,
    dataset: PreparedDataset,
    token: CancellationToken,
    slot: RunSlot,
}

/// A training run started in the background
pub struct TrainingHandle {
    pub session_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<TrainingSession>>,
}

impl TrainingHandle {
    /// Request cancellation at the next epoch boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<TrainingSession> {
        let session_id = self.session_id;
        self.join.await.map_err(|e| StoreError::TrainingFailure {
            session_id,
            message: format!("Task join error: {}", e),
        })?
    }
}

impl std::fmt::Debug for TrainingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingHandle")
            .field("session_id", &self.session_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Snapshot of the local store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub projects: usize,
    pub models: usize,
    pub active_sessions: usize,
    pub strategy: StorageStrategy,
    pub durable_supported: bool,
    pub durable_granted: bool,
    pub durable_usage_bytes: u64,
}

/// Persists every progress event before handing it to the caller
struct SessionSink {
    library: Library,
    session: TrainingSession,
    callback: ProgressCallback,
}

#[async_trait]
impl ProgressSink for SessionSink {
    async fn on_progress(&mut self, event: ProgressEvent) -> std::result::Result<(), EngineError> {
        let checkpoint = |e: StoreError| EngineError::Progress(e.to_string());

        // Never let a checkpoint move backwards
        let progress = event.percent().max(self.session.progress);
        self.session.progress = progress;
        self.session.current_epoch = Some(event.epoch);
        self.session.current_loss = Some(event.loss);
        self.session.current_accuracy = Some(event.accuracy);
        self.library.update(&self.session).await.map_err(checkpoint)?;

        let mut project: Project = self
            .library
            .require(&self.session.project_id)
            .await
            .map_err(checkpoint)?;
        project.progress = progress;
        project.updated = Utc::now();
        self.library.update(&project).await.map_err(checkpoint)?;

        (self.callback)(event);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Manager {
    library: Library,
    files: Arc<DurableFileStore>,
    engine: Arc<dyn TrainingEngine>,
    in_flight: InFlight,
    config: Arc<StoreConfig>,
}

impl Manager {
    /// Open the local store and bring it to a consistent state.
    ///
    /// Restores a persistent-area grant from an earlier run, re-tags
    /// durable files whose bytes have gone missing and fails sessions
    /// left `training` by a previous process.
    pub async fn init(
        config: StoreConfig,
        engine: Arc<dyn TrainingEngine>,
        prompt: Arc<dyn AccessPrompt>,
    ) -> Result<Self> {
        tracing::info!("🚀 Opening local store in {}", config.data_dir.display());

        let library = Library::open(config.db_path())?;
        let files = Arc::new(DurableFileStore::new(&config, prompt));

        let manager = Self {
            library,
            files,
            engine,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        };

        let granted = manager
            .get_setting(setting_keys::ACCESS_GRANTED)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if granted {
            if let Err(e) = manager.files.restore_grant().await {
                tracing::warn!("⚠️  Could not reopen persistent dataset area: {}", e);
            }
        }
        manager.record_strategy().await?;

        manager.verify_files().await?;
        manager.recover_sessions().await?;

        tracing::info!("✅ Local store ready (engine: {})", manager.engine.name());
        Ok(manager)
    }

    /// Cancel in-flight runs and release the store
    pub fn close(self) {
        let tokens: Vec<CancellationToken> = self.in_flight.lock().values().cloned().collect();
        for token in &tokens {
            token.cancel();
        }
        tracing::info!("Local store closed ({} runs cancelled)", tokens.len());
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn record_strategy(&self) -> Result<()> {
        let strategy = serde_json::to_value(self.files.strategy())?;
        self.save_setting(setting_keys::STRATEGY, strategy).await
    }

    /// Mark durable files whose bytes are gone as `error`
    async fn verify_files(&self) -> Result<usize> {
        let records: Vec<FileRecord> = self.library.get_all().await?;
        let mut missing = 0;

        for mut record in records {
            if record.location == FileLocation::DurableStore && !self.files.exists(&record) {
                tracing::warn!("⚠️  Dataset {} is missing from the persistent area", record.name);
                record.location = FileLocation::Error;
                self.library.update(&record).await?;
                missing += 1;
            }
        }

        if missing > 0 {
            tracing::info!("Re-tagged {} missing datasets", missing);
        }
        Ok(missing)
    }

    /// Fail sessions a previous process left running
    async fn recover_sessions(&self) -> Result<usize> {
        let stale: Vec<TrainingSession> = self
            .library
            .get_by_index("status", SessionStatus::Training.as_str())
            .await?;
        let count = stale.len();

        for mut session in stale {
            tracing::warn!("⚠️  Session {} was interrupted, marking failed", session.id);
            session.status = SessionStatus::Failed;
            session.error = Some("interrupted".to_string());
            session.completed_at = Some(Utc::now());
            self.library.update(&session).await?;

            let patch = ProjectPatch {
                status: Some(ProjectStatus::Failed),
                stage: Some(stage::FAILED.to_string()),
                ..Default::default()
            };
            if let Err(e) = self.update_project(&session.project_id, patch).await {
                tracing::warn!("⚠️  Could not reset project {}: {}", session.project_id, e);
            }
        }
        Ok(count)
    }

    // ========== Projects ==========

    pub async fn create_project(&self, name: &str, description: Option<String>) -> Result<Project> {
        let now = Utc::now();
        let project = Project {
            id: String::new(),
            name: name.to_string(),
            description,
            status: ProjectStatus::Created,
            stage: stage::CREATED.to_string(),
            progress: 0,
            created: now,
            updated: now,
        };
        let project = self.library.add(project).await?;
        tracing::info!("📁 Created project {} ({})", project.name, project.id);
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.library.get(id).await
    }

    pub async fn get_projects(&self) -> Result<Vec<Project>> {
        self.library.get_all().await
    }

    pub async fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project> {
        let mut project: Project = self.library.require(id).await?;
        patch.apply(&mut project);
        project.updated = Utc::now();
        self.library.update(&project).await?;
        Ok(project)
    }

    // ========== Datasets ==========

    /// Store a dataset for a project, replacing any previous one.
    ///
    /// If the catalog writes fail after the bytes were stored, the bytes
    /// and the new record are removed again and a previous dataset of the
    /// same name is put back.
    pub async fn save_dataset(
        &self,
        project_id: &str,
        bytes: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> Result<FileRecord> {
        self.library.require::<Project>(project_id).await?;
        let format = DataFormat::detect(file_name, mime_type)?;
        let analysis = analyze_bytes(bytes, format)?;
        let previous = self.get_project_files(project_id).await?;

        // Same-name durable bytes are about to be overwritten
        let overwrites = previous
            .iter()
            .any(|f| f.name == file_name && f.location == FileLocation::DurableStore);
        let backup = if overwrites {
            self.files.backup(project_id, file_name).await?
        } else {
            None
        };

        let stored = match self.files.save(project_id, file_name, bytes).await {
            Ok(stored) => stored,
            Err(e) => {
                self.restore_backup(backup).await;
                return Err(e);
            }
        };
        let location = stored.location;

        let record = FileRecord {
            id: String::new(),
            project_id: project_id.to_string(),
            name: file_name.to_string(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
            uploaded_at: Utc::now(),
            location,
            inline_content: stored.inline_content,
            analysis: Some(analysis),
        };

        let record = match self.library.add(record).await {
            Ok(record) => record,
            Err(e) => {
                self.discard_bytes(project_id, file_name, location).await;
                self.restore_backup(backup).await;
                return Err(e);
            }
        };

        let patch = ProjectPatch {
            stage: Some(stage::DATA_UPLOADED.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.update_project(project_id, patch).await {
            if let Err(cleanup) = self.library.delete::<FileRecord>(&record.id).await {
                tracing::error!("❌ Could not roll back file record {}: {}", record.id, cleanup);
            }
            self.discard_bytes(project_id, file_name, location).await;
            self.restore_backup(backup).await;
            return Err(e);
        }

        for old in previous {
            self.library.delete::<FileRecord>(&old.id).await?;
            if old.name != file_name || location != FileLocation::DurableStore {
                self.discard_bytes(project_id, &old.name, old.location).await;
            }
        }
        if let Some(backup) = backup {
            if let Err(e) = backup.release().await {
                tracing::warn!("⚠️  Could not drop previous copy of {}: {}", file_name, e);
            }
        }

        tracing::info!(
            "📄 Saved dataset {} for project {} ({} rows, {:?})",
            file_name,
            project_id,
            record.analysis.as_ref().map(|a| a.row_count).unwrap_or(0),
            location
        );
        Ok(record)
    }

    async fn discard_bytes(&self, project_id: &str, file_name: &str, location: FileLocation) {
        if location != FileLocation::DurableStore {
            return;
        }
        if let Err(e) = self.files.remove(project_id, file_name).await {
            tracing::warn!("⚠️  Could not remove {}: {}", file_name, e);
        }
    }

    async fn restore_backup(&self, backup: Option<Backup>) {
        if let Some(backup) = backup {
            if let Err(e) = backup.restore().await {
                tracing::error!("❌ Could not restore previous dataset: {}", e);
            }
        }
    }

    pub async fn get_project_files(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        self.library.get_by_index("projectId", project_id).await
    }

    /// Read a dataset's bytes back according to where they were stored
    pub async fn load_dataset(&self, file_id: &str) -> Result<Vec<u8>> {
        let record: FileRecord = self.library.require(file_id).await?;
        self.files.load(&record).await
    }

    // ========== Training ==========

    /// Run training to completion and return the terminal session.
    ///
    /// Precondition failures (`Config` for an unknown algorithm,
    /// `SessionAlreadyRunning`, `NoTrainingData`, `DatasetInvalid`) return
    /// before any session is created. Failures
    /// during the run are persisted on the session and returned as
    /// `TrainingFailure` or `Cancelled`.
    pub async fn start_training(
        &self,
        project_id: &str,
        config: TrainingConfig,
        on_progress: impl FnMut(ProgressEvent) + Send + 'static,
    ) -> Result<TrainingSession> {
        let run = self.prepare_run(project_id, &config).await?;
        self.run(run, config, Box::new(on_progress)).await
    }

    /// Start training in the background once its preconditions hold
    pub async fn spawn_training(
        &self,
        project_id: &str,
        config: TrainingConfig,
        on_progress: impl FnMut(ProgressEvent) + Send + 'static,
    ) -> Result<TrainingHandle> {
        let run = self.prepare_run(project_id, &config).await?;
        let session_id = run.session.id.clone();
        let cancel = run.token.clone();

        let manager = self.clone();
        let join = tokio::spawn(async move { manager.run(run, config, Box::new(on_progress)).await });

        Ok(TrainingHandle {
            session_id,
            cancel,
            join,
        })
    }

    /// Cancel the run in flight for a project. Returns whether there was one.
    pub fn cancel_training(&self, project_id: &str) -> bool {
        match self.in_flight.lock().get(project_id) {
            Some(token) => {
                tracing::info!("Cancelling training for project {}", project_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn prepare_run(&self, project_id: &str, config: &TrainingConfig) -> Result<PreparedRun> {
        if !self.engine.supports(&config.algorithm) {
            return Err(EngineError::UnsupportedAlgorithm(config.algorithm.clone()).into());
        }
        let (slot, token) = RunSlot::acquire(&self.in_flight, project_id)?;
        let project: Project = self.library.require(project_id).await?;

        let record = self
            .get_project_files(project_id)
            .await?
            .into_iter()
            .filter(|f| f.location.is_retrievable())
            .max_by_key(|f| f.uploaded_at)
            .ok_or_else(|| StoreError::NoTrainingData(project_id.to_string()))?;

        let bytes = self.files.load(&record).await?;
        let format = DataFormat::detect(&record.name, &record.mime_type)?;
        let dataset = self.engine.preprocess(&bytes, format, &config.target_column)?;
        drop(bytes);

        let session = TrainingSession {
            id: String::new(),
            project_id: project_id.to_string(),
            status: SessionStatus::Training,
            config: config.clone(),
            started_at: Utc::now(),
            completed_at: None,
            progress: 0,
            current_epoch: None,
            current_loss: None,
            current_accuracy: None,
            model_id: None,
            error: None,
        };
        let session = self.library.add(session).await?;

        let patch = ProjectPatch {
            status: Some(ProjectStatus::Training),
            stage: Some(stage::TRAINING.to_string()),
            progress: Some(0),
            ..Default::default()
        };
        if let Err(e) = self.update_project(project_id, patch).await {
            return Err(self.failed(session, e).await);
        }

        tracing::info!(
            "🏋️  Session {} started for project {} ({} rows, target {})",
            session.id,
            project_id,
            dataset.rows(),
            config.target_column
        );

        Ok(PreparedRun {
            session,
            prior_status: project.status,
            dataset,
            token,
            slot,
        })
    }

    async fn run(&self, run: PreparedRun, config: TrainingConfig, callback: ProgressCallback) -> Result<TrainingSession> {
        let PreparedRun {
            session,
            prior_status,
            dataset,
            token,
            slot,
        } = run;
        let problem_type = dataset.problem_type;

        let mut sink = SessionSink {
            library: self.library.clone(),
            session,
            callback,
        };
        let outcome = self.engine.train(dataset, &config, &mut sink, &token).await;
        let session = sink.session;

        let finished = match outcome {
            Err(EngineError::Cancelled) => self.cancelled(session, prior_status).await,
            Err(e) => Err(self.failed(session, e.into()).await),
            Ok(result) => {
                let model_id = result.model_id.clone();
                let registered = self
                    .register_model(&session, &config, result.model_id, problem_type, result.metrics)
                    .await;
                match registered {
                    Ok(model) => match self.complete(session.clone(), model).await {
                        Ok(done) => Ok(done),
                        Err(e) => Err(self.failed(session, e).await),
                    },
                    Err(e) => {
                        // The model never made it into the catalog
                        self.engine.unload_model(&model_id);
                        Err(self.failed(session, e).await)
                    }
                }
            }
        };
        drop(slot);
        finished
    }

    async fn register_model(
        &self,
        session: &TrainingSession,
        config: &TrainingConfig,
        model_id: String,
        problem_type: ProblemType,
        metrics: ModelMetrics,
    ) -> Result<ModelRecord> {
        let project: Project = self.library.require(&session.project_id).await?;
        let name = config
            .model_name
            .clone()
            .unwrap_or_else(|| format!("{} {}", project.name, problem_type.as_str()));

        let artifact = self.engine.save_model(
            &model_id,
            ModelMetadata {
                name: name.clone(),
                project_id: project.id.clone(),
            },
        )?;

        let model = ModelRecord {
            id: model_id,
            project_id: project.id,
            name,
            model_type: problem_type,
            metrics,
            config: config.clone(),
            created_at: Utc::now(),
            artifact: Some(artifact),
        };
        self.library.add(model).await
    }

    async fn complete(&self, mut session: TrainingSession, model: ModelRecord) -> Result<TrainingSession> {
        session.status = SessionStatus::Completed;
        session.progress = 100;
        session.completed_at = Some(Utc::now());
        session.model_id = Some(model.id.clone());
        self.library.update(&session).await?;

        let patch = ProjectPatch {
            status: Some(ProjectStatus::Deployed),
            stage: Some(stage::COMPLETED.to_string()),
            progress: Some(100),
            ..Default::default()
        };
        self.update_project(&session.project_id, patch).await?;

        tracing::info!(
            "✅ Session {} completed: model {} accuracy={:.3}",
            session.id,
            model.id,
            model.metrics.accuracy
        );
        Ok(session)
    }

    async fn cancelled(&self, mut session: TrainingSession, prior_status: ProjectStatus) -> Result<TrainingSession> {
        session.status = SessionStatus::Cancelled;
        session.completed_at = Some(Utc::now());
        self.library.update(&session).await?;

        let patch = ProjectPatch {
            status: Some(prior_status),
            stage: Some(stage::CANCELLED.to_string()),
            ..Default::default()
        };
        self.update_project(&session.project_id, patch).await?;

        tracing::info!("Session {} cancelled", session.id);
        Err(StoreError::Cancelled(session.id))
    }

    /// Persist a failed run and return the error to report
    async fn failed(&self, mut session: TrainingSession, error: StoreError) -> StoreError {
        let message = match error {
            StoreError::TrainingFailure { message, .. } => message,
            other => other.to_string(),
        };
        tracing::error!("❌ Session {} failed: {}", session.id, message);

        session.status = SessionStatus::Failed;
        session.completed_at = Some(Utc::now());
        session.error = Some(message.clone());
        if let Err(e) = self.library.update(&session).await {
            tracing::error!("❌ Could not record failure of session {}: {}", session.id, e);
        }

        let patch = ProjectPatch {
            status: Some(ProjectStatus::Failed),
            stage: Some(stage::FAILED.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.update_project(&session.project_id, patch).await {
            tracing::error!("❌ Could not mark project {} failed: {}", session.project_id, e);
        }

        StoreError::TrainingFailure {
            session_id: session.id,
            message,
        }
    }

    pub async fn get_training_session(&self, id: &str) -> Result<Option<TrainingSession>> {
        self.library.get(id).await
    }

    pub async fn get_project_sessions(&self, project_id: &str) -> Result<Vec<TrainingSession>> {
        self.library.get_by_index("projectId", project_id).await
    }

    // ========== Models ==========

    pub async fn get_project_models(&self, project_id: &str) -> Result<Vec<ModelRecord>> {
        self.library.get_by_index("projectId", project_id).await
    }

    pub async fn get_model(&self, id: &str) -> Result<Option<ModelRecord>> {
        self.library.get(id).await
    }

    /// Predict one row, loading the model from its saved artifact if the
    /// engine does not hold it
    pub async fn predict(&self, model_id: &str, row: &HashMap<String, String>) -> Result<Prediction> {
        if !self.engine.has_model(model_id) {
            let model: ModelRecord = self.library.require(model_id).await?;
            let artifact = model.artifact.ok_or_else(|| StoreError::NotRetrievable {
                file: model_id.to_string(),
                reason: "model has no saved artifact".to_string(),
            })?;
            self.engine.load_model(model_id, &artifact)?;
        }
        Ok(self.engine.predict(model_id, row)?)
    }

    // ========== Settings ==========

    pub async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.library.get::<Setting>(key).await?.map(|s| s.value))
    }

    pub async fn save_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let setting = Setting {
            key: key.to_string(),
            value,
        };
        self.library.put(&setting).await
    }

    // ========== Storage ==========

    /// Prompt for the persistent dataset area and remember the answer
    pub async fn request_storage_access(&self) -> Result<bool> {
        let granted = self.files.request_access().await?;
        self.save_setting(setting_keys::ACCESS_GRANTED, serde_json::Value::Bool(granted))
            .await?;
        self.record_strategy().await?;
        Ok(granted)
    }

    pub async fn storage_status(&self) -> Result<StorageStatus> {
        // Read before any await so the guard is not held across one
        let active_sessions = self.in_flight.lock().len();
        Ok(StorageStatus {
            projects: self.library.count::<Project>().await?,
            models: self.library.count::<ModelRecord>().await?,
            active_sessions,
            strategy: self.files.strategy(),
            durable_supported: self.files.is_supported(),
            durable_granted: self.files.is_granted(),
            durable_usage_bytes: self.files.usage().await?,
        })
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("library", &self.library)
            .field("files", &self.files)
            .field("engine", &self.engine.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LinearEngine;
    use crate::files::{AutoGrant, DenyAccess};
    use tempfile::TempDir;

    const DEMO_CSV: &str = "a,b,target\n1,0.5,yes\n2,1.5,no\n3,0.7,yes\n4,1.9,no\n";

    async fn manager_in(dir: &TempDir) -> Manager {
        Manager::init(
            StoreConfig::in_dir(dir.path()),
            Arc::new(LinearEngine::new()),
            Arc::new(AutoGrant),
        )
        .await
        .unwrap()
    }

    async fn demo_project(manager: &Manager) -> Project {
        let project = manager.create_project("Demo", None).await.unwrap();
        manager
            .save_dataset(&project.id, DEMO_CSV.as_bytes(), "demo.csv", "text/csv")
            .await
            .unwrap();
        project
    }

    fn quick(target: &str, epochs: u32) -> TrainingConfig {
        TrainingConfig {
            epochs,
            early_stopping_patience: 0,
            ..TrainingConfig::new(target)
        }
    }

    #[tokio::test]
    async fn test_demo_scenario_deploys_classifier() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = demo_project(&manager).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        let session = manager
            .start_training(&project.id, quick("target", 20), move |e| seen.lock().push(e))
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress, 100);
        let events = events.lock();
        assert!(events.iter().any(|e| e.epoch == e.total_epochs));

        let model = manager
            .get_model(session.model_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(model.model_type, ProblemType::Classification);
        assert_eq!(manager.get_project_models(&project.id).await.unwrap().len(), 1);

        let project = manager.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Deployed);
        assert_eq!(project.progress, 100);
        assert_eq!(project.stage, stage::COMPLETED);
    }

    #[tokio::test]
    async fn test_header_only_dataset_leaves_project_unchanged() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = manager.create_project("Empty", None).await.unwrap();
        let file = manager
            .save_dataset(&project.id, b"a,b,target\n", "empty.csv", "text/csv")
            .await
            .unwrap();
        assert_eq!(file.analysis.as_ref().unwrap().row_count, 0);
        let before = manager.get_project(&project.id).await.unwrap().unwrap();

        let err = manager
            .start_training(&project.id, quick("target", 5), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DatasetInvalid(_)));

        let after = manager.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(after.status, before.status);
        assert!(manager.get_project_sessions(&project.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_training_data_creates_no_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = manager.create_project("Bare", None).await.unwrap();

        let err = manager
            .start_training(&project.id, quick("target", 5), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoTrainingData(_)));
        assert!(manager.get_project_sessions(&project.id).await.unwrap().is_empty());
        assert_eq!(manager.storage_status().await.unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_persisted_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = demo_project(&manager).await;

        let handle = manager
            .spawn_training(&project.id, quick("target", 30), |_| {})
            .await
            .unwrap();
        let session_id = handle.session_id.clone();

        let mut observed = Vec::new();
        loop {
            let session = manager.get_training_session(&session_id).await.unwrap().unwrap();
            observed.push(session.progress);
            if session.status.is_terminal() {
                break;
            }
            tokio::task::yield_now().await;
        }
        handle.wait().await.unwrap();

        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(observed.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_second_run_rejected_then_cancel_restores_project() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = demo_project(&manager).await;

        let handle = manager
            .spawn_training(&project.id, quick("target", 10_000), |_| {})
            .await
            .unwrap();

        let err = manager
            .start_training(&project.id, quick("target", 5), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionAlreadyRunning(_)));

        assert!(manager.cancel_training(&project.id));
        let session_id = handle.session_id.clone();
        assert!(matches!(handle.wait().await, Err(StoreError::Cancelled(_))));

        let session = manager.get_training_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        let project = manager.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Created);
        assert_eq!(project.stage, stage::CANCELLED);
        assert!(!manager.cancel_training(&project.id));
    }

    #[tokio::test]
    async fn test_predict_reloads_model_after_restart() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = demo_project(&manager).await;
        let session = manager
            .start_training(&project.id, quick("target", 50), |_| {})
            .await
            .unwrap();
        let model_id = session.model_id.unwrap();
        manager.close();

        let reopened = manager_in(&dir).await;
        let row: HashMap<String, String> =
            [("a".to_string(), "2".to_string()), ("b".to_string(), "1.8".to_string())].into_iter().collect();
        let prediction = reopened.predict(&model_id, &row).await.unwrap();
        let label = prediction.label.unwrap();
        assert!(label == "yes" || label == "no");
    }

    #[tokio::test]
    async fn test_user_download_is_not_retrievable() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            durable_enabled: false,
            inline_limit_bytes: 8,
            ..StoreConfig::in_dir(dir.path())
        };
        let manager = Manager::init(config, Arc::new(LinearEngine::new()), Arc::new(DenyAccess))
            .await
            .unwrap();
        let project = manager.create_project("Big", None).await.unwrap();

        let file = manager
            .save_dataset(&project.id, DEMO_CSV.as_bytes(), "demo.csv", "text/csv")
            .await
            .unwrap();
        assert_eq!(file.location, FileLocation::UserDownload);
        assert!(dir.path().join("downloads").join("demo.csv").is_file());

        let err = manager.load_dataset(&file.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotRetrievable { .. }));

        let err = manager
            .start_training(&project.id, quick("target", 5), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoTrainingData(_)));

        assert!(matches!(
            manager.request_storage_access().await,
            Err(StoreError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_granted_area_holds_single_dataset() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        assert!(manager.request_storage_access().await.unwrap());

        let project = manager.create_project("Files", Some("two uploads".into())).await.unwrap();
        let first = manager
            .save_dataset(&project.id, DEMO_CSV.as_bytes(), "first.csv", "text/csv")
            .await
            .unwrap();
        assert_eq!(first.location, FileLocation::DurableStore);
        let second = manager
            .save_dataset(&project.id, DEMO_CSV.as_bytes(), "second.csv", "text/csv")
            .await
            .unwrap();

        let files = manager.get_project_files(&project.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, second.id);
        assert_eq!(manager.load_dataset(&second.id).await.unwrap(), DEMO_CSV.as_bytes());

        let area = dir.path().join("datasets").join(&project.id);
        assert!(!area.join("first.csv").exists());
        assert!(area.join("second.csv").is_file());

        let status = manager.storage_status().await.unwrap();
        assert_eq!(status.strategy, StorageStrategy::PersistentArea);
        assert_eq!(status.durable_usage_bytes, DEMO_CSV.len() as u64);
        manager.close();

        // The grant survives a restart without prompting
        let reopened = Manager::init(
            StoreConfig::in_dir(dir.path()),
            Arc::new(LinearEngine::new()),
            Arc::new(DenyAccess),
        )
        .await
        .unwrap();
        assert!(reopened.storage_status().await.unwrap().durable_granted);
    }

    #[tokio::test]
    async fn test_missing_durable_bytes_are_retagged() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        manager.request_storage_access().await.unwrap();
        let project = demo_project(&manager).await;
        manager.close();

        std::fs::remove_file(dir.path().join("datasets").join(&project.id).join("demo.csv")).unwrap();

        let reopened = manager_in(&dir).await;
        let files = reopened.get_project_files(&project.id).await.unwrap();
        assert_eq!(files[0].location, FileLocation::Error);
    }

    #[tokio::test]
    async fn test_interrupted_session_marked_failed_on_init() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = demo_project(&manager).await;
        let session = TrainingSession {
            id: String::new(),
            project_id: project.id.clone(),
            status: SessionStatus::Training,
            config: TrainingConfig::new("target"),
            started_at: Utc::now(),
            completed_at: None,
            progress: 40,
            current_epoch: Some(4),
            current_loss: None,
            current_accuracy: None,
            model_id: None,
            error: None,
        };
        let session = manager.library.add(session).await.unwrap();
        manager.close();

        let reopened = manager_in(&dir).await;
        let session = reopened.get_training_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error.as_deref(), Some("interrupted"));
        let project = reopened.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn test_storage_status_while_run_finishes() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        manager.request_storage_access().await.unwrap();
        let project = demo_project(&manager).await;

        let handle = manager
            .spawn_training(&project.id, quick("target", 1), |_| {})
            .await
            .unwrap();
        let status = manager.storage_status().await.unwrap();
        assert_eq!(status.active_sessions, 1);
        assert_eq!(status.projects, 1);
        handle.wait().await.unwrap();

        let status = manager.storage_status().await.unwrap();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.models, 1);
    }

    #[tokio::test]
    async fn test_failed_resave_keeps_previous_dataset() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        manager.request_storage_access().await.unwrap();
        let project = demo_project(&manager).await;
        let original = manager.get_project_files(&project.id).await.unwrap().remove(0);
        assert_eq!(original.location, FileLocation::DurableStore);

        manager
            .library
            .execute_batch("CREATE TRIGGER block_files BEFORE INSERT ON files BEGIN SELECT RAISE(ABORT, 'blocked'); END;")
            .await
            .unwrap();
        let replacement = "a,b,target\n9,9.5,no\n8,8.5,yes\n";
        assert!(manager
            .save_dataset(&project.id, replacement.as_bytes(), "demo.csv", "text/csv")
            .await
            .is_err());

        let files = manager.get_project_files(&project.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, original.id);
        assert_eq!(manager.load_dataset(&original.id).await.unwrap(), DEMO_CSV.as_bytes());
        let area = dir.path().join("datasets").join(&project.id);
        assert!(!area.join(".demo.csv.backup").exists());

        manager.library.execute_batch("DROP TRIGGER block_files;").await.unwrap();
        let session = manager
            .start_training(&project.id, quick("target", 5), |_| {})
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        // A successful re-save replaces the bytes and leaves no copy behind
        let record = manager
            .save_dataset(&project.id, replacement.as_bytes(), "demo.csv", "text/csv")
            .await
            .unwrap();
        assert_eq!(manager.load_dataset(&record.id).await.unwrap(), replacement.as_bytes());
        assert!(!area.join(".demo.csv.backup").exists());
    }

    #[tokio::test]
    async fn test_divergence_fails_session_and_project() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = manager.create_project("Diverge", None).await.unwrap();
        let mut csv = String::from("x,y\n");
        for i in 0..20 {
            csv.push_str(&format!("{},{}\n", i, 3 * i + 1));
        }
        manager
            .save_dataset(&project.id, csv.as_bytes(), "line.csv", "text/csv")
            .await
            .unwrap();

        let config = TrainingConfig {
            learning_rate: 1e200,
            ..quick("y", 50)
        };
        let err = manager.start_training(&project.id, config, |_| {}).await.unwrap_err();
        let session_id = match err {
            StoreError::TrainingFailure { session_id, message } => {
                assert!(message.contains("diverged"));
                session_id
            }
            other => panic!("unexpected error: {}", other),
        };

        let session = manager.get_training_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.unwrap().contains("diverged"));
        assert!(session.completed_at.is_some());
        let project = manager.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(project.stage, stage::FAILED);
        assert_eq!(manager.storage_status().await.unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_unknown_algorithm_creates_no_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = demo_project(&manager).await;

        let config = TrainingConfig {
            algorithm: "forest".into(),
            ..quick("target", 5)
        };
        let err = manager.start_training(&project.id, config, |_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(ref m) if m.contains("forest")));
        assert!(manager.get_project_sessions(&project.id).await.unwrap().is_empty());
        let project = manager.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Created);
    }

    #[tokio::test]
    async fn test_unregistered_model_is_unloaded() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(LinearEngine::new());
        let manager = Manager::init(StoreConfig::in_dir(dir.path()), engine.clone(), Arc::new(AutoGrant))
            .await
            .unwrap();
        let project = demo_project(&manager).await;
        manager
            .library
            .execute_batch("CREATE TRIGGER block_models BEFORE INSERT ON models BEGIN SELECT RAISE(ABORT, 'blocked'); END;")
            .await
            .unwrap();

        let err = manager
            .start_training(&project.id, quick("target", 5), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TrainingFailure { .. }));
        assert_eq!(engine.loaded_models(), 0);
        assert!(manager.get_project_models(&project.id).await.unwrap().is_empty());
        let project = manager.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;

        assert_eq!(manager.get_setting("theme").await.unwrap(), None);
        manager.save_setting("theme", serde_json::json!("dark")).await.unwrap();
        manager.save_setting("theme", serde_json::json!("light")).await.unwrap();
        assert_eq!(manager.get_setting("theme").await.unwrap(), Some(serde_json::json!("light")));
        assert_eq!(
            manager.get_setting(setting_keys::STRATEGY).await.unwrap(),
            Some(serde_json::json!("inline_blob"))
        );
    }

    #[tokio::test]
    async fn test_unsupported_upload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let project = manager.create_project("Pics", None).await.unwrap();

        let err = manager
            .save_dataset(&project.id, b"\x89PNG", "photo.png", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedFormat(_)));
        assert!(manager.get_project_files(&project.id).await.unwrap().is_empty());
    }
}
