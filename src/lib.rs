/// Local project, dataset and training-session store
///
/// - `state` - catalog database and record types
/// - `files` - dataset byte storage and tabular analysis
/// - `engine` - training engine contract and the built-in linear engine
/// - `manager` - the orchestrator tying the three together

pub mod config;
pub mod engine;
pub mod error;
pub mod files;
pub mod manager;
pub mod state;

pub use config::StoreConfig;
pub use engine::{LinearEngine, Prediction, TrainingEngine};
pub use error::{EngineError, Result, StoreError};
pub use files::{AccessPrompt, AutoGrant, DenyAccess, StorageStrategy};
pub use manager::{Manager, StorageStatus, TrainingHandle};
pub use state::data::{
    FileLocation, FileRecord, ModelRecord, ProgressEvent, Project, ProjectPatch, ProjectStatus,
    SessionStatus, TrainingConfig, TrainingSession,
};
