/// Durable storage for uploaded dataset bytes
///
/// Three strategies, each behind `FileBackend`:
/// - `PersistentArea`: a user-granted directory, one sub-directory per project
/// - `InlineBlob`: bytes kept in the catalog row itself (small files only)
/// - `EphemeralDownload`: a one-shot export into the user's download folder,
///   never read back
///
/// `DurableFileStore` picks between them. The persistent area is used once
/// access has been granted through `request_access`, the only call that may
/// prompt the user.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use walkdir::WalkDir;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::state::data::{FileLocation, FileRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    PersistentArea,
    InlineBlob,
    EphemeralDownload,
}

/// Where a save put the bytes
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub location: FileLocation,
    /// Present only for `inline-blob`
    pub inline_content: Option<Vec<u8>>,
    /// Present for `durable-store` and `user-download`
    pub path: Option<PathBuf>,
}

#[async_trait]
pub trait FileBackend: Send + Sync {
    fn strategy(&self) -> StorageStrategy;

    async fn save(&self, project_id: &str, file_name: &str, bytes: &[u8]) -> Result<StoredFile>;

    async fn load(&self, record: &FileRecord) -> Result<Vec<u8>>;
}

/// Asks the user whether the persistent area may be used
pub trait AccessPrompt: Send + Sync {
    fn confirm(&self, area: &Path) -> bool;
}

/// Grants every request without asking
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoGrant;

impl AccessPrompt for AutoGrant {
    fn confirm(&self, _area: &Path) -> bool {
        true
    }
}

/// Refuses every request
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAccess;

impl AccessPrompt for DenyAccess {
    fn confirm(&self, _area: &Path) -> bool {
        false
    }
}

/// Strip directories and reject names that would escape the project folder
fn sanitize_name(name: &str) -> Result<String> {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if base.is_empty() || base == "." || base == ".." {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid file name: {:?}", name),
        )));
    }
    Ok(base)
}

// ========== Persistent area ==========

#[derive(Debug, Clone)]
pub struct PersistentArea {
    root: PathBuf,
}

impl PersistentArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, project_id: &str, file_name: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(sanitize_name(project_id)?)
            .join(sanitize_name(file_name)?))
    }

    pub async fn remove(&self, project_id: &str, file_name: &str) -> Result<()> {
        let path = self.file_path(project_id, file_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from_io(e)),
        }
    }

    pub fn exists(&self, project_id: &str, file_name: &str) -> bool {
        self.file_path(project_id, file_name)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Move an existing file aside so a replacement can be rolled back.
    /// Returns `None` when there is nothing to keep.
    pub async fn backup(&self, project_id: &str, file_name: &str) -> Result<Option<Backup>> {
        let target = self.file_path(project_id, file_name)?;
        let saved = target.with_file_name(format!(".{}.backup", sanitize_name(file_name)?));
        match fs::rename(&target, &saved).await {
            Ok(()) => Ok(Some(Backup { target, saved })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::from_io(e)),
        }
    }

    /// Total bytes held in the area
    pub async fn usage(&self) -> Result<u64> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum::<u64>()
        })
        .await
        .map_err(|e| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Task join error: {}", e),
            ))
        })
    }
}

/// Previous bytes of a file, set aside while its replacement is committed
#[derive(Debug)]
pub struct Backup {
    target: PathBuf,
    saved: PathBuf,
}

impl Backup {
    /// Put the previous bytes back, replacing whatever is at the target now
    pub async fn restore(self) -> Result<()> {
        fs::rename(&self.saved, &self.target).await.map_err(StoreError::from_io)?;
        tracing::info!("Restored previous {}", self.target.display());
        Ok(())
    }

    /// Drop the previous bytes once the replacement is final
    pub async fn release(self) -> Result<()> {
        match fs::remove_file(&self.saved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from_io(e)),
        }
    }
}

#[async_trait]
impl FileBackend for PersistentArea {
    fn strategy(&self) -> StorageStrategy {
        StorageStrategy::PersistentArea
    }

    async fn save(&self, project_id: &str, file_name: &str, bytes: &[u8]) -> Result<StoredFile> {
        let path = self.file_path(project_id, file_name)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(StoreError::from_io)?;
        }

        // Write beside the target then rename, so a reader never sees half a file
        let partial = path.with_file_name(format!(".{}.partial", sanitize_name(file_name)?));
        fs::write(&partial, bytes).await.map_err(StoreError::from_io)?;
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(StoreError::from_io(e));
        }

        tracing::info!("💾 Saved {} ({} bytes) to {}", file_name, bytes.len(), path.display());
        Ok(StoredFile {
            location: FileLocation::DurableStore,
            inline_content: None,
            path: Some(path),
        })
    }

    async fn load(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let path = self.file_path(&record.project_id, &record.name)?;
        fs::read(&path).await.map_err(StoreError::from_io)
    }
}

// ========== Inline blob ==========

#[derive(Debug, Clone, Copy)]
pub struct InlineBlob {
    limit: u64,
}

impl InlineBlob {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }

    pub fn accepts(&self, size: u64) -> bool {
        size < self.limit
    }
}

#[async_trait]
impl FileBackend for InlineBlob {
    fn strategy(&self) -> StorageStrategy {
        StorageStrategy::InlineBlob
    }

    async fn save(&self, _project_id: &str, file_name: &str, bytes: &[u8]) -> Result<StoredFile> {
        tracing::debug!("Keeping {} ({} bytes) inline", file_name, bytes.len());
        Ok(StoredFile {
            location: FileLocation::InlineBlob,
            inline_content: Some(bytes.to_vec()),
            path: None,
        })
    }

    async fn load(&self, record: &FileRecord) -> Result<Vec<u8>> {
        record
            .inline_content
            .clone()
            .ok_or_else(|| StoreError::NotRetrievable {
                file: record.name.clone(),
                reason: "inline content missing from record".to_string(),
            })
    }
}

// ========== Ephemeral download ==========

#[derive(Debug, Clone)]
pub struct EphemeralDownload {
    dir: PathBuf,
}

impl EphemeralDownload {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// First free name in the download folder: `data.csv`, `data (1).csv`, ...
    async fn free_path(&self, file_name: &str) -> Result<PathBuf> {
        let name = sanitize_name(file_name)?;
        let candidate = self.dir.join(&name);
        if fs::metadata(&candidate).await.is_err() {
            return Ok(candidate);
        }

        let path = Path::new(&name);
        let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();

        let mut n = 1u32;
        loop {
            let candidate = self.dir.join(format!("{} ({}){}", stem, n, ext));
            if fs::metadata(&candidate).await.is_err() {
                return Ok(candidate);
            }
            n += 1;
        }
    }
}

#[async_trait]
impl FileBackend for EphemeralDownload {
    fn strategy(&self) -> StorageStrategy {
        StorageStrategy::EphemeralDownload
    }

    async fn save(&self, _project_id: &str, file_name: &str, bytes: &[u8]) -> Result<StoredFile> {
        fs::create_dir_all(&self.dir).await.map_err(StoreError::from_io)?;
        let path = self.free_path(file_name).await?;
        fs::write(&path, bytes).await.map_err(StoreError::from_io)?;

        tracing::warn!(
            "📤 {} exported to {}; it cannot be reloaded by the app",
            file_name,
            path.display()
        );
        Ok(StoredFile {
            location: FileLocation::UserDownload,
            inline_content: None,
            path: Some(path),
        })
    }

    async fn load(&self, record: &FileRecord) -> Result<Vec<u8>> {
        Err(StoreError::NotRetrievable {
            file: record.name.clone(),
            reason: "file was exported to the user's downloads".to_string(),
        })
    }
}

// ========== Store ==========

/// Dataset byte storage with explicit fallbacks
pub struct DurableFileStore {
    /// Configured root of the persistent area; `None` means unsupported
    area_root: Option<PathBuf>,
    /// Set once access has been granted
    area: RwLock<Option<PersistentArea>>,
    inline: InlineBlob,
    download: EphemeralDownload,
    prompt: Arc<dyn AccessPrompt>,
}

impl DurableFileStore {
    pub fn new(config: &StoreConfig, prompt: Arc<dyn AccessPrompt>) -> Self {
        let area_root = config.durable_root();
        match &area_root {
            Some(root) => tracing::info!("Persistent dataset area available at {}", root.display()),
            None => tracing::warn!("⚠️  No persistent dataset area; using inline/download fallbacks"),
        }

        Self {
            area_root,
            area: RwLock::new(None),
            inline: InlineBlob::new(config.inline_limit_bytes),
            download: EphemeralDownload::new(config.download_dir()),
            prompt,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.area_root.is_some()
    }

    pub fn is_granted(&self) -> bool {
        self.area.read().is_some()
    }

    /// The strategy new saves will try first
    pub fn strategy(&self) -> StorageStrategy {
        if self.is_granted() {
            StorageStrategy::PersistentArea
        } else {
            StorageStrategy::InlineBlob
        }
    }

    fn granted_area(&self) -> Option<PersistentArea> {
        self.area.read().clone()
    }

    /// Area used for reading back durable files, granted or not
    fn reading_area(&self) -> Result<PersistentArea> {
        self.granted_area()
            .or_else(|| self.area_root.clone().map(PersistentArea::new))
            .ok_or_else(|| StoreError::StorageUnavailable("no persistent area configured".to_string()))
    }

    /// Ask the user for the persistent area. Returns whether it is now granted.
    pub async fn request_access(&self) -> Result<bool> {
        let root = self
            .area_root
            .clone()
            .ok_or_else(|| StoreError::StorageUnavailable("no persistent area configured".to_string()))?;

        if self.is_granted() {
            return Ok(true);
        }

        if !self.prompt.confirm(&root) {
            tracing::info!("Persistent dataset area declined by user");
            return Ok(false);
        }

        self.open_area(root).await?;
        Ok(true)
    }

    /// Re-open an area granted in an earlier run, without prompting
    pub async fn restore_grant(&self) -> Result<bool> {
        match self.area_root.clone() {
            Some(root) => {
                self.open_area(root).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn open_area(&self, root: PathBuf) -> Result<()> {
        fs::create_dir_all(&root).await.map_err(|e| {
            StoreError::StorageUnavailable(format!("cannot create {}: {}", root.display(), e))
        })?;
        tracing::info!("✅ Persistent dataset area granted: {}", root.display());
        *self.area.write() = Some(PersistentArea::new(root));
        Ok(())
    }

    /// Persist dataset bytes, degrading to inline or download storage when
    /// the persistent area is missing or failing
    pub async fn save(&self, project_id: &str, file_name: &str, bytes: &[u8]) -> Result<StoredFile> {
        if let Some(area) = self.granted_area() {
            match area.save(project_id, file_name, bytes).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::QuotaExceeded) => return Err(StoreError::QuotaExceeded),
                Err(e) => tracing::warn!("⚠️  Persistent save of {} failed, degrading: {}", file_name, e),
            }
        }

        if self.inline.accepts(bytes.len() as u64) {
            return self.inline.save(project_id, file_name, bytes).await;
        }

        match self.download.save(project_id, file_name, bytes).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                tracing::error!("❌ Could not store {} anywhere: {}", file_name, e);
                Ok(StoredFile {
                    location: FileLocation::Error,
                    inline_content: None,
                    path: None,
                })
            }
        }
    }

    /// Read bytes back according to the record's location tag
    pub async fn load(&self, record: &FileRecord) -> Result<Vec<u8>> {
        match record.location {
            FileLocation::DurableStore => self.reading_area()?.load(record).await,
            FileLocation::InlineBlob => self.inline.load(record).await,
            FileLocation::UserDownload => self.download.load(record).await,
            FileLocation::Error => Err(StoreError::NotRetrievable {
                file: record.name.clone(),
                reason: "file was never stored".to_string(),
            }),
        }
    }

    /// Set aside the granted area's copy of a file before it is overwritten
    pub async fn backup(&self, project_id: &str, file_name: &str) -> Result<Option<Backup>> {
        match self.granted_area() {
            Some(area) => area.backup(project_id, file_name).await,
            None => Ok(None),
        }
    }

    /// Delete bytes from the persistent area, if there are any
    pub async fn remove(&self, project_id: &str, file_name: &str) -> Result<()> {
        match self.reading_area() {
            Ok(area) => area.remove(project_id, file_name).await,
            Err(_) => Ok(()),
        }
    }

    /// Whether the bytes behind a durable-store record are still on disk
    pub fn exists(&self, record: &FileRecord) -> bool {
        match self.reading_area() {
            Ok(area) => area.exists(&record.project_id, &record.name),
            Err(_) => false,
        }
    }

    /// Bytes held in the persistent area
    pub async fn usage(&self) -> Result<u64> {
        match self.reading_area() {
            Ok(area) if area.root().exists() => area.usage().await,
            _ => Ok(0),
        }
    }
}

impl std::fmt::Debug for DurableFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFileStore")
            .field("area_root", &self.area_root)
            .field("granted", &self.is_granted())
            .field("inline", &self.inline)
            .field("download", &self.download)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(project_id: &str, name: &str, stored: &StoredFile) -> FileRecord {
        FileRecord {
            id: "f".into(),
            project_id: project_id.into(),
            name: name.into(),
            size: 0,
            mime_type: "text/csv".into(),
            uploaded_at: Utc::now(),
            location: stored.location,
            inline_content: stored.inline_content.clone(),
            analysis: None,
        }
    }

    fn store(dir: &Path, limit: u64, prompt: Arc<dyn AccessPrompt>) -> DurableFileStore {
        let cfg = StoreConfig {
            inline_limit_bytes: limit,
            ..StoreConfig::in_dir(dir)
        };
        DurableFileStore::new(&cfg, prompt)
    }

    #[tokio::test]
    async fn test_granted_area_round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024, Arc::new(AutoGrant));
        assert!(store.is_supported());
        assert!(!store.is_granted());
        assert!(store.request_access().await.unwrap());
        assert_eq!(store.strategy(), StorageStrategy::PersistentArea);

        store.save("p1", "data.csv", b"old").await.unwrap();
        let stored = store.save("p1", "data.csv", b"a,b\n1,2\n").await.unwrap();
        assert_eq!(stored.location, FileLocation::DurableStore);
        assert!(stored.path.unwrap().ends_with("p1/data.csv"));

        let rec = record("p1", "data.csv", &StoredFile { location: FileLocation::DurableStore, inline_content: None, path: None });
        assert_eq!(store.load(&rec).await.unwrap(), b"a,b\n1,2\n");
        assert!(store.exists(&rec));
        assert_eq!(store.usage().await.unwrap(), 8);

        store.remove("p1", "data.csv").await.unwrap();
        assert!(!store.exists(&rec));
    }

    #[tokio::test]
    async fn test_backup_restores_or_releases_previous_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024, Arc::new(AutoGrant));
        assert!(store.backup("p1", "data.csv").await.unwrap().is_none());
        store.request_access().await.unwrap();
        assert!(store.backup("p1", "data.csv").await.unwrap().is_none());

        let rec = record("p1", "data.csv", &StoredFile { location: FileLocation::DurableStore, inline_content: None, path: None });
        store.save("p1", "data.csv", b"old").await.unwrap();
        let backup = store.backup("p1", "data.csv").await.unwrap().unwrap();
        assert!(!store.exists(&rec));
        store.save("p1", "data.csv", b"new").await.unwrap();
        backup.restore().await.unwrap();
        assert_eq!(store.load(&rec).await.unwrap(), b"old");

        let backup = store.backup("p1", "data.csv").await.unwrap().unwrap();
        store.save("p1", "data.csv", b"newer").await.unwrap();
        backup.release().await.unwrap();
        assert_eq!(store.load(&rec).await.unwrap(), b"newer");
        assert_eq!(store.usage().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_save_never_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024, Arc::new(AutoGrant));
        let stored = store.save("p1", "small.csv", b"x\n1\n").await.unwrap();
        assert_eq!(stored.location, FileLocation::InlineBlob);
        assert!(!store.is_granted());
    }

    #[tokio::test]
    async fn test_denied_prompt_keeps_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024, Arc::new(DenyAccess));
        assert!(!store.request_access().await.unwrap());
        assert_eq!(store.strategy(), StorageStrategy::InlineBlob);
    }

    #[tokio::test]
    async fn test_unsupported_area_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            durable_enabled: false,
            ..StoreConfig::in_dir(dir.path())
        };
        let store = DurableFileStore::new(&cfg, Arc::new(AutoGrant));
        assert!(!store.is_supported());
        assert!(matches!(
            store.request_access().await,
            Err(StoreError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_large_file_goes_to_download_and_is_not_retrievable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 4, Arc::new(DenyAccess));

        let stored = store.save("p1", "big.csv", b"0123456789").await.unwrap();
        assert_eq!(stored.location, FileLocation::UserDownload);
        assert!(stored.path.as_ref().unwrap().exists());

        let again = store.save("p1", "big.csv", b"0123456789").await.unwrap();
        assert!(again.path.unwrap().ends_with("big (1).csv"));

        let rec = record("p1", "big.csv", &stored);
        assert!(matches!(
            store.load(&rec).await,
            Err(StoreError::NotRetrievable { .. })
        ));
    }

    #[tokio::test]
    async fn test_inline_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024, Arc::new(DenyAccess));
        let stored = store.save("p1", "s.csv", b"k\n1\n").await.unwrap();
        let rec = record("p1", "s.csv", &stored);
        assert_eq!(store.load(&rec).await.unwrap(), b"k\n1\n");
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_name("../../etc/passwd").unwrap(), "passwd");
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("").is_err());
    }
}
