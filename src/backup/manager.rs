//! Backup manager -- crash-safe snapshot, retention sweep, isolated restore.

use super::{
    retention_victims, Backup, BackupError, BackupKind, BackupMetadata, RestoreError,
    RetentionPolicy, RunState,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const METADATA_NAME: &str = "backup_metadata.json";

#[derive(Debug, Clone)]
pub struct BackupPaths {
    /// Where sealed archives live.
    pub backup_dir: PathBuf,
    /// The live SQLite database file to snapshot.
    pub db_path: PathBuf,
    /// Directory whose `*.log` files are snapshotted.
    pub logs_dir: PathBuf,
    /// Restores extract under here, never over live state.
    pub restore_dir: PathBuf,
}

pub struct BackupManager {
    paths: BackupPaths,
    retention: RetentionPolicy,
    /// Serializes backup runs; scheduled runs that fail `try_lock` are skipped.
    run_lock: Mutex<()>,
    state: Arc<StdMutex<RunState>>,
}

impl BackupManager {
    pub fn new(paths: BackupPaths, retention: RetentionPolicy) -> Self {
        Self {
            paths,
            retention,
            run_lock: Mutex::new(()),
            state: Arc::new(StdMutex::new(RunState::Idle)),
        }
    }

    pub fn run_state(&self) -> RunState {
        *self.state.lock().expect("backup state lock poisoned")
    }

    /// Snapshot the database and log files into a sealed archive, then prune.
    ///
    /// The archive is written under a temporary name and atomically renamed
    /// on seal, so a crash mid-snapshot never leaves a partial archive
    /// registered. Returns [`BackupError::Busy`] without queuing when another
    /// run holds the lock.
    pub async fn create_backup(
        &self,
        kind: BackupKind,
        description: &str,
    ) -> Result<Backup, BackupError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(%kind, "Backup run already in progress, skipping");
                return Err(BackupError::Busy);
            }
        };

        let paths = self.paths.clone();
        let retention = self.retention.clone();
        let state = self.state.clone();
        let description = description.to_string();

        let backup = tokio::task::spawn_blocking(move || {
            let result = snapshot(&paths, kind, &description, &state);
            if result.is_ok() {
                set_state(&state, RunState::Pruning);
                prune_dir(&paths.backup_dir, kind, retention.max_for(kind));
            }
            set_state(&state, RunState::Idle);
            result
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        Ok(backup)
    }

    /// Retention sweep for one kind, independent of a snapshot run.
    pub async fn prune_retained(&self, kind: BackupKind) -> Result<usize, BackupError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(BackupError::Busy),
        };
        let dir = self.paths.backup_dir.clone();
        let max = self.retention.max_for(kind);
        let removed =
            tokio::task::spawn_blocking(move || prune_dir(&dir, kind, max))
                .await
                .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        Ok(removed)
    }

    /// All sealed backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<Backup>, BackupError> {
        let mut backups = list_dir(&self.paths.backup_dir)?;
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Extract a backup into an isolated directory under `restore_dir`.
    ///
    /// Live state is never touched. Fails `Corrupt` when the metadata record
    /// is missing or the archived file count does not match its manifest.
    pub fn restore_backup(&self, id: &str) -> Result<PathBuf, RestoreError> {
        let archive_path = self.paths.backup_dir.join(format!("{id}.zip"));
        if !archive_path.exists() {
            return Err(RestoreError::NotFound(id.to_string()));
        }

        let file = File::open(&archive_path)?;
        let mut archive = ZipArchive::new(file).map_err(|e| RestoreError::Corrupt {
            id: id.to_string(),
            detail: e.to_string(),
        })?;

        let metadata = read_metadata(&mut archive).ok_or_else(|| RestoreError::Corrupt {
            id: id.to_string(),
            detail: "metadata record missing or unreadable".to_string(),
        })?;

        // Every manifest entry plus the metadata record itself.
        if archive.len() != metadata.files.len() + 1 {
            return Err(RestoreError::Corrupt {
                id: id.to_string(),
                detail: format!(
                    "manifest lists {} files but archive holds {}",
                    metadata.files.len(),
                    archive.len() - 1
                ),
            });
        }

        let target = self
            .paths
            .restore_dir
            .join(Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string());
        std::fs::create_dir_all(&target)?;
        archive.extract(&target).map_err(|e| RestoreError::Corrupt {
            id: id.to_string(),
            detail: e.to_string(),
        })?;

        info!(backup = id, target = %target.display(), "Backup restored");
        Ok(target)
    }

    /// Count and total size per kind.
    pub fn stats(&self) -> Result<BTreeMap<BackupKind, (usize, u64)>, BackupError> {
        let mut stats: BTreeMap<BackupKind, (usize, u64)> = BTreeMap::new();
        for backup in self.list_backups()? {
            let entry = stats.entry(backup.kind).or_default();
            entry.0 += 1;
            entry.1 += backup.size_bytes;
        }
        Ok(stats)
    }
}

fn set_state(state: &StdMutex<RunState>, next: RunState) {
    *state.lock().expect("backup state lock poisoned") = next;
}

fn snapshot(
    paths: &BackupPaths,
    kind: BackupKind,
    description: &str,
    state: &StdMutex<RunState>,
) -> Result<Backup, BackupError> {
    set_state(state, RunState::Snapshotting);
    std::fs::create_dir_all(&paths.backup_dir)?;

    let created_at = Utc::now();
    let stamp = created_at.format("%Y%m%d_%H%M%S_%6f").to_string();
    let id = format!("backup_{stamp}_{kind}");
    let final_path = paths.backup_dir.join(format!("{id}.zip"));
    let tmp_path = paths.backup_dir.join(format!(".{id}.zip.tmp"));

    let mut files = Vec::new();
    let mut checksums = BTreeMap::new();
    let mut database_size = 0u64;
    let mut logs_size = 0u64;

    {
        let out = File::create(&tmp_path)?;
        let mut zip = ZipWriter::new(out);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        if paths.db_path.exists() {
            let name = format!(
                "database/{}",
                paths
                    .db_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "pipewarden.db".to_string())
            );
            let bytes = std::fs::read(&paths.db_path)?;
            database_size = bytes.len() as u64;
            checksums.insert(name.clone(), sha256_hex(&bytes));
            zip.start_file(&name, options)?;
            zip.write_all(&bytes)?;
            files.push(name);
        }

        if paths.logs_dir.is_dir() {
            let mut log_files: Vec<PathBuf> = std::fs::read_dir(&paths.logs_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "log").unwrap_or(false))
                .collect();
            log_files.sort();

            for log in log_files {
                let name = format!("logs/{}", log.file_name().unwrap().to_string_lossy());
                let bytes = std::fs::read(&log)?;
                logs_size += bytes.len() as u64;
                checksums.insert(name.clone(), sha256_hex(&bytes));
                zip.start_file(&name, options)?;
                zip.write_all(&bytes)?;
                files.push(name);
            }
        }

        let metadata = BackupMetadata {
            kind,
            description: description.to_string(),
            created_at,
            files: files.clone(),
            checksums: checksums.clone(),
            database_size,
            logs_size,
        };
        zip.start_file(METADATA_NAME, options)?;
        zip.write_all(serde_json::to_string_pretty(&metadata)?.as_bytes())?;
        zip.finish()?;
    }

    // Seal: the archive becomes visible only once it is complete.
    std::fs::rename(&tmp_path, &final_path)?;
    set_state(state, RunState::Sealed);

    let size_bytes = std::fs::metadata(&final_path)?.len();
    info!(
        backup = %id,
        %kind,
        files = files.len(),
        size_bytes,
        "Backup sealed"
    );

    Ok(Backup {
        id,
        path: final_path,
        kind,
        created_at,
        file_manifest: files,
        size_bytes,
        description: description.to_string(),
    })
}

fn prune_dir(dir: &Path, kind: BackupKind, max: usize) -> usize {
    let backups = match list_dir(dir) {
        Ok(all) => all.into_iter().filter(|b| b.kind == kind).collect(),
        Err(e) => {
            warn!(%kind, "Retention sweep could not list backups: {e}");
            return 0;
        }
    };

    let victims = retention_victims(backups, max);
    let mut removed = 0;
    for victim in victims {
        match std::fs::remove_file(&victim.path) {
            Ok(()) => {
                info!(backup = %victim.id, %kind, "Old backup deleted");
                removed += 1;
            }
            Err(e) => warn!(backup = %victim.id, "Failed to delete old backup: {e}"),
        }
    }
    removed
}

fn list_dir(dir: &Path) -> Result<Vec<Backup>, BackupError> {
    let mut backups = Vec::new();
    if !dir.is_dir() {
        return Ok(backups);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if !name.starts_with("backup_") || !name.ends_with(".zip") {
            continue;
        }

        match read_backup(&path) {
            Some(backup) => backups.push(backup),
            None => warn!(archive = %path.display(), "Skipping unreadable backup archive"),
        }
    }
    Ok(backups)
}

fn read_backup(path: &Path) -> Option<Backup> {
    let file = File::open(path).ok()?;
    let mut archive = ZipArchive::new(file).ok()?;
    let metadata = read_metadata(&mut archive)?;
    let size_bytes = std::fs::metadata(path).ok()?.len();
    let id = path.file_stem()?.to_string_lossy().into_owned();

    Some(Backup {
        id,
        path: path.to_path_buf(),
        kind: metadata.kind,
        created_at: metadata.created_at,
        file_manifest: metadata.files,
        size_bytes,
        description: metadata.description,
    })
}

fn read_metadata(archive: &mut ZipArchive<File>) -> Option<BackupMetadata> {
    let mut entry = archive.by_name(METADATA_NAME).ok()?;
    let mut raw = String::new();
    entry.read_to_string(&mut raw).ok()?;
    serde_json::from_str(&raw).ok()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> BackupManager {
        let db_path = dir.join("data.db");
        std::fs::write(&db_path, b"sqlite pretend bytes").unwrap();
        let logs_dir = dir.join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();
        std::fs::write(logs_dir.join("security_alerts.log"), b"alert line\n").unwrap();
        std::fs::write(logs_dir.join("audit.log"), b"audit line\n").unwrap();
        std::fs::write(logs_dir.join("notes.txt"), b"not a log\n").unwrap();

        BackupManager::new(
            BackupPaths {
                backup_dir: dir.join("backups"),
                db_path,
                logs_dir,
                restore_dir: dir.join("restore"),
            },
            RetentionPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_create_backup_seals_archive_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let backup = mgr.create_backup(BackupKind::Manual, "first").await.unwrap();
        assert!(backup.path.exists());
        assert_eq!(backup.kind, BackupKind::Manual);
        // db + two .log files; notes.txt is excluded.
        assert_eq!(backup.file_manifest.len(), 3);
        assert_eq!(mgr.run_state(), RunState::Idle);

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_sixth_backup_evicts_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let mut ids = Vec::new();
        for i in 0..6 {
            let backup = mgr
                .create_backup(BackupKind::Manual, &format!("run {i}"))
                .await
                .unwrap();
            ids.push(backup.id);
        }

        let remaining = mgr.list_backups().unwrap();
        assert_eq!(remaining.len(), 5);
        // Newest five survive, first-created is gone, newest-first order.
        let survivors: Vec<&str> = remaining.iter().map(|b| b.id.as_str()).collect();
        let expected: Vec<&str> = ids[1..].iter().rev().map(|s| s.as_str()).collect();
        assert_eq!(survivors, expected);
    }

    #[tokio::test]
    async fn test_retention_is_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        for _ in 0..6 {
            mgr.create_backup(BackupKind::Manual, "m").await.unwrap();
        }
        mgr.create_backup(BackupKind::Daily, "d").await.unwrap();

        let stats = mgr.stats().unwrap();
        assert_eq!(stats[&BackupKind::Manual].0, 5);
        assert_eq!(stats[&BackupKind::Daily].0, 1);
    }

    #[tokio::test]
    async fn test_restore_extracts_isolated_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let backup = mgr.create_backup(BackupKind::Manual, "snap").await.unwrap();
        let live_db = dir.path().join("data.db");
        let before = std::fs::read(&live_db).unwrap();

        let target = mgr.restore_backup(&backup.id).unwrap();
        assert!(target.starts_with(dir.path().join("restore")));
        assert!(target.join("database/data.db").exists());
        assert!(target.join("logs/audit.log").exists());
        // Live state untouched.
        assert_eq!(std::fs::read(&live_db).unwrap(), before);
    }

    #[tokio::test]
    async fn test_restore_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr.restore_backup("backup_nope_manual").unwrap_err();
        assert!(matches!(err, RestoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restore_detects_manifest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let backup = mgr.create_backup(BackupKind::Manual, "snap").await.unwrap();

        // Rewrite the archive with one manifest entry missing.
        let file = File::open(&backup.path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let metadata = read_metadata(&mut archive).unwrap();

        let tampered = dir.path().join("backups").join(format!("{}.zip", backup.id));
        let out = File::create(&tampered).unwrap();
        let mut zip = ZipWriter::new(out);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(METADATA_NAME, options).unwrap();
        zip.write_all(serde_json::to_string(&metadata).unwrap().as_bytes())
            .unwrap();
        zip.finish().unwrap();

        let err = mgr.restore_backup(&backup.id).unwrap_err();
        assert!(matches!(err, RestoreError::Corrupt { .. }));
    }
}
