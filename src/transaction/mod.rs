//! Transaction engine (C2) — spec §4.2: stage file operations into a
//! per-transaction temp directory, apply them atomically, roll back on
//! any failure.
//!
//! The staging/backup-then-apply shape and its `tokio::fs` usage are
//! grounded on `crates/ccswarm/src/session/checkpoint.rs`'s
//! `CheckpointStore`, generalized from a single JSON snapshot to an
//! ordered list of create/update/delete/move file operations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs;
use uuid::Uuid;

use crate::error::FileOperationError;

/// A single staged file mutation (spec §4.2).
#[derive(Debug, Clone)]
pub enum TransactionOperation {
    Create { path: PathBuf, content: Vec<u8> },
    Update { path: PathBuf, content: Vec<u8> },
    Delete { path: PathBuf },
    Move { source: PathBuf, target: PathBuf },
}

impl TransactionOperation {
    fn primary_path(&self) -> &Path {
        match self {
            TransactionOperation::Create { path, .. } => path,
            TransactionOperation::Update { path, .. } => path,
            TransactionOperation::Delete { path } => path,
            TransactionOperation::Move { target, .. } => target,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TransactionOperation::Create { .. } => "create",
            TransactionOperation::Update { .. } => "update",
            TransactionOperation::Delete { .. } => "delete",
            TransactionOperation::Move { .. } => "move",
        }
    }
}

/// How to undo a single applied operation (spec §4.2's rollback step).
#[derive(Debug, Clone)]
enum Undo {
    /// Create or update: remove the file if it didn't exist before, else
    /// restore the backup onto it.
    WriteOrCreate { path: PathBuf, backup: Option<PathBuf> },
    /// Delete: restore the backup onto `path`, if one was taken (a missing
    /// backup means the file didn't exist before the delete either).
    Delete { path: PathBuf, backup: Option<PathBuf> },
    /// Move: rename the target back onto the source.
    Move { source: PathBuf, target: PathBuf },
}

/// What [`Transaction::commit`] did to a single operation, used to drive
/// rollback in reverse order.
#[derive(Debug, Clone)]
struct Applied {
    op_index: usize,
    path: PathBuf,
    undo: Undo,
}

/// Outcome of [`Transaction::commit`]. Never an `Err` — commit/rollback
/// failures are carried as data per spec §7 ("the transaction engine
/// never throws past commit").
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub success: bool,
    pub committed_files: Vec<PathBuf>,
    pub error: Option<FileOperationError>,
    pub rolled_back: bool,
}

/// A snapshot of the pending operations list, created by
/// [`Transaction::create_checkpoint`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    id: String,
    operations: Vec<TransactionOperation>,
}

impl Checkpoint {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Stages a list of file operations under a per-transaction temp
/// directory and applies them as an all-or-nothing unit.
pub struct Transaction {
    id: String,
    base_dir: PathBuf,
    temp_dir: PathBuf,
    operations: Vec<TransactionOperation>,
    committed: AtomicBool,
}

impl Transaction {
    /// `base_dir` anchors relative operation paths and hosts the
    /// `.<appdata>/transactions/<txid>/` staging area (spec §4.2).
    pub fn new(base_dir: impl Into<PathBuf>, app_data_dir_name: &str) -> Self {
        let base_dir = base_dir.into();
        let id = Uuid::new_v4().to_string();
        let temp_dir = base_dir.join(app_data_dir_name).join("transactions").join(&id);
        Self {
            id,
            base_dir,
            temp_dir,
            operations: Vec::new(),
            committed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn ensure_not_committed(&self) -> Result<(), FileOperationError> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(FileOperationError::new(
                "add_operation",
                self.base_dir.display().to_string(),
                "transaction already committed",
            ));
        }
        Ok(())
    }

    pub fn add_create(
        &mut self,
        path: impl Into<PathBuf>,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), FileOperationError> {
        self.ensure_not_committed()?;
        self.operations.push(TransactionOperation::Create {
            path: path.into(),
            content: content.into(),
        });
        Ok(())
    }

    pub fn add_update(
        &mut self,
        path: impl Into<PathBuf>,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), FileOperationError> {
        self.ensure_not_committed()?;
        self.operations.push(TransactionOperation::Update {
            path: path.into(),
            content: content.into(),
        });
        Ok(())
    }

    pub fn add_delete(&mut self, path: impl Into<PathBuf>) -> Result<(), FileOperationError> {
        self.ensure_not_committed()?;
        self.operations.push(TransactionOperation::Delete { path: path.into() });
        Ok(())
    }

    pub fn add_move(
        &mut self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Result<(), FileOperationError> {
        self.ensure_not_committed()?;
        self.operations.push(TransactionOperation::Move {
            source: source.into(),
            target: target.into(),
        });
        Ok(())
    }

    pub fn create_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            id: Uuid::new_v4().to_string(),
            operations: self.operations.clone(),
        }
    }

    pub fn restore_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), FileOperationError> {
        self.ensure_not_committed()?;
        self.operations = checkpoint.operations.clone();
        Ok(())
    }

    fn staging_path(&self, op_index: usize) -> PathBuf {
        self.temp_dir.join(format!("op-{op_index}.staged"))
    }

    fn backup_path(&self, op_index: usize) -> PathBuf {
        self.temp_dir.join(format!("op-{op_index}.backup"))
    }

    /// Stages every operation's content/backup under the temp dir. Per
    /// spec §4.2, a staging failure aborts with nothing applied.
    async fn stage(&self) -> Result<(), FileOperationError> {
        fs::create_dir_all(&self.temp_dir).await.map_err(|e| {
            FileOperationError::new("stage", self.temp_dir.display().to_string(), e)
        })?;

        for (index, op) in self.operations.iter().enumerate() {
            match op {
                TransactionOperation::Create { path, content }
                | TransactionOperation::Update { path, content } => {
                    let resolved = self.resolve(path);
                    fs::write(self.staging_path(index), content).await.map_err(|e| {
                        FileOperationError::new(op.label(), resolved.display().to_string(), e)
                    })?;
                    if matches!(op, TransactionOperation::Update { .. }) && resolved.exists() {
                        fs::copy(&resolved, self.backup_path(index)).await.map_err(|e| {
                            FileOperationError::new("backup", resolved.display().to_string(), e)
                        })?;
                    }
                }
                TransactionOperation::Delete { path } => {
                    let resolved = self.resolve(path);
                    if resolved.exists() {
                        fs::copy(&resolved, self.backup_path(index)).await.map_err(|e| {
                            FileOperationError::new("backup", resolved.display().to_string(), e)
                        })?;
                    }
                }
                TransactionOperation::Move { source, .. } => {
                    let resolved_source = self.resolve(source);
                    if resolved_source.exists() {
                        fs::copy(&resolved_source, self.backup_path(index))
                            .await
                            .map_err(|e| {
                                FileOperationError::new(
                                    "backup",
                                    resolved_source.display().to_string(),
                                    e,
                                )
                            })?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_one(&self, index: usize, op: &TransactionOperation) -> Result<(), FileOperationError> {
        match op {
            TransactionOperation::Create { path, .. } | TransactionOperation::Update { path, .. } => {
                let resolved = self.resolve(path);
                if let Some(parent) = resolved.parent() {
                    fs::create_dir_all(parent).await.map_err(|e| {
                        FileOperationError::new("mkdir", parent.display().to_string(), e)
                    })?;
                }
                fs::copy(self.staging_path(index), &resolved).await.map_err(|e| {
                    FileOperationError::new(op.label(), resolved.display().to_string(), e)
                })?;
                Ok(())
            }
            TransactionOperation::Delete { path } => {
                let resolved = self.resolve(path);
                if resolved.exists() {
                    fs::remove_file(&resolved).await.map_err(|e| {
                        FileOperationError::new("delete", resolved.display().to_string(), e)
                    })?;
                }
                Ok(())
            }
            TransactionOperation::Move { source, target } => {
                let resolved_source = self.resolve(source);
                let resolved_target = self.resolve(target);
                if let Some(parent) = resolved_target.parent() {
                    fs::create_dir_all(parent).await.map_err(|e| {
                        FileOperationError::new("mkdir", parent.display().to_string(), e)
                    })?;
                }
                fs::rename(&resolved_source, &resolved_target)
                    .await
                    .map_err(|e| {
                        FileOperationError::new("move", resolved_target.display().to_string(), e)
                    })?;
                Ok(())
            }
        }
    }

    /// Applies staged operations in order; on first failure rolls back
    /// everything already applied. One-shot: a second call always fails.
    pub async fn commit(&mut self) -> CommitResult {
        if self.committed.swap(true, Ordering::SeqCst) {
            return CommitResult {
                success: false,
                committed_files: Vec::new(),
                error: Some(FileOperationError::new(
                    "commit",
                    self.base_dir.display().to_string(),
                    "transaction already committed",
                )),
                rolled_back: false,
            };
        }

        if let Err(e) = self.stage().await {
            return CommitResult {
                success: false,
                committed_files: Vec::new(),
                error: Some(e),
                rolled_back: false,
            };
        }

        let mut applied: Vec<Applied> = Vec::new();
        let mut failure: Option<FileOperationError> = None;

        for (index, op) in self.operations.iter().enumerate() {
            match self.apply_one(index, op).await {
                Ok(()) => {
                    let backup_of = |index: usize| {
                        let candidate = self.backup_path(index);
                        if candidate.exists() { Some(candidate) } else { None }
                    };
                    let undo = match op {
                        TransactionOperation::Create { path, .. } => Undo::WriteOrCreate {
                            path: self.resolve(path),
                            backup: None,
                        },
                        TransactionOperation::Update { path, .. } => Undo::WriteOrCreate {
                            path: self.resolve(path),
                            backup: backup_of(index),
                        },
                        TransactionOperation::Delete { path } => Undo::Delete {
                            path: self.resolve(path),
                            backup: backup_of(index),
                        },
                        TransactionOperation::Move { source, target } => Undo::Move {
                            source: self.resolve(source),
                            target: self.resolve(target),
                        },
                    };
                    applied.push(Applied {
                        op_index: index,
                        path: self.resolve(op.primary_path()),
                        undo,
                    });
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            self.rollback(&applied).await;
            let _ = fs::remove_dir_all(&self.temp_dir).await;
            return CommitResult {
                success: false,
                committed_files: Vec::new(),
                error: Some(error),
                rolled_back: true,
            };
        }

        let committed_files = applied.iter().map(|a| a.path.clone()).collect();
        let _ = fs::remove_dir_all(&self.temp_dir).await;

        CommitResult {
            success: true,
            committed_files,
            error: None,
            rolled_back: false,
        }
    }

    /// Best-effort undo over the subset already applied, in reverse
    /// order. Errors are logged, never propagated (spec §4.2).
    async fn rollback(&self, applied: &[Applied]) {
        for entry in applied.iter().rev() {
            let outcome = match &entry.undo {
                Undo::WriteOrCreate { path, backup } => {
                    if let Some(backup) = backup {
                        fs::copy(backup, path).await.map(|_| ())
                    } else {
                        fs::remove_file(path).await
                    }
                }
                Undo::Delete { path, backup } => {
                    if let Some(backup) = backup {
                        fs::copy(backup, path).await.map(|_| ())
                    } else {
                        Ok(())
                    }
                }
                Undo::Move { source, target } => fs::rename(target, source).await,
            };
            if let Err(e) = outcome {
                tracing::error!(
                    op_index = entry.op_index,
                    path = %entry.path.display(),
                    error = %e,
                    "rollback step failed"
                );
            }
        }
    }

    /// Removes the temp directory. Idempotent.
    pub async fn cleanup(&self) -> Result<(), FileOperationError> {
        match fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileOperationError::new(
                "cleanup",
                self.temp_dir.display().to_string(),
                e,
            )),
        }
    }
}

/// Factory mirroring spec §6's `createTransaction(baseDir)`.
pub fn create_transaction(base_dir: impl Into<PathBuf>) -> Transaction {
    Transaction::new(base_dir, ".ccore")
}
