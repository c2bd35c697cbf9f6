//! File-transaction engine: commit a group of file mutations such that
//! either every file reaches its new state or the prior state is fully
//! restored, optionally archiving supplanted versions.
//!
//! Modeled as a tagged variant with a single apply/revert/cleanup
//! dispatcher rather than a trait-object hierarchy, since cleanup
//! behavior depends only on whether archival occurred.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Owning uid/gid pair to chown a written file to. `is_self` marks the
/// "no-op, it's already us" case so callers don't need to special-case it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
    pub is_self: bool,
}

/// A pending write or archive action.
pub struct FileOperation {
    kind: Kind,
    file_type: String,
    file_path: PathBuf,
    mode: u32,
    owner: Option<FileOwner>,
    content: Option<Vec<u8>>,

    // Apply-phase bookkeeping, used by revert/cleanup.
    backup_path: Option<PathBuf>,
    archived: bool,
    created_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Write,
    ArchiveAndWrite,
    Archive,
}

impl FileOperation {
    pub fn write(file_path: impl AsRef<Path>, mode: u32, content: Vec<u8>) -> Self {
        Self::new(Kind::Write, String::new(), file_path, mode, None, Some(content))
    }

    pub fn archive_and_write(
        file_type: impl Into<String>,
        file_path: impl AsRef<Path>,
        mode: u32,
        content: Vec<u8>,
    ) -> Self {
        Self::new(Kind::ArchiveAndWrite, file_type, file_path, mode, None, Some(content))
    }

    pub fn archive(file_type: impl Into<String>, file_path: impl AsRef<Path>) -> Self {
        Self::new(Kind::Archive, file_type, file_path, 0, None, None)
    }

    pub fn with_owner(mut self, owner: FileOwner) -> Self {
        self.owner = if owner.is_self { None } else { Some(owner) };
        self
    }

    fn new(
        kind: Kind,
        file_type: impl Into<String>,
        file_path: impl AsRef<Path>,
        mode: u32,
        owner: Option<FileOwner>,
        content: Option<Vec<u8>>,
    ) -> Self {
        FileOperation {
            kind,
            file_type: file_type.into(),
            file_path: file_path.as_ref().to_path_buf(),
            mode,
            owner,
            content,
            backup_path: None,
            archived: false,
            created_dir: None,
        }
    }

    fn backup_target(&self, archive_dir: Option<&Path>) -> PathBuf {
        if self.kind != Kind::Write {
            if let Some(archive_dir) = archive_dir {
                return archive_dir.join(&self.file_type).join(
                    self.file_path
                        .file_name()
                        .expect("file_path has a file name"),
                );
            }
        }
        // Sibling temp name in the destination directory.
        let dir = self.file_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!(
            ".old-{}",
            self.file_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("tmp")
        ))
    }

    fn apply(&mut self, archive_dir: Option<&Path>) -> Result<()> {
        let backup_path = self.backup_target(archive_dir);
        if let Some(parent) = backup_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                self.created_dir = Some(parent.to_path_buf());
            }
        }

        match fs::rename(&self.file_path, &backup_path) {
            Ok(()) => {
                self.backup_path = Some(backup_path);
                self.archived = self.kind != Kind::Write && archive_dir.is_some();
                if self.archived {
                    debug!(path = %self.file_path.display(), "archived");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(dir) = self.created_dir.take() {
                    let _ = fs::remove_dir(&dir);
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }

        let Some(content) = self.content.take() else {
            return Ok(());
        };

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.file_path, &content)?;
        set_mode(&self.file_path, self.mode);
        if let Some(owner) = self.owner {
            set_owner(&self.file_path, owner);
        }
        debug!(path = %self.file_path.display(), "saved");
        Ok(())
    }

    fn revert(&mut self) {
        if self.content.is_none() {
            // content was already written (taken) during apply; remove it.
            if fs::remove_file(&self.file_path).is_ok() {
                debug!(path = %self.file_path.display(), "removed");
            }
        }
        if let Some(backup) = self.backup_path.take() {
            if let Err(e) = fs::rename(&backup, &self.file_path) {
                error!(path = %self.file_path.display(), error = %e, "restore failed");
            } else {
                debug!(path = %self.file_path.display(), "restored");
            }
        }
    }

    fn cleanup(&mut self) {
        if self.archived {
            return;
        }
        if let Some(backup) = self.backup_path.take() {
            let _ = fs::remove_file(&backup);
            if let Some(dir) = self.created_dir.take() {
                let _ = fs::remove_dir(&dir);
            }
        }
    }
}

fn set_mode(path: &Path, mode: u32) {
    if mode == 0 {
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), mode = format!("{mode:o}"), error = %e, "unable to set file mode");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

fn set_owner(path: &Path, owner: FileOwner) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::chown;
        if let Err(e) = chown(path, Some(owner.uid), Some(owner.gid)) {
            warn!(path = %path.display(), uid = owner.uid, gid = owner.gid, error = %e, "unable to set file ownership");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, owner);
    }
}

/// Apply every operation in submission order; on failure, revert every
/// already-applied operation in reverse order and propagate the error.
/// On success, run cleanup on every operation (a no-op for archived
/// backups, which are left in place).
pub fn commit_file_transactions(
    operations: Vec<FileOperation>,
    archive_dir: Option<&Path>,
) -> Result<()> {
    if operations.is_empty() {
        return Ok(());
    }

    debug!("committing file transaction");
    let mut applied = Vec::with_capacity(operations.len());
    for mut op in operations {
        if let Err(e) = op.apply(archive_dir) {
            error!(error = %e, "file transaction error, rolling back changes");
            for mut op in applied.into_iter().rev() {
                op.revert();
            }
            return Err(e);
        }
        applied.push(op);
    }

    for mut op in applied {
        op.cleanup();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn write_creates_file_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let ops = vec![FileOperation::write(&path, 0o644, b"hello".to_vec())];
        commit_file_transactions(ops, None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn archive_and_write_moves_prior_file_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let path = dir.path().join("cert.pem");
        fs::write(&path, b"old").unwrap();

        let ops = vec![FileOperation::archive_and_write(
            "certificate",
            &path,
            0o644,
            b"new".to_vec(),
        )];
        commit_file_transactions(ops, Some(&archive)).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(
            fs::read(archive.join("certificate").join("cert.pem")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn failed_apply_rolls_back_prior_operations() {
        let dir = tempfile::tempdir().unwrap();
        let ok_path = dir.path().join("a.txt");
        fs::write(&ok_path, b"original").unwrap();

        // A destination whose parent cannot be created (it's a file, not a
        // directory) forces the second operation's apply to fail.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let bad_path = blocker.join("nested.txt");

        let ops = vec![
            FileOperation::write(&ok_path, 0o644, b"updated".to_vec()),
            FileOperation::write(&bad_path, 0o644, b"updated".to_vec()),
        ];
        let result = commit_file_transactions(ops, None);
        assert!(result.is_err());
        assert_eq!(fs::read(&ok_path).unwrap(), b"original");
    }

    #[test]
    fn cleanup_removes_non_archived_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, b"old").unwrap();

        let ops = vec![FileOperation::write(&path, 0o600, b"new".to_vec())];
        commit_file_transactions(ops, None).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
