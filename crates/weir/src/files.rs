//! File resource tracking.
//!
//! Files are registered under their absolute (but not symlink-resolved)
//! path, with size and md5 captured at registration. At any path, at most
//! one file resource is current; registering or producing a newer one
//! flags the older registration `overwritten`, and overwritten inputs are
//! refused at use time.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use md5::{Digest, Md5};
use tracing::info;

use weir_model::{flag, FileId, FileResource, NodeRef};
use weir_store::Store;

use crate::error::{Result, WeirError};

/// Outcome of comparing a file resource against the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// The file matches its registration.
    Ok,
    /// The file exists but its content no longer matches.
    Changed,
    /// The file is gone (or is no longer a regular file).
    Missing,
}

pub(crate) struct FileTracker {
    store: Arc<Store>,
}

impl FileTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register the file at `path`.
    ///
    /// If a current (non-overwritten) file resource already exists there
    /// and `force` is false, it is returned unchanged. Otherwise a new
    /// file resource is created and any older current registration is
    /// flagged `overwritten` in the same transaction.
    pub fn register(&self, path: &Path, force: bool) -> Result<FileResource> {
        let path = std::path::absolute(path)?;
        let existing = self.store.current_file_at(&path)?;
        if let Some(existing) = existing {
            if !force {
                return Ok(existing);
            }
            let file = self.snapshot_resource(&path, None)?;
            self.store.put_file(&file, Some(&existing.id))?;
            info!(path = %path.display(), old = %existing.id, new = %file.id, "file re-registered");
            return Ok(file);
        }

        let file = self.snapshot_resource(&path, None)?;
        self.store.put_file(&file, None)?;
        Ok(file)
    }

    /// The current file resource at `path`.
    ///
    /// Fails if nothing was ever registered there, or if every
    /// registration has been overwritten or retired.
    pub fn from_path(&self, path: &Path) -> Result<FileResource> {
        let path = std::path::absolute(path)?;
        match self.store.current_file_at(&path)? {
            Some(file) => {
                if self
                    .store
                    .has_flag(&NodeRef::File(file.id.clone()), flag::DEPRECATED)?
                {
                    return Err(WeirError::StaleFileResource {
                        id: file.id,
                        reason: format!("{} has been retired", path.display()),
                    });
                }
                Ok(file)
            }
            None => {
                let history = self.store.files_at_path(&path)?;
                match history.last() {
                    Some(last) => Err(WeirError::StaleFileResource {
                        id: last.id.clone(),
                        reason: format!(
                            "every registration at {} has been overwritten",
                            path.display()
                        ),
                    }),
                    None => Err(WeirError::UnknownFile(path)),
                }
            }
        }
    }

    /// Compare a file resource against the disk. A shallow check compares
    /// size only; a deep check also compares md5.
    pub fn integrity(&self, file: &FileResource, deep: bool) -> Result<Integrity> {
        let meta = match fs::metadata(&file.path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(Integrity::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Integrity::Missing),
            Err(e) => return Err(e.into()),
        };
        if meta.len() != file.size {
            return Ok(Integrity::Changed);
        }
        if deep && file_md5(&file.path)? != file.md5 {
            return Ok(Integrity::Changed);
        }
        Ok(Integrity::Ok)
    }

    /// Gate an input file before use: it must not be overwritten and must
    /// still carry the registered content.
    pub fn require_fresh(&self, file: &FileResource) -> Result<()> {
        if self
            .store
            .has_flag(&NodeRef::File(file.id.clone()), flag::OVERWRITTEN)?
        {
            return Err(WeirError::StaleFileResource {
                id: file.id.clone(),
                reason: format!("{} was overwritten by a newer registration", file.path.display()),
            });
        }
        match self.integrity(file, true)? {
            Integrity::Ok => Ok(()),
            Integrity::Changed => Err(WeirError::StaleFileResource {
                id: file.id.clone(),
                reason: format!("{} changed on disk since registration", file.path.display()),
            }),
            Integrity::Missing => Err(WeirError::StaleFileResource {
                id: file.id.clone(),
                reason: format!("{} is missing", file.path.display()),
            }),
        }
    }

    fn snapshot_resource(
        &self,
        path: &Path,
        task_id: Option<weir_model::TaskId>,
    ) -> Result<FileResource> {
        let (size, md5) = snapshot(path)?;
        Ok(FileResource {
            id: FileId::new(),
            task_id,
            path: path.to_path_buf(),
            size,
            md5,
            registered_at: Utc::now(),
            description: None,
        })
    }
}

/// Size and md5 of the file at `path`.
pub(crate) fn snapshot(path: &Path) -> Result<(u64, String)> {
    let size = fs::metadata(path)?.len();
    Ok((size, file_md5(path)?))
}

pub(crate) fn file_md5(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
