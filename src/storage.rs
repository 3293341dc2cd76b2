use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{ProvisionError, Result};

/// The three files produced by provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    PrivateKey,
    Certificate,
    CaBundle,
}

impl Artifact {
    pub const ALL: [Artifact; 3] = [Artifact::PrivateKey, Artifact::Certificate, Artifact::CaBundle];
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStatus {
    pub artifact: Artifact,
    pub path: PathBuf,
    pub present: bool,
}

/// Owner of the certificate directory. Every write and delete goes through
/// here so that they are serialized by `write_lock`.
#[derive(Debug)]
pub struct CertStore {
    dir: PathBuf,
    key_path: PathBuf,
    cert_path: PathBuf,
    ca_path: PathBuf,
    write_lock: Mutex<()>,
}

impl CertStore {
    pub fn new(cfg: &StorageConfig) -> Self {
        Self {
            dir: cfg.dir.clone(),
            key_path: cfg.dir.join(&cfg.key_file),
            cert_path: cfg.dir.join(&cfg.cert_file),
            ca_path: cfg.dir.join(&cfg.ca_file),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: Artifact) -> &Path {
        match artifact {
            Artifact::PrivateKey => &self.key_path,
            Artifact::Certificate => &self.cert_path,
            Artifact::CaBundle => &self.ca_path,
        }
    }

    pub fn exists(&self, artifact: Artifact) -> bool {
        self.path(artifact).is_file()
    }

    pub fn status(&self) -> Vec<ArtifactStatus> {
        Artifact::ALL
            .iter()
            .map(|&artifact| ArtifactStatus {
                artifact,
                path: self.path(artifact).to_path_buf(),
                present: self.exists(artifact),
            })
            .collect()
    }

    /// Read an artifact. `Ok(None)` when the file does not exist yet.
    pub fn read(&self, artifact: Artifact) -> Result<Option<Vec<u8>>> {
        let path = self.path(artifact);
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProvisionError::io(path, e)),
        }
    }

    /// Create the directory if needed and atomically replace the artifact.
    pub fn write(&self, artifact: Artifact, contents: &[u8]) -> Result<()> {
        let _guard = self.lock();
        self.write_locked(artifact, contents)
    }

    /// Write the artifact only if it is absent. Returns false if it already existed.
    pub fn write_new(&self, artifact: Artifact, contents: &[u8]) -> Result<bool> {
        let _guard = self.lock();
        if self.exists(artifact) {
            return Ok(false);
        }
        self.write_locked(artifact, contents)?;
        Ok(true)
    }

    fn write_locked(&self, artifact: Artifact, contents: &[u8]) -> Result<()> {
        self.ensure_dir()?;

        let path = self.path(artifact);
        let tmp = tmp_path(path);
        write_tmp(&tmp, contents, artifact == Artifact::PrivateKey)
            .map_err(|e| ProvisionError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| ProvisionError::io(path, e))?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Delete every artifact. Files that are already gone are skipped.
    pub fn remove_all(&self) -> Result<()> {
        let _guard = self.lock();
        for artifact in Artifact::ALL {
            let path = self.path(artifact);
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ProvisionError::io(path, e)),
            }
        }
        Ok(())
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ProvisionError::io(&self.dir, e))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is (), so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Key material is created 0600 so it is never readable by others, even
/// before the rename. A leftover temp file is removed first so its mode is
/// not inherited.
fn write_tmp(tmp: &Path, contents: &[u8], private: bool) -> std::io::Result<()> {
    match std::fs::remove_file(tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(tmp)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
pub(crate) fn test_store(dir: &Path) -> CertStore {
    CertStore::new(&StorageConfig {
        dir: dir.join("lutron"),
        ..StorageConfig::default()
    })
}
