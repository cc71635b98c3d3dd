//! Temporary credentials file for OpenVPN's `--auth-user-pass`
//!
//! The file only exists while an OpenVPN process that reads it is running.
//! [`CredentialStore::save`] hands out a [`CredentialFile`] guard that deletes
//! the file again when released or dropped, and the store can't hand out a
//! second guard while the first is alive.

use crate::auth::Credential;
use crate::platform;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to write credentials file {}: {source}", .path.display())]
    WriteError { path: PathBuf, source: io::Error },
    #[error("Failed to delete credentials file {}: {source}", .path.display())]
    DeleteError { path: PathBuf, source: io::Error },
}

pub struct CredentialStore {
    path: PathBuf,
    mode: u32,
}

impl CredentialStore {
    pub fn new(path: PathBuf, mode: u32) -> Self {
        Self { path, mode }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the credential to disk, replacing any previous content
    ///
    /// The content goes to a sibling temp file created with the configured
    /// mode, which is then renamed over the target, so readers see either
    /// the whole file or nothing.
    pub fn save(&mut self, credential: Credential) -> Result<CredentialFile<'_>, CredentialError> {
        let write_error = |source| CredentialError::WriteError {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_error)?;
            }
        }

        let temp_path = self.temp_path();
        // Leftover from an interrupted save
        let _ = platform::remove_file(&temp_path);

        let contents = credential.to_auth_user_pass();
        let result = platform::create_restricted(&temp_path, contents.as_bytes(), self.mode)
            .and_then(|()| platform::replace_file(&temp_path, &self.path))
            .and_then(|()| platform::set_mode(&self.path, self.mode));

        if let Err(source) = result {
            let _ = platform::remove_file(&temp_path);
            let _ = platform::remove_file(&self.path);
            return Err(write_error(source));
        }

        debug!("Credentials written to {}", self.path.display());
        Ok(CredentialFile {
            store: self,
            released: false,
        })
    }

    /// Delete the credentials file; a missing file is fine
    pub fn clear(&self) -> Result<(), CredentialError> {
        match platform::remove_file(&self.path) {
            Ok(()) => {
                debug!("Credentials file {} deleted", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CredentialError::DeleteError {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// A credentials file on disk, deleted when this guard goes away
pub struct CredentialFile<'a> {
    store: &'a mut CredentialStore,
    released: bool,
}

impl CredentialFile<'_> {
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Delete the file and report whether that worked
    pub fn release(mut self) -> Result<(), CredentialError> {
        self.released = true;
        self.store.clear()
    }
}

impl Drop for CredentialFile<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.clear() {
            warn!("{}", e);
        }
    }
}
