//! Persisted uplink credentials.
//!
//! The file holds two newline terminated lines: the network name, then the secret.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Network name and secret used to join the uplink.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub network_name: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(network_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            secret: secret.into(),
        }
    }

    /// Both fields must be present for a join to be attempted.
    pub fn is_complete(&self) -> bool {
        !self.network_name.is_empty() && !self.secret.is_empty()
    }
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("network_name", &self.network_name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The credentials file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credentials. A missing file is not an error.
    pub fn load(&self) -> Result<Option<Credentials>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no stored credentials");
                return Ok(None);
            }
            Err(err) => return Err(Error::Persistence(err)),
        };
        let mut lines = contents.lines();
        let network_name = lines.next().unwrap_or_default().trim();
        let secret = lines.next().unwrap_or_default().trim();
        Ok(Some(Credentials::new(network_name, secret)))
    }

    /// Replace the stored credentials.
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let contents = format!("{}\n{}\n", credentials.network_name, credentials.secret);
        fs::write(&staging, contents).map_err(Error::Persistence)?;
        fs::rename(&staging, &self.path).map_err(Error::Persistence)?;
        info!(
            path = %self.path.display(),
            network = %credentials.network_name,
            "credentials saved"
        );
        Ok(())
    }

    /// Remove the stored credentials. Clearing an absent file succeeds.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "credentials cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Persistence(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("wifi_credentials.txt"))
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load().unwrap().is_none());
    }

    #[test]
    fn saved_credentials_are_two_lines() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&Credentials::new("lab", "hunter22")).unwrap();

        assert_eq!(fs::read_to_string(store.path()).unwrap(), "lab\nhunter22\n");
        assert_eq!(
            store.load().unwrap(),
            Some(Credentials::new("lab", "hunter22"))
        );
    }

    #[test]
    fn load_trims_line_endings() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.path(), "lab \r\nhunter22\r\n").unwrap();
        assert_eq!(
            store.load().unwrap(),
            Some(Credentials::new("lab", "hunter22"))
        );
    }

    #[test]
    fn missing_secret_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.path(), "lab\n").unwrap();
        let credentials = store.load().unwrap().unwrap();
        assert!(!credentials.is_complete());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.clear().unwrap();

        store.save(&Credentials::new("lab", "hunter22")).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn unwritable_location_is_a_persistence_error() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("missing").join("creds.txt"));
        let result = store.save(&Credentials::new("lab", "hunter22"));
        assert!(matches!(result, Err(Error::Persistence(_))));
    }

    #[test]
    fn debug_hides_the_secret() {
        let rendered = format!("{:?}", Credentials::new("lab", "hunter22"));
        assert!(rendered.contains("lab"));
        assert!(!rendered.contains("hunter22"));
    }
}
