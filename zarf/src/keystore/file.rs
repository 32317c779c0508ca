//! Filesystem keystore: one wrapped DEK per owner-only file.

use super::Keystore;
use crate::error::Error;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

/// Keystore backed by a single file holding the wrapped DEK.
///
/// Files must be owner-only: reads reject any group or world permission
/// bits before touching the content, and writes land atomically (temp
/// file created 0600 in the same directory, content written, mode
/// tightened to 0400, renamed over the destination).
pub struct FileKeystore {
    path: PathBuf,
}

impl FileKeystore {
    /// Creates a keystore for the given path. The file need not exist
    /// yet; it is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn check_permissions(&self) -> Result<(), Error> {
        let metadata = fs::metadata(&self.path).map_err(|e| {
            Error::Keystore(format!("cannot stat {}: {e}", self.path.display()))
        })?;
        let mode = metadata.permissions().mode() & 0o7777;
        if mode & 0o077 != 0 {
            return Err(Error::InsecurePermissions { path: self.path.clone(), mode });
        }
        Ok(())
    }

    fn write_replacing(&self, wrapped: &[u8]) -> Result<(), Error> {
        let temp = PathBuf::from(format!("{}.tmp.{}", self.path.display(), std::process::id()));
        let _ = fs::remove_file(&temp);

        let result = (|| {
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options.open(&temp).map_err(|e| {
                Error::Keystore(format!("cannot create {}: {e}", temp.display()))
            })?;
            file.write_all(wrapped)
                .and_then(|()| file.sync_all())
                .map_err(|e| Error::Keystore(format!("cannot write {}: {e}", temp.display())))?;

            #[cfg(unix)]
            file.set_permissions(fs::Permissions::from_mode(0o400)).map_err(|e| {
                Error::Keystore(format!("cannot set permissions on {}: {e}", temp.display()))
            })?;

            fs::rename(&temp, &self.path).map_err(|e| {
                Error::Keystore(format!(
                    "cannot rename {} over {}: {e}",
                    temp.display(),
                    self.path.display()
                ))
            })
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

impl Keystore for FileKeystore {
    fn read(&self) -> Result<Vec<u8>, Error> {
        #[cfg(unix)]
        self.check_permissions()?;
        fs::read(&self.path)
            .map_err(|e| Error::Keystore(format!("cannot read {}: {e}", self.path.display())))
    }

    fn write(&self, wrapped: &[u8]) -> Result<(), Error> {
        self.write_replacing(wrapped)?;
        tracing::debug!(path = %self.path.display(), "wrapped DEK written");
        Ok(())
    }
}
