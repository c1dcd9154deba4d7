use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{GrouperError, GrouperResult};

/// Exclusive marker file held for the duration of a pass. Removed on drop.
#[derive(Debug)]
pub struct PassLock {
    path: PathBuf,
}

impl PassLock {
    pub fn acquire(path: impl AsRef<Path>) -> GrouperResult<Self> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(error) = writeln!(file, "{}", std::process::id()) {
                    warn!(path = %path.display(), %error, "failed to record pass lock owner");
                }
                Ok(Self { path })
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                Err(GrouperError::PassInProgress { path })
            }
            Err(source) => Err(GrouperError::Lock { path, source }),
        }
    }

    /// Lock file kept next to a database: `<db file name>.lock`.
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut file_name = db_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "sieve".into());
        file_name.push(".lock");
        db_path.with_file_name(file_name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PassLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %error, "failed to release pass lock");
        }
    }
}
