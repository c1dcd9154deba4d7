use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::atomic_io::write_text_atomic;
use crate::{ensure_forward, Checkpoint, CheckpointStore, CursorPosition, StoreResult};

/// Checkpoint kept as a JSON document, replaced atomically on every advance.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> StoreResult<Checkpoint> {
        if !self.path.exists() {
            return Ok(Checkpoint::beginning());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> StoreResult<Checkpoint> {
        self.read()
    }

    #[instrument(skip(self, position), fields(path = %self.path.display(), position = %position))]
    async fn advance(&self, position: CursorPosition) -> StoreResult<Checkpoint> {
        let stored = self.read()?;
        ensure_forward(&stored, &position)?;
        let checkpoint = Checkpoint::at(position);
        let payload = serde_json::to_string_pretty(&checkpoint)?;
        write_text_atomic(&self.path, &payload)?;
        debug!("checkpoint file replaced");
        Ok(checkpoint)
    }
}
