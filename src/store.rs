//! Workload descriptor store
//!
//! A single JSON document holding every descriptor. Each mutation is a
//! read-modify-write of the whole collection; callers serialize writers
//! (see [`crate::controller`]). Two processes writing the same document can
//! still lose an update.

use crate::error::{FleetError, FleetResult};
use crate::workload::Workload;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct WorkloadStore {
    path: PathBuf,
}

impl WorkloadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every descriptor. A missing document is initialized to `[]`.
    pub async fn read_all(&self) -> FleetResult<Vec<Workload>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Initializing empty workload store");
                self.write_all(&[]).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(FleetError::store_io(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let mut workloads: Vec<Workload> =
            serde_json::from_slice(&bytes).map_err(|e| FleetError::store_io(&self.path, e))?;
        for workload in &mut workloads {
            workload.canonicalize();
        }

        debug!(path = %self.path.display(), count = workloads.len(), "Read workload store");
        Ok(workloads)
    }

    /// Replace the whole collection. Written to a sibling temp file and
    /// renamed so readers never observe a partial document.
    pub async fn write_all(&self, workloads: &[Workload]) -> FleetResult<()> {
        let json = serde_json::to_vec_pretty(workloads)
            .map_err(|e| FleetError::store_io(&self.path, e))?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| FleetError::store_io(&self.path, e))?;

        debug!(path = %self.path.display(), count = workloads.len(), "Wrote workload store");
        Ok(())
    }

    pub async fn find(&self, id: &str) -> FleetResult<Option<Workload>> {
        Ok(self.read_all().await?.into_iter().find(|w| w.id == id))
    }
}

/// Write `contents` to `path` via a temp file in the same directory
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
