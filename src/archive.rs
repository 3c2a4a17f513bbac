//! Compress and extract archives inside a server's data directory.
//!
//! Work is done by the system `zip`, `unzip` and `tar` tools and runs as a
//! background job, one per server at a time.

use crate::definition::DefinitionArtifacts;
use crate::error::{FleetError, FleetResult};
use crate::jobs::{JobManager, JobRecord};
use anyhow::Context;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct CompressRequest {
    /// File or directory relative to the server data directory
    pub path: String,
    /// Archive file name; defaults to `{basename}.zip` next to the target
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractRequest {
    /// Archive relative to the server data directory
    pub path: String,
    /// Destination directory; defaults to the archive's directory
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressPlan {
    pub target: PathBuf,
    pub archive: PathBuf,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractPlan {
    pub archive: PathBuf,
    pub destination: PathBuf,
    pub format: ArchiveFormat,
}

/// Join `relative` onto `root`, refusing anything that could leave `root`
pub fn resolve_inside(root: &Path, relative: &str) -> FleetResult<PathBuf> {
    let relative = Path::new(relative.trim());
    let mut resolved = root.to_path_buf();

    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FleetError::Validation(format!(
                    "path '{}' is outside the server directory",
                    relative.display()
                )));
            }
        }
    }

    Ok(resolved)
}

pub fn plan_compress(root: &Path, request: &CompressRequest) -> FleetResult<CompressPlan> {
    let target = resolve_inside(root, &request.path)?;
    if target == root {
        return Err(FleetError::Validation(
            "cannot compress the whole server directory into itself".to_string(),
        ));
    }

    let filename = match request.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => {
            let plain = Path::new(name)
                .file_name()
                .map(|f| f == name)
                .unwrap_or(false);
            if !plain {
                return Err(FleetError::Validation(format!(
                    "archive name '{}' must be a plain file name",
                    name
                )));
            }
            name.to_string()
        }
        None => format!(
            "{}.zip",
            target
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string())
        ),
    };

    let parent = target.parent().unwrap_or(root);
    Ok(CompressPlan {
        archive: parent.join(&filename),
        target,
        filename,
    })
}

pub fn plan_extract(root: &Path, request: &ExtractRequest) -> FleetResult<ExtractPlan> {
    let archive = resolve_inside(root, &request.path)?;
    let format = ArchiveFormat::detect(&archive).ok_or_else(|| {
        FleetError::Validation(format!("unsupported archive format: {}", request.path))
    })?;

    let destination = match request.destination.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(dest) => resolve_inside(root, dest)?,
        None => archive.parent().unwrap_or(root).to_path_buf(),
    };

    Ok(ExtractPlan {
        archive,
        destination,
        format,
    })
}

async fn run_tool(program: &str, args: &[&OsStr], cwd: &Path) -> anyhow::Result<()> {
    debug!(program, cwd = %cwd.display(), "Running archive tool");

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to run {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} failed ({}): {}", program, output.status, stderr.trim());
    }

    Ok(())
}

/// Zip a file, or the contents of a directory, next to the target
pub async fn compress(plan: CompressPlan) -> anyhow::Result<serde_json::Value> {
    let metadata = tokio::fs::metadata(&plan.target)
        .await
        .with_context(|| format!("{} does not exist", plan.target.display()))?;

    let archive = plan.archive.as_os_str();
    if metadata.is_dir() {
        run_tool("zip", &[OsStr::new("-r"), OsStr::new("-q"), archive, OsStr::new(".")], &plan.target).await?;
    } else {
        let parent = plan.target.parent().context("file has no parent directory")?;
        let file = plan.target.file_name().context("file has no name")?;
        run_tool("zip", &[OsStr::new("-q"), archive, file], parent).await?;
    }

    let size = tokio::fs::metadata(&plan.archive)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(serde_json::json!({ "filename": plan.filename, "size": size }))
}

pub async fn extract(plan: ExtractPlan) -> anyhow::Result<serde_json::Value> {
    tokio::fs::create_dir_all(&plan.destination)
        .await
        .with_context(|| format!("cannot create {}", plan.destination.display()))?;

    let archive = plan.archive.as_os_str();
    let destination = plan.destination.as_os_str();
    match plan.format {
        ArchiveFormat::Zip => {
            run_tool(
                "unzip",
                &[OsStr::new("-o"), OsStr::new("-q"), archive, OsStr::new("-d"), destination],
                &plan.destination,
            )
            .await?
        }
        ArchiveFormat::TarGz => {
            run_tool("tar", &[OsStr::new("-xzf"), archive, OsStr::new("-C"), destination], &plan.destination)
                .await?
        }
        ArchiveFormat::Tar => {
            run_tool("tar", &[OsStr::new("-xf"), archive, OsStr::new("-C"), destination], &plan.destination)
                .await?
        }
    }

    let filename = plan
        .archive
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(serde_json::json!({ "filename": filename }))
}

/// Archive jobs scoped to server data directories
pub struct ArchiveService {
    artifacts: DefinitionArtifacts,
    jobs: Arc<JobManager>,
}

impl ArchiveService {
    pub fn new(artifacts: DefinitionArtifacts, jobs: Arc<JobManager>) -> Self {
        Self { artifacts, jobs }
    }

    pub fn compress(&self, workload_id: &str, request: &CompressRequest) -> FleetResult<JobRecord> {
        let root = self.artifacts.game_data_dir(workload_id);
        let plan = plan_compress(&root, request)?;
        self.jobs.submit(workload_id, "compress", compress(plan))
    }

    pub fn extract(&self, workload_id: &str, request: &ExtractRequest) -> FleetResult<JobRecord> {
        let root = self.artifacts.game_data_dir(workload_id);
        let plan = plan_extract(&root, request)?;
        self.jobs.submit(workload_id, "extract", extract(plan))
    }

    pub fn status(&self, job_id: &str) -> FleetResult<JobRecord> {
        self.jobs.get(job_id)
    }
}
