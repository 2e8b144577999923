//! JSON / YAML export of job snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::Job;
use crate::error::RuntimeResult;

/// Output document format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Yaml,
}

impl ExportFormat {
    /// `.yaml` / `.yml` select YAML; everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ExportFormat::Yaml
            }
            _ => ExportFormat::Json,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "yaml" | "yml" => Some(ExportFormat::Yaml),
            _ => None,
        }
    }
}

/// Outcome of a single-job export.
#[derive(Debug, Clone, PartialEq)]
pub enum JobExport {
    /// The snapshot was written to this file.
    Written(PathBuf),
    /// No path was given; the serialized snapshot is returned instead.
    Data(Value),
}

#[derive(Serialize)]
struct JobRecord<'a> {
    #[serde(flatten)]
    job: &'a Job,
    duration_ms: Option<i64>,
}

/// Full snapshot of one job including the computed `duration_ms`.
pub(crate) fn job_record(job: &Job) -> RuntimeResult<Value> {
    let record = JobRecord {
        job,
        duration_ms: job.duration_ms(),
    };
    Ok(serde_json::to_value(record)?)
}

pub(crate) fn jobs_document(jobs: &[Job]) -> RuntimeResult<Value> {
    let records = jobs.iter().map(job_record).collect::<RuntimeResult<Vec<_>>>()?;
    Ok(json!({
        "total_jobs": records.len(),
        "jobs": records,
    }))
}

/// Write `document` to `path`, creating parent directories as needed.
pub(crate) fn write_document(path: &Path, document: &Value, format: ExportFormat) -> RuntimeResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = match format {
        ExportFormat::Json => serde_json::to_string_pretty(document)?,
        ExportFormat::Yaml => serde_yaml::to_string(document)?,
    };
    std::fs::write(path, content)?;
    Ok(())
}
