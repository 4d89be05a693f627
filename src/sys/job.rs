// src/sys/job.rs

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use tokio::fs;

use crate::error::{RelayError, Result};

/// Literal placed between the client tag and the timestamp.
pub const JOB_ID_INFIX: &str = "validation_results";
pub const DEFAULT_CLIENT: &str = "client";

const MAX_ID_ATTEMPTS: u32 = 100;

// The client tag and job ids become path components, so neither may carry
// separators or start with a dot.
static CLIENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap());
static JOB_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Resolves the optional client field to the tag used in the job id.
pub fn client_tag(raw: Option<&str>) -> Result<String> {
    let tag = match raw.map(str::trim) {
        None | Some("") => return Ok(DEFAULT_CLIENT.to_string()),
        Some(tag) => tag,
    };
    if !CLIENT_PATTERN.is_match(tag) {
        return Err(RelayError::invalid(
            "client",
            "only letters, digits, '.', '_' and '-' are allowed (max 64 chars)",
        ));
    }
    Ok(tag.to_string())
}

pub fn is_valid_job_id(id: &str) -> bool {
    JOB_ID_PATTERN.is_match(id)
}

/// `<client>_validation_results_<YYYY-MM-DD_HH-MM-SS>`
pub fn job_id(client: &str, at: NaiveDateTime) -> String {
    format!("{}_{}_{}", client, JOB_ID_INFIX, at.format("%Y-%m-%d_%H-%M-%S"))
}

/// One pipeline run. Owns a private working directory for credentials and
/// the inventory, plus the output directory and archive path under logs.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub client: String,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_path: PathBuf,
}

impl Job {
    /// Reserves a job id by exclusively creating its working directory.
    /// A second request in the same second for the same client gets `_2`,
    /// `_3`, ... appended.
    pub async fn create(
        work_root: &Path,
        logs_dir: &Path,
        client: &str,
        at: NaiveDateTime,
    ) -> Result<Self> {
        let base = job_id(client, at);

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = if attempt == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };

            let output_dir = logs_dir.join(&id);
            let archive_path = logs_dir.join(format!("{}.zip", id));
            if fs::try_exists(&output_dir).await.unwrap_or(false)
                || fs::try_exists(&archive_path).await.unwrap_or(false)
            {
                continue;
            }

            let work_dir = work_root.join(&id);
            match private_dir(&work_dir, false).await {
                Ok(()) => {
                    return Ok(Self {
                        id,
                        client: client.to_string(),
                        work_dir,
                        output_dir,
                        archive_path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(RelayError::io(
                        format!("Failed to create job directory {}", work_dir.display()),
                        e,
                    ));
                }
            }
        }

        Err(RelayError::io(
            format!("Exhausted job ids for {}", base),
            std::io::Error::from(ErrorKind::AlreadyExists),
        ))
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.work_dir.join("ssh")
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.work_dir.join("inventory.ini")
    }

    pub async fn create_output_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            RelayError::io(
                format!("Failed to create output directory {}", self.output_dir.display()),
                e,
            )
        })
    }
}

/// Creates a directory with mode 0700 (rwx------).
pub async fn private_dir(path: &Path, recursive: bool) -> std::io::Result<()> {
    fs::DirBuilder::new()
        .recursive(recursive)
        .mode(0o700)
        .create(path)
        .await
}
