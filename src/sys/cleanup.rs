// src/sys/cleanup.rs

use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

use crate::sys::job::Job;
use crate::sys::traits::StagedCredentials;

/// Removes transient credential material once a job is packaged.
///
/// The encrypted key always goes. Unless `retain` is set, the rest of the
/// job's working directory (decrypted key, authorized_keys, inventory)
/// goes with it. Returns the number of paths actually removed.
pub async fn scrub_job(job: &Job, staged: Option<&StagedCredentials>, retain: bool) -> usize {
    let mut removed = 0;

    if let Some(staged) = staged {
        if remove_file_if_present(&staged.encrypted_key).await {
            removed += 1;
        }
    }

    if !retain && remove_dir_if_present(&job.work_dir).await {
        removed += 1;
    }

    removed
}

async fn remove_file_if_present(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            // Keep going: the job result is already on disk.
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove credential file");
            false
        }
    }
}

async fn remove_dir_if_present(path: &Path) -> bool {
    match fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to purge job workspace");
            false
        }
    }
}
