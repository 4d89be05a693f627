// src/sys/traits.rs

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::sys::runner::{JobParameters, RunningJob};
use crate::sys::secrets::Credential;

// ==============================================================================
// 1. Credential Staging (Zero-Leak Auth)
// ==============================================================================

/// Everything the form submits about SSH identity.
/// 🛡️ The private key and passphrase stay inside `Credential` wrappers; the
/// stager takes the bundle by value so both are scrubbed once staging ends.
#[derive(Debug)]
pub struct CredentialBundle {
    pub public_keys: String,
    pub private_key: Credential,
    pub passphrase: Credential,
}

/// Paths left behind by a successful staging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCredentials {
    pub authorized_keys: PathBuf,
    pub encrypted_key: PathBuf,
    pub decrypted_key: PathBuf,
}

#[async_trait]
pub trait CredentialStager: Send + Sync {
    /// Writes the key material into `ssh_dir` (0600 each) and decrypts the
    /// private key in place. Wrong passphrase yields `RelayError::Decryption`.
    async fn stage(&self, ssh_dir: &Path, bundle: CredentialBundle) -> Result<StagedCredentials>;
}

// ==============================================================================
// 2. Playbook Execution (Telemetry-Aware)
// ==============================================================================

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Spawns the automation tool and hands back a live handle to its
    /// merged stdout/stderr. Never waits for the child to finish.
    async fn launch(&self, inventory: &Path, params: &JobParameters) -> Result<RunningJob>;
}

// ==============================================================================
// 3. Artifact Packaging (SLA: Post-Mortem Diagnostics)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageSummary {
    pub files: usize,
    pub bytes: u64,
}

#[async_trait]
pub trait ArtifactPackager: Send + Sync {
    /// Compresses everything under `source_dir` into `archive_path`.
    async fn package(&self, source_dir: &Path, archive_path: &Path) -> Result<PackageSummary>;
}
