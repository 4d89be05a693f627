// src/sys/credentials.rs

use async_trait::async_trait;
use std::ffi::OsStr;
use std::fs as std_fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tokio::fs as tokio_fs;
use tokio::process::Command;

use crate::config::CommandSpec;
use crate::error::{RelayError, Result};
use crate::sys::job::private_dir;
use crate::sys::secrets::Credential;
use crate::sys::traits::{CredentialBundle, CredentialStager, StagedCredentials};

pub const AUTHORIZED_KEYS_FILE: &str = "authorized_keys";
pub const ENCRYPTED_KEY_FILE: &str = "id_ansible_runner_encrypted";
pub const DECRYPTED_KEY_FILE: &str = "id_ansible_runner";

/// Decrypts keys with `ssh-keygen -p`, rewriting the file in place as an
/// unencrypted PEM.
pub struct SshKeygenStager {
    keygen: CommandSpec,
}

impl SshKeygenStager {
    pub fn new(keygen: CommandSpec) -> Self {
        Self { keygen }
    }

    async fn decrypt_in_place(&self, key_path: &Path, passphrase: &Credential) -> Result<()> {
        let mut cmd = Command::new(&self.keygen.program);
        cmd.args(&self.keygen.args).arg("-p").arg("-P");
        // The argv copy is not zeroized; it lives until `cmd` drops at the
        // end of this call.
        passphrase.use_secret(|secret| {
            cmd.arg(OsStr::from_bytes(secret));
        });
        cmd.arg("-N").arg("").arg("-f").arg(key_path).arg("-m").arg("PEM");

        let output = cmd.output().await.map_err(|e| RelayError::Launch {
            program: self.keygen.program.clone(),
            source: e,
        })?;

        if !output.status.success() {
            // stderr is not logged.
            tracing::warn!(
                exit_code = output.status.code(),
                "Key decryption rejected by {}",
                self.keygen.program
            );
            return Err(RelayError::Decryption {
                exit_code: output.status.code(),
            });
        }

        Ok(())
    }
}

/// Writes `contents` to a fresh file that is 0600 from the moment it exists.
fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = std_fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600) // rw-------
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

async fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    let mut perms = tokio_fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio_fs::set_permissions(path, perms).await
}

#[async_trait]
impl CredentialStager for SshKeygenStager {
    async fn stage(&self, ssh_dir: &Path, bundle: CredentialBundle) -> Result<StagedCredentials> {
        let CredentialBundle {
            public_keys,
            private_key,
            passphrase,
        } = bundle;

        private_dir(ssh_dir, true)
            .await
            .map_err(|e| RelayError::io("Failed to create SSH directory", e))?;

        let staged = StagedCredentials {
            authorized_keys: ssh_dir.join(AUTHORIZED_KEYS_FILE),
            encrypted_key: ssh_dir.join(ENCRYPTED_KEY_FILE),
            decrypted_key: ssh_dir.join(DECRYPTED_KEY_FILE),
        };

        // 1. Public keys, kept for the job's own record.
        write_owner_only(&staged.authorized_keys, public_keys.as_bytes())
            .map_err(|e| RelayError::io("Failed to write authorized_keys", e))?;

        // 2. 🚨 CRITICAL SECURITY BOUNDARY 🚨
        // Synchronous std::fs inside the closure: the exposed slice must not
        // be held across an `.await`.
        let write_result = private_key.use_secret(|secret| write_owner_only(&staged.encrypted_key, secret));
        private_key.destroy();

        if let Err(e) = write_result {
            let _ = tokio_fs::remove_file(&staged.encrypted_key).await;
            return Err(RelayError::io("Failed to write encrypted private key", e));
        }

        // 3. Decrypt. The passphrase is scrubbed as soon as keygen returns.
        let decrypted = self.decrypt_in_place(&staged.encrypted_key, &passphrase).await;
        passphrase.destroy();

        if let Err(e) = decrypted {
            // The encrypted copy must not outlive a failed request.
            let _ = tokio_fs::remove_file(&staged.encrypted_key).await;
            return Err(e);
        }

        // 4. Publish the decrypted key under its own name.
        tokio_fs::copy(&staged.encrypted_key, &staged.decrypted_key)
            .await
            .map_err(|e| RelayError::io("Failed to copy decrypted private key", e))?;
        restrict_to_owner(&staged.decrypted_key)
            .await
            .map_err(|e| RelayError::io("Failed to secure decrypted private key", e))?;

        Ok(staged)
    }
}
