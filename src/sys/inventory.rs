// src/sys/inventory.rs

use std::fmt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{RelayError, Result};

/// One host line in an INI-style Ansible inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub address: String,
    pub user: String,
    pub key_path: PathBuf,
}

impl fmt::Display for InventoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ansible_user={} ansible_ssh_private_key_file={}",
            self.address,
            self.user,
            self.key_path.display()
        )
    }
}

/// Trimmed, non-blank lines in input order.
pub fn parse_targets(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty()).collect()
}

/// Binds every target to `user` and `key_path`.
///
/// Whitespace inside an address or the user would smuggle extra host
/// variables into the inventory line, so both are rejected.
pub fn build_entries(targets: &[&str], user: &str, key_path: &Path) -> Result<Vec<InventoryEntry>> {
    if targets.is_empty() {
        return Err(RelayError::EmptyTargetList);
    }

    let user = user.trim();
    if user.is_empty() || user.chars().any(char::is_whitespace) {
        return Err(RelayError::invalid("ansible_user", "must be a single non-empty word"));
    }

    targets
        .iter()
        .map(|address| {
            if address.chars().any(char::is_whitespace) {
                return Err(RelayError::invalid(
                    "target_ips",
                    format!("'{}' is not a single address", address),
                ));
            }
            Ok(InventoryEntry {
                address: address.to_string(),
                user: user.to_string(),
                key_path: key_path.to_path_buf(),
            })
        })
        .collect()
}

pub fn render(entries: &[InventoryEntry]) -> String {
    entries.iter().map(|entry| format!("{}\n", entry)).collect()
}

/// Writes the rendered inventory with mode 0600.
pub async fn write_inventory(path: &Path, entries: &[InventoryEntry]) -> Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600); // rw-------

    let mut file = tokio::fs::OpenOptions::from(opts)
        .open(path)
        .await
        .map_err(|e| RelayError::io(format!("Failed to open inventory {}", path.display()), e))?;

    file.write_all(render(entries).as_bytes())
        .await
        .map_err(|e| RelayError::io("Failed to write inventory", e))?;
    file.flush()
        .await
        .map_err(|e| RelayError::io("Failed to flush inventory", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "/jobs/acme/ssh/id_ansible_runner";

    #[test]
    fn one_line_per_non_blank_address_in_order() {
        let text = "\n  10.0.0.3 \n\n10.0.0.1\r\nhost-b.example\n   \n";
        let targets = parse_targets(text);
        let entries = build_entries(&targets, "ubuntu", Path::new(KEY)).unwrap();

        let rendered = render(&entries);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines,
            vec![
                "10.0.0.3 ansible_user=ubuntu ansible_ssh_private_key_file=/jobs/acme/ssh/id_ansible_runner",
                "10.0.0.1 ansible_user=ubuntu ansible_ssh_private_key_file=/jobs/acme/ssh/id_ansible_runner",
                "host-b.example ansible_user=ubuntu ansible_ssh_private_key_file=/jobs/acme/ssh/id_ansible_runner",
            ]
        );
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn line_count_matches_address_count() {
        for n in [1usize, 2, 7, 40] {
            let text: String = (0..n).map(|i| format!("192.168.1.{}\n\n", i)).collect();
            let entries = build_entries(&parse_targets(&text), "root", Path::new(KEY)).unwrap();
            assert_eq!(render(&entries).lines().count(), n);
            assert_eq!(entries[n - 1].address, format!("192.168.1.{}", n - 1));
        }
    }

    #[test]
    fn blank_input_is_empty_target_list() {
        let targets = parse_targets(" \n\n\t\n");
        assert!(matches!(
            build_entries(&targets, "ubuntu", Path::new(KEY)),
            Err(RelayError::EmptyTargetList)
        ));
    }

    #[test]
    fn embedded_whitespace_is_rejected() {
        let err = build_entries(&["10.0.0.1 ansible_become=true"], "ubuntu", Path::new(KEY)).unwrap_err();
        assert!(matches!(err, RelayError::InvalidField { field: "target_ips", .. }));

        let err = build_entries(&["10.0.0.1"], "ubuntu admin", Path::new(KEY)).unwrap_err();
        assert!(matches!(err, RelayError::InvalidField { field: "ansible_user", .. }));
    }

    #[tokio::test]
    async fn inventory_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.ini");
        let entries = build_entries(&["10.0.0.9"], "ops", Path::new(KEY)).unwrap();

        write_inventory(&path, &entries).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, render(&entries));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
