// src/config.rs

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// An external program plus any leading arguments, split from a single
/// whitespace-separated setting such as `RELAY_PLAYBOOK_COMMAND`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    // 🛡️ Network boundary
    pub bind_addr: SocketAddr,

    // 📂 Filesystem layout
    pub static_dir: PathBuf,
    pub work_root: PathBuf,
    pub logs_dir: PathBuf,

    // ⚙️ External tools
    pub playbook_path: PathBuf,
    pub playbook_command: CommandSpec,
    pub keygen_command: CommandSpec,
    pub remote_output_dir: String,

    // 🧹 Job lifecycle
    pub job_timeout: Option<Duration>,
    pub retain_credentials: bool,

    pub log_format: LogFormat,
}

impl RelayConfig {
    pub fn load() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. `load()` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = get("RELAY_BIND_ADDR", "0.0.0.0:8000")
            .parse::<SocketAddr>()
            .map_err(|e| format!("RELAY_BIND_ADDR must be a socket address: {}", e))?;

        let playbook_command = CommandSpec::parse(&get("RELAY_PLAYBOOK_COMMAND", "ansible-playbook"))
            .ok_or("RELAY_PLAYBOOK_COMMAND cannot be empty")?;
        let keygen_command = CommandSpec::parse(&get("RELAY_KEYGEN_COMMAND", "ssh-keygen"))
            .ok_or("RELAY_KEYGEN_COMMAND cannot be empty")?;

        // 0 and unset both mean "no deadline".
        let job_timeout = match lookup("RELAY_JOB_TIMEOUT_SECS") {
            None => None,
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("RELAY_JOB_TIMEOUT_SECS must be a whole number of seconds, got '{}'", raw))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        let retain_credentials = match get("RELAY_RETAIN_CREDENTIALS", "false").trim() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" | "" => false,
            other => return Err(format!("RELAY_RETAIN_CREDENTIALS must be true or false, got '{}'", other)),
        };

        let log_format = match get("RELAY_LOG_FORMAT", "pretty").trim() {
            "json" => LogFormat::Json,
            "pretty" | "" => LogFormat::Pretty,
            other => return Err(format!("RELAY_LOG_FORMAT must be 'pretty' or 'json', got '{}'", other)),
        };

        Ok(Self {
            bind_addr,
            static_dir: get("RELAY_STATIC_DIR", "/app/static").into(),
            work_root: get("RELAY_WORK_ROOT", "/var/lib/provision-relay/jobs").into(),
            logs_dir: get("RELAY_LOGS_DIR", "/app/logs").into(),
            playbook_path: get("RELAY_PLAYBOOK", "/app/ansible/reserved_instance.yml").into(),
            playbook_command,
            keygen_command,
            remote_output_dir: get("RELAY_REMOTE_OUTPUT_DIR", "/tmp/validation_results"),
            job_timeout,
            retain_credentials,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<RelayConfig, String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_legacy_layout() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.logs_dir, PathBuf::from("/app/logs"));
        assert_eq!(config.playbook_path, PathBuf::from("/app/ansible/reserved_instance.yml"));
        assert_eq!(config.playbook_command.program, "ansible-playbook");
        assert!(config.playbook_command.args.is_empty());
        assert_eq!(config.keygen_command.program, "ssh-keygen");
        assert_eq!(config.remote_output_dir, "/tmp/validation_results");
        assert_eq!(config.job_timeout, None);
        assert!(!config.retain_credentials);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn command_settings_split_on_whitespace() {
        let config = config_from(&[("RELAY_KEYGEN_COMMAND", "sh /opt/fake-keygen.sh")]).unwrap();
        assert_eq!(
            config.keygen_command,
            CommandSpec {
                program: "sh".into(),
                args: vec!["/opt/fake-keygen.sh".into()],
            }
        );
    }

    #[test]
    fn blank_command_is_rejected() {
        let err = config_from(&[("RELAY_PLAYBOOK_COMMAND", "   ")]).unwrap_err();
        assert!(err.contains("RELAY_PLAYBOOK_COMMAND"));
    }

    #[test]
    fn timeout_zero_disables_deadline() {
        let config = config_from(&[("RELAY_JOB_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.job_timeout, None);

        let config = config_from(&[("RELAY_JOB_TIMEOUT_SECS", "90")]).unwrap();
        assert_eq!(config.job_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn malformed_values_fail_startup() {
        assert!(config_from(&[("RELAY_JOB_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config_from(&[("RELAY_BIND_ADDR", "not-an-addr")]).is_err());
        assert!(config_from(&[("RELAY_RETAIN_CREDENTIALS", "maybe")]).is_err());
        assert!(config_from(&[("RELAY_LOG_FORMAT", "xml")]).is_err());
    }
}
