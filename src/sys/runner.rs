// src/sys/runner.rs

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio_stream::Stream;

use crate::config::CommandSpec;
use crate::error::{RelayError, Result};
use crate::sys::traits::JobRunner;

/// Merged stdout/stderr of the child, one item per line (newline kept).
pub type OutputLines = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// Free-form string map handed to the playbook via `--extra-vars`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobParameters(BTreeMap<String, String>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn to_json(&self) -> String {
        // A map of strings cannot fail to serialize.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Normalizes the submitted public keys into newline-joined text with a
/// single trailing newline.
pub fn pubkey_blob(raw: &str) -> String {
    let mut blob = raw.trim().lines().collect::<Vec<_>>().join("\n");
    blob.push('\n');
    blob
}

/// A launched child whose output has not been drained yet.
pub struct RunningJob {
    pub child: Child,
    output: OutputLines,
}

impl RunningJob {
    pub fn new(child: Child, output: OutputLines) -> Self {
        Self { child, output }
    }

    pub fn into_parts(self) -> (OutputLines, Child) {
        (self.output, self.child)
    }
}

impl fmt::Debug for RunningJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningJob")
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

/// Splits any buffered reader into lines without requiring valid UTF-8.
pub fn output_lines<R>(reader: R) -> OutputLines
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut reader = reader;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => yield Ok(String::from_utf8_lossy(&buf).into_owned()),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

/// Runs `ansible-playbook <playbook> -i <inventory> --extra-vars <json>`.
pub struct AnsibleJobRunner {
    command: CommandSpec,
    playbook: PathBuf,
}

impl AnsibleJobRunner {
    pub fn new(command: CommandSpec, playbook: PathBuf) -> Self {
        Self { command, playbook }
    }

    fn launch_error(&self, source: io::Error) -> RelayError {
        RelayError::Launch {
            program: self.command.program.clone(),
            source,
        }
    }
}

#[async_trait]
impl JobRunner for AnsibleJobRunner {
    async fn launch(&self, inventory: &Path, params: &JobParameters) -> Result<RunningJob> {
        // One pipe for both streams keeps the child's own interleaving.
        let (read_end, write_end) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| self.launch_error(io::Error::from(e)))?;
        let stderr_end = write_end.try_clone().map_err(|e| self.launch_error(e))?;

        let child = {
            let mut cmd = Command::new(&self.command.program);
            cmd.args(&self.command.args)
                .arg(&self.playbook)
                .arg("-i")
                .arg(inventory)
                .arg("--extra-vars")
                .arg(params.to_json())
                .env("PYTHONUNBUFFERED", "1")
                .stdin(Stdio::null())
                .stdout(Stdio::from(write_end))
                .stderr(Stdio::from(stderr_end))
                .kill_on_drop(true);
            cmd.spawn().map_err(|e| self.launch_error(e))?
            // `cmd` drops here and closes our copies of the write end, so the
            // reader sees EOF once the child exits.
        };

        tracing::info!(
            pid = child.id(),
            program = %self.command.program,
            playbook = %self.playbook.display(),
            "Playbook started"
        );

        let receiver = pipe::Receiver::from_owned_fd(read_end).map_err(|e| self.launch_error(e))?;
        Ok(RunningJob::new(child, output_lines(BufReader::new(receiver))))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    pub(crate) fn script_runner(dir: &Path, body: &str) -> AnsibleJobRunner {
        let script = dir.join("fake-playbook.sh");
        std::fs::write(&script, body).unwrap();
        // `sh <script> <playbook> -i ...`: the playbook path lands in $1.
        AnsibleJobRunner::new(
            CommandSpec {
                program: "sh".into(),
                args: vec![script.display().to_string()],
            },
            PathBuf::from("site.yml"),
        )
    }

    async fn drain(job: RunningJob) -> (Vec<String>, std::process::ExitStatus) {
        let (mut lines, mut child) = job.into_parts();
        let mut seen = Vec::new();
        while let Some(line) = lines.next().await {
            seen.push(line.unwrap());
        }
        (seen, child.wait().await.unwrap())
    }

    #[test]
    fn pubkeys_are_normalized() {
        assert_eq!(pubkey_blob("\n  ssh-rsa A\r\nssh-ed25519 B  \n\n"), "ssh-rsa A\nssh-ed25519 B\n");
    }

    #[test]
    fn parameters_serialize_as_flat_json_object() {
        let mut params = JobParameters::new();
        params.insert("job_id", "acme_1").insert("new_user", "deploy");
        assert_eq!(params.to_json(), r#"{"job_id":"acme_1","new_user":"deploy"}"#);
    }

    #[tokio::test]
    async fn stdout_and_stderr_share_one_ordered_stream() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(
            dir.path(),
            "echo 'PLAY [all]'\necho 'fatal: unreachable' >&2\necho 'TASK [ping]'\necho 'warn' >&2\nexit 2\n",
        );

        let job = runner.launch(Path::new("inv.ini"), &JobParameters::new()).await.unwrap();
        let (lines, status) = drain(job).await;

        assert_eq!(lines, vec!["PLAY [all]\n", "fatal: unreachable\n", "TASK [ping]\n", "warn\n"]);
        assert_eq!(status.code(), Some(2));
    }

    #[tokio::test]
    async fn child_receives_inventory_and_extra_vars() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(dir.path(), "printf '%s|%s|%s|%s|%s\\n' \"$1\" \"$2\" \"$3\" \"$4\" \"$5\"\n");

        let mut params = JobParameters::new();
        params.insert("job_id", "x");
        let job = runner.launch(Path::new("/w/inventory.ini"), &params).await.unwrap();
        let (lines, status) = drain(job).await;

        assert!(status.success());
        assert_eq!(lines, vec!["site.yml|-i|/w/inventory.ini|--extra-vars|{\"job_id\":\"x\"}\n"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(dir.path(), "printf 'ok \\377\\n'\nprintf 'tail'\n");

        let job = runner.launch(Path::new("inv"), &JobParameters::new()).await.unwrap();
        let (lines, _) = drain(job).await;

        assert_eq!(lines, vec!["ok \u{FFFD}\n".to_string(), "tail".to_string()]);
    }

    #[tokio::test]
    async fn running_job_debug_shows_pid_only() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(dir.path(), "exit 0\n");

        let job = runner.launch(Path::new("inv"), &JobParameters::new()).await.unwrap();
        let rendered = format!("{:?}", job);
        assert!(rendered.starts_with("RunningJob { pid: "));
        drain(job).await;
    }

    #[tokio::test]
    async fn missing_program_is_launch_error() {
        let runner = AnsibleJobRunner::new(
            CommandSpec {
                program: "/nonexistent/ansible-playbook".into(),
                args: vec![],
            },
            PathBuf::from("site.yml"),
        );

        let err = runner.launch(Path::new("inv"), &JobParameters::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Launch { .. }));
    }
}
