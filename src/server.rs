// src/server.rs

use std::convert::Infallible;
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Form, Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::sys::cleanup;
use crate::sys::credentials::{DECRYPTED_KEY_FILE, SshKeygenStager};
use crate::sys::inventory;
use crate::sys::job::{self, Job};
use crate::sys::packager::ZipArtifactPackager;
use crate::sys::relay::{RelayOutcome, relay_output};
use crate::sys::runner::{AnsibleJobRunner, JobParameters, RunningJob, pubkey_blob};
use crate::sys::secrets::Credential;
use crate::sys::traits::{
    ArtifactPackager, CredentialBundle, CredentialStager, JobRunner, StagedCredentials,
};

/// First token of the final stream line once the archive is ready.
pub const DOWNLOAD_MARKER: &str = "::DOWNLOAD::";

const STREAM_BUFFER: usize = 64;
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// `POST /run-stream` form body.
#[derive(Debug, Deserialize)]
pub struct RunStreamForm {
    pub target_ips: String,
    pub ansible_user: String,
    pub ssh_keys: String,
    pub private_key: Credential,
    pub passphrase: Credential,
    pub new_hostname: String,
    pub new_user: String,
    #[serde(default)]
    pub client: Option<String>,
}

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RelayError::invalid(field, "must not be empty"));
    }
    Ok(())
}

pub struct RelayService {
    config: RelayConfig,
    stager: Box<dyn CredentialStager>,
    runner: Box<dyn JobRunner>,
    packager: Box<dyn ArtifactPackager>,
}

impl RelayService {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            stager: Box::new(SshKeygenStager::new(config.keygen_command.clone())),
            runner: Box::new(AnsibleJobRunner::new(
                config.playbook_command.clone(),
                config.playbook_path.clone(),
            )),
            packager: Box::new(ZipArtifactPackager::new()),
            config,
        }
    }

    /// Creates the work root (0700) and logs directory.
    pub async fn prepare_filesystem(config: &RelayConfig) -> std::io::Result<()> {
        job::private_dir(&config.work_root, true).await?;
        let mut perms = fs::metadata(&config.work_root).await?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&config.work_root, perms).await?;
        fs::create_dir_all(&config.logs_dir).await
    }

    /// Runs every step up to and including the spawn. Anything that fails
    /// here is reported before a single output line is streamed.
    async fn start_job(self: &Arc<Self>, form: RunStreamForm) -> Result<Response> {
        let RunStreamForm {
            target_ips,
            ansible_user,
            ssh_keys,
            private_key,
            passphrase,
            new_hostname,
            new_user,
            client,
        } = form;

        require("ansible_user", &ansible_user)?;
        require("ssh_keys", &ssh_keys)?;
        require("new_hostname", &new_hostname)?;
        require("new_user", &new_user)?;
        if private_key.is_blank() {
            return Err(RelayError::invalid("private_key", "must not be empty"));
        }
        let client = job::client_tag(client.as_deref())?;

        let targets = inventory::parse_targets(&target_ips);
        if targets.is_empty() {
            return Err(RelayError::EmptyTargetList);
        }

        let job = Job::create(
            &self.config.work_root,
            &self.config.logs_dir,
            &client,
            chrono::Local::now().naive_local(),
        )
        .await?;
        tracing::info!(job_id = %job.id, client = %job.client, targets = targets.len(), "Job accepted");

        let bundle = CredentialBundle {
            public_keys: ssh_keys.clone(),
            private_key,
            passphrase,
        };

        let mut params = JobParameters::new();
        params
            .insert("new_hostname", new_hostname)
            .insert("new_user", new_user)
            .insert("client", client)
            .insert("ssh_pubkeys", pubkey_blob(&ssh_keys))
            .insert("validation_output_dir", self.config.remote_output_dir.clone())
            .insert("local_output_dir", job.output_dir.display().to_string())
            .insert("job_id", job.id.clone());

        let (staged, running) = match self.launch(&job, &targets, &ansible_user, bundle, &params).await {
            Ok(launched) => launched,
            Err(e) => {
                match &e {
                    RelayError::Decryption { exit_code } => {
                        tracing::warn!(job_id = %job.id, exit_code = ?exit_code, "SSH key decryption failed")
                    }
                    other => tracing::error!(job_id = %job.id, error = %other, "Job aborted before launch"),
                }
                cleanup::scrub_job(&job, None, false).await;
                let _ = fs::remove_dir(&job.output_dir).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.finish_job(job, staged, running, tx).await;
        });

        let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
        Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
    }

    async fn launch(
        &self,
        job: &Job,
        targets: &[&str],
        ansible_user: &str,
        bundle: CredentialBundle,
        params: &JobParameters,
    ) -> Result<(StagedCredentials, RunningJob)> {
        // Validate the inventory before anything secret touches disk.
        let key_path = job.ssh_dir().join(DECRYPTED_KEY_FILE);
        let entries = inventory::build_entries(targets, ansible_user, &key_path)?;

        let staged = self.stager.stage(&job.ssh_dir(), bundle).await?;
        inventory::write_inventory(&job.inventory_path(), &entries).await?;
        job.create_output_dir().await?;

        let running = self.runner.launch(&job.inventory_path(), params).await?;
        Ok((staged, running))
    }

    /// Relays output, then packages and scrubs regardless of how the
    /// playbook ended.
    async fn finish_job(
        &self,
        job: Job,
        staged: StagedCredentials,
        running: RunningJob,
        tx: mpsc::Sender<String>,
    ) {
        let (lines, mut child) = running.into_parts();
        let outcome = relay_output(lines, &mut child, &tx, self.config.job_timeout).await;

        let notice = match &outcome {
            RelayOutcome::Exited(status) => {
                tracing::info!(job_id = %job.id, exit_code = ?status.code(), "Playbook finished");
                None
            }
            RelayOutcome::TimedOut(limit) => {
                tracing::warn!(job_id = %job.id, timeout_secs = limit.as_secs(), "Playbook timed out");
                Some(format!(
                    "ERROR: job exceeded the {}s timeout; playbook killed\n",
                    limit.as_secs()
                ))
            }
            RelayOutcome::ClientGone => {
                tracing::warn!(job_id = %job.id, "Client disconnected; playbook killed");
                None
            }
            RelayOutcome::Failed(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Lost playbook output");
                Some(format!("ERROR: lost playbook output: {}\n", e))
            }
        };

        // Package and scrub before any further send: a client that stopped
        // reading must not keep key material on disk.
        let packaged = self.packager.package(&job.output_dir, &job.archive_path).await;
        let removed = cleanup::scrub_job(&job, Some(&staged), self.config.retain_credentials).await;
        tracing::debug!(job_id = %job.id, removed, "Credential material scrubbed");

        if let Some(notice) = notice {
            let _ = tx.send(notice).await;
        }

        match packaged {
            Ok(summary) => {
                tracing::info!(
                    job_id = %job.id,
                    files = summary.files,
                    bytes = summary.bytes,
                    archive = %job.archive_path.display(),
                    "Job archived"
                );
                let _ = tx.send(format!("{} {}\n", DOWNLOAD_MARKER, job.id)).await;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Packaging failed");
                let _ = tx
                    .send(format!("ERROR: Failed to package job output: {}\n", e))
                    .await;
            }
        }
    }

    /// Opens `<logs_dir>/<job_id>.zip` for streaming, with its length.
    async fn archive(&self, job_id: &str) -> Result<(fs::File, u64)> {
        if !job::is_valid_job_id(job_id) {
            return Err(RelayError::ArchiveNotFound);
        }
        let path = self.config.logs_dir.join(format!("{}.zip", job_id));
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(RelayError::ArchiveNotFound),
            Err(e) => return Err(RelayError::io(format!("Failed to open {}", path.display()), e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| RelayError::io(format!("Failed to stat {}", path.display()), e))?
            .len();
        Ok((file, len))
    }
}

fn file_chunks(mut file: fs::File) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
    async_stream::stream! {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(buf[..n].to_vec()),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

// ==============================================================================
// HTTP Handlers
// ==============================================================================

async fn index(State(service): State<Arc<RelayService>>) -> Result<Html<String>> {
    let path = service.config.static_dir.join("index.html");
    fs::read_to_string(&path)
        .await
        .map(Html)
        .map_err(|e| RelayError::io(format!("Failed to read {}", path.display()), e))
}

async fn run_stream(
    State(service): State<Arc<RelayService>>,
    Form(form): Form<RunStreamForm>,
) -> Response {
    match service.start_job(form).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn download(
    State(service): State<Arc<RelayService>>,
    Path(job_id): Path<String>,
) -> Result<Response> {
    let (file, len) = service.archive(&job_id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.zip\"", job_id),
            ),
        ],
        Body::from_stream(file_chunks(file)),
    )
        .into_response())
}

pub fn router(service: Arc<RelayService>) -> Router {
    let static_dir = service.config.static_dir.clone();
    Router::new()
        .route("/", get(index))
        .route("/run-stream", post(run_stream))
        .route("/download/{job_id}", get(download))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
