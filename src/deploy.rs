//! Top-level deployment: validate locally, reconcile images on the target, then upload and
//! activate the workload through one primary session.

pub use crate::config::FailurePolicy;
use crate::config::{Config, EngineConfig, RetryConfig, TransportConfig};
use crate::error::{EngineError, ErrorKind, Result, ResultExt};
use crate::image_store::ImageStore;
use crate::reconcile::{self, ImageRequest, Outcome, Reconciler, TransferResult};
use crate::retry::RetryPolicy;
use crate::runner::CommandRunner;
use crate::transport::{Connector, RemoteSession};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_PROJECT: &str = "imgship";

/// How the workload is brought up once its images are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// `docker compose -f <file> -p <project> up -d`
    Compose { file: PathBuf, project: String },
    /// `docker load -i <archive>` of a prebuilt image archive.
    ImageArchive(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub images: Vec<ImageRequest>,
    pub activation: Activation,
    pub failure_policy: FailurePolicy,
}

impl DeployPlan {
    /// A compose deployment whose project is named after the descriptor's directory.
    pub fn compose(descriptor: impl Into<PathBuf>, images: Vec<ImageRequest>) -> Self {
        let file = descriptor.into();
        let project = default_project_name(&file);
        Self {
            images,
            activation: Activation::Compose { file, project },
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let workload = config
            .workload
            .as_ref()
            .ok_or_else(|| EngineError::validation("no workload configured"))?;
        let activation = match (&workload.compose_file, &workload.image_archive) {
            (Some(file), None) => Activation::Compose {
                file: file.clone(),
                project: workload
                    .project_name
                    .clone()
                    .unwrap_or_else(|| default_project_name(file)),
            },
            (None, Some(archive)) => Activation::ImageArchive(archive.clone()),
            _ => {
                return Err(EngineError::validation(
                    "workload needs exactly one of composeFile or imageArchive",
                ));
            }
        };
        Ok(Self {
            images: config.image_requests()?,
            activation,
            failure_policy: workload.failure_policy,
        })
    }

    /// Checks every local path the deployment will read. Touches no network.
    pub fn validate(&self) -> Result<()> {
        match &self.activation {
            Activation::Compose { file, project } => {
                require_file(file, "compose file")?;
                if project.is_empty() {
                    return Err(EngineError::validation("compose project name is empty"));
                }
            }
            Activation::ImageArchive(archive) => require_file(archive, "image archive")?,
        }
        for request in &self.images {
            let Some(build) = &request.build else {
                continue;
            };
            if !build.context.is_dir() {
                return Err(EngineError::validation(format!(
                    "build context {} for {} is not a directory",
                    build.context.display(),
                    request.image
                )));
            }
            require_file(&build.context.join(&build.dockerfile), "Dockerfile")?;
        }
        Ok(())
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "{} {} does not exist",
            what,
            path.display()
        )))
    }
}

/// Compose project names are lowercase letters, digits, dashes and underscores.
fn default_project_name(descriptor: &Path) -> String {
    let name: String = descriptor
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let name = name.trim_start_matches(['-', '_']).to_string();
    if name.is_empty() {
        DEFAULT_PROJECT.to_string()
    } else {
        name
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub destination: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub transfers: Vec<TransferResult>,
    pub activation_output: String,
}

impl DeployReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferResult> {
        self.transfers.iter().filter(|result| !result.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

pub struct Deployer {
    reconciler: Reconciler,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    engine: EngineConfig,
}

impl Deployer {
    pub fn new(
        local_runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn Connector>,
        retry: RetryConfig,
        engine: EngineConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(
                local_runner,
                connector.clone(),
                retry.clone(),
                engine.clone(),
            ),
            connector,
            retry: RetryPolicy::new(retry),
            engine,
        }
    }

    pub async fn deploy(
        &self,
        cancel: &CancellationToken,
        plan: &DeployPlan,
        transport: &TransportConfig,
    ) -> Result<DeployReport> {
        transport.validate()?;
        plan.validate()?;
        let started_at = Utc::now();

        let session =
            reconcile::connect(&self.retry, self.connector.as_ref(), cancel, transport).await?;
        info!("Connected to {}", session.destination());
        let result = self
            .deploy_on(cancel, session.clone(), plan, transport, started_at)
            .await;
        if let Err(e) = session.close().await {
            warn!("Failed to close session to {}: {}", session.destination(), e);
        }
        result
    }

    async fn deploy_on(
        &self,
        cancel: &CancellationToken,
        session: Arc<dyn RemoteSession>,
        plan: &DeployPlan,
        transport: &TransportConfig,
        started_at: DateTime<Utc>,
    ) -> Result<DeployReport> {
        let destination = session.destination();
        let remote = reconcile::remote_store(session.clone(), &self.retry, &self.engine);

        let version = remote
            .docker_command(
                cancel,
                "check docker engine",
                &strings(&["info", "--format", "{{.ServerVersion}}"]),
            )
            .await?;
        info!("Docker {} on {}", version.trim(), destination);

        let transfers = self
            .reconciler
            .reconcile_on(cancel, session.clone(), &plan.images, transport)
            .await?;
        for transfer in &transfers {
            info!("{}", transfer);
        }

        let failed: Vec<String> = transfers
            .iter()
            .filter(|result| !result.is_success())
            .map(describe_failure)
            .collect();
        if !failed.is_empty() {
            match plan.failure_policy {
                FailurePolicy::Abort => {
                    error!(
                        "Aborting deployment to {}: {} image(s) missing",
                        destination,
                        failed.len()
                    );
                    return Err(EngineError::AcquisitionFailed {
                        total: transfers.len(),
                        failed,
                    });
                }
                FailurePolicy::Proceed => warn!(
                    "Proceeding on {} although {} image(s) could not be acquired",
                    destination,
                    failed.len()
                ),
            }
        }

        let activation_output = self
            .activate(cancel, session.as_ref(), &remote, &plan.activation)
            .await
            .context(format!("activate workload on {}", destination))?;
        info!("Workload active on {}", destination);

        Ok(DeployReport {
            destination,
            started_at,
            finished_at: Utc::now(),
            transfers,
            activation_output,
        })
    }

    async fn activate(
        &self,
        cancel: &CancellationToken,
        session: &dyn RemoteSession,
        remote: &ImageStore,
        activation: &Activation,
    ) -> Result<String> {
        let staging = self.engine.remote_staging_dir.trim_end_matches('/');
        remote
            .runner()
            .run(cancel, "mkdir", &strings(&["-p", staging]))
            .await?;

        match activation {
            Activation::Compose { file, project } => {
                let remote_file = format!("{}/{}-{}", staging, project, file_name(file));
                self.upload(cancel, session, file, &remote_file).await?;
                compose_up(cancel, remote, &remote_file, project).await
            }
            Activation::ImageArchive(archive) => {
                let remote_file = format!("{}/{}", staging, file_name(archive));
                self.upload(cancel, session, archive, &remote_file).await?;
                let loaded = remote.load_from_archive(cancel, &remote_file).await;
                remote.discard(cancel, &remote_file).await;
                let images = loaded?;
                Ok(images
                    .iter()
                    .map(|image| format!("Loaded image: {}\n", image))
                    .collect())
            }
        }
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        session: &dyn RemoteSession,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        info!("Uploading {} to {}", local.display(), remote);
        let operation = format!("upload {} to {}", local.display(), session.destination());
        self.retry
            .execute(cancel, &operation, |_| session.upload(cancel, local, remote))
            .await
    }
}

/// Runs `compose up`, falling back to the standalone `docker-compose` only when the compose
/// plugin is not installed. Any other failure of `docker compose` is returned as is.
async fn compose_up(
    cancel: &CancellationToken,
    remote: &ImageStore,
    descriptor: &str,
    project: &str,
) -> Result<String> {
    let args = strings(&["-f", descriptor, "-p", project, "up", "-d"]);
    let mut plugin_args = vec!["compose".to_string()];
    plugin_args.extend(args.iter().cloned());

    let plugin_error = match remote.docker_command(cancel, "compose up", &plugin_args).await {
        Err(e) if e.kind() == ErrorKind::CommandMissing => e,
        other => return other,
    };
    warn!("docker compose plugin unavailable ({}); trying docker-compose", plugin_error);
    let operation = format!("docker-compose up on {}", remote.location());
    match remote
        .retry()
        .execute(cancel, &operation, |_| {
            remote.runner().run(cancel, "docker-compose", &args)
        })
        .await
    {
        Ok(output) => Ok(String::from_utf8_lossy(&output).into_owned()),
        Err(e) if e.kind() == ErrorKind::CommandMissing => Err(plugin_error.context(format!(
            "no compose implementation on {} (docker-compose: {})",
            remote.location(),
            e
        ))),
        Err(e) => Err(e),
    }
}

fn describe_failure(result: &TransferResult) -> String {
    match &result.outcome {
        Outcome::Failed { reason, attempts } if attempts.is_empty() => {
            format!("{} ({})", result.image, reason)
        }
        Outcome::Failed { attempts, .. } => {
            let strategies: Vec<String> = attempts
                .iter()
                .map(|attempt| format!("{} [{:?}]", attempt.strategy, attempt.kind))
                .collect();
            format!("{} (tried {})", result.image, strategies.join(", "))
        }
        _ => result.image.to_string(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workload".to_string())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}
