use crate::error::EngineError;
use crate::image_reference::ImageRef;
use crate::reconcile::{BuildSpec, ImageRequest};
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    pub workload: Option<WorkloadConfig>,
}

/// How to reach and authenticate against the target host. Read-only for the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(with = "serde_yaml_ng::with::singleton_map")]
    pub credential: Credential,
    pub known_hosts_path: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Disables host key verification. Resolved before any connection is attempted.
    #[serde(default)]
    pub insecure_skip_host_key_check: bool,
}

/// Written as a single-key map: `password: ...` or `privateKey: ...`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Credential {
    Password(SecretString),
    PrivateKey(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Upper bound for a single `docker save` archive.
    pub max_archive_bytes: u64,
    pub remote_staging_dir: String,
    pub local_temp_dir: Option<PathBuf>,
    pub max_concurrent_transfers: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub image: String,
    pub build: Option<BuildSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    pub compose_file: Option<PathBuf>,
    pub image_archive: Option<PathBuf>,
    pub project_name: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// What the driver does when some images end up `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Proceed,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_fraction: 0.2,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: 20 * 1024 * 1024 * 1024,
            remote_staging_dir: "/tmp".to_string(),
            local_temp_dir: None,
            max_concurrent_transfers: 4,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::validation("retry.maxAttempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(EngineError::validation(
                "retry.backoffMultiplier must be a finite number >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(EngineError::validation(
                "retry.jitterFraction must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `user@host:port`, used to identify the target in logs and errors.
    pub fn destination(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Checks fields and referenced files without touching the network.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.host.trim().is_empty() {
            return Err(EngineError::validation("transport.host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(EngineError::validation("transport.username must not be empty"));
        }
        if self.port == 0 {
            return Err(EngineError::validation("transport.port must not be 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(EngineError::validation(
                "transport.connectTimeoutSecs must not be 0",
            ));
        }
        match &self.credential {
            Credential::Password(password) if password.is_empty() => {
                return Err(EngineError::validation(
                    "transport.credential.password must not be empty",
                ));
            }
            Credential::PrivateKey(path) if !path.is_file() => {
                return Err(EngineError::validation(format!(
                    "private key {} does not exist",
                    path.display()
                )));
            }
            _ => {}
        }
        if !self.insecure_skip_host_key_check {
            match &self.known_hosts_path {
                Some(path) if path.is_file() => {}
                Some(path) => {
                    return Err(EngineError::validation(format!(
                        "known hosts file {} does not exist",
                        path.display()
                    )));
                }
                None => {
                    return Err(EngineError::validation(
                        "transport.knownHostsPath is required unless insecureSkipHostKeyCheck is set",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.transport.validate()?;
        self.retry.validate()?;
        if self.engine.max_concurrent_transfers == 0 {
            return Err(EngineError::validation(
                "engine.maxConcurrentTransfers must be at least 1",
            ));
        }
        if !self.engine.remote_staging_dir.starts_with('/') {
            return Err(EngineError::validation(
                "engine.remoteStagingDir must be an absolute path",
            ));
        }
        self.image_requests()?;
        Ok(())
    }

    /// The configured images as reconciliation requests.
    pub fn image_requests(&self) -> Result<Vec<ImageRequest>, EngineError> {
        self.images
            .iter()
            .map(|spec| {
                let image = ImageRef::parse(&spec.image).map_err(|e| {
                    EngineError::validation(format!("image {:?}: {}", spec.image, e))
                })?;
                Ok(ImageRequest {
                    image,
                    build: spec.build.clone(),
                })
            })
            .collect()
    }

    /// Makes relative paths relative to the directory holding the config file.
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Credential::PrivateKey(path) = &mut self.transport.credential {
            resolve(path);
        }
        if let Some(path) = &mut self.transport.known_hosts_path {
            resolve(path);
        }
        for spec in &mut self.images {
            if let Some(build) = &mut spec.build {
                resolve(&mut build.context);
            }
        }
        if let Some(workload) = &mut self.workload {
            if let Some(path) = &mut workload.compose_file {
                resolve(path);
            }
            if let Some(path) = &mut workload.image_archive {
                resolve(path);
            }
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let mut config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    let base = path
        .as_ref()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    config.resolve_paths(&base);

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
