//! Remote sessions over the system OpenSSH client.
//!
//! `connect` authenticates once by starting a ControlMaster whose socket lives in a private
//! temporary directory; every later command and upload is multiplexed over that socket, so
//! nothing re-authenticates. Host keys are verified against the configured known-hosts file
//! with `StrictHostKeyChecking=yes`.

use crate::config::{Credential, TransportConfig};
use crate::error::{EngineError, Result};
use crate::runner::{CommandRunner, InputStream, LocalRunner, command_error};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period on top of the configured connect timeout for the handshake to finish.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Runs a shell command string on the remote host and returns its combined output.
    async fn exec(&self, cancel: &CancellationToken, command: &str) -> Result<Vec<u8>>;

    async fn exec_streaming(
        &self,
        cancel: &CancellationToken,
        command: &str,
        input: Option<InputStream>,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<()>;

    async fn upload(&self, cancel: &CancellationToken, local: &Path, remote: &str) -> Result<()>;

    /// Ends the session. Calling it again, or on a session that already dropped, is a no-op.
    async fn close(&self) -> Result<()>;

    fn destination(&self) -> String;
}

/// Opens independent sessions to a target host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: &TransportConfig,
    ) -> Result<Arc<dyn RemoteSession>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: &TransportConfig,
    ) -> Result<Arc<dyn RemoteSession>> {
        let session = SshSession::connect(cancel, config).await?;
        Ok(Arc::new(session))
    }
}

pub struct SshSession {
    destination: String,
    host: String,
    options: Vec<String>,
    control_dir: Mutex<Option<TempDir>>,
    runner: LocalRunner,
}

impl SshSession {
    pub async fn connect(cancel: &CancellationToken, config: &TransportConfig) -> Result<Self> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        config.validate()?;
        let destination = config.destination();

        let control_dir = tempfile::Builder::new().prefix("imgship-ssh-").tempdir()?;
        let control_path = control_dir.path().join("ctl");
        let log_path = control_dir.path().join("master.log");
        let options = ssh_options(config, &control_path);

        if config.insecure_skip_host_key_check {
            warn!(
                "Host key verification is disabled for {}; the remote identity is not checked",
                destination
            );
        }

        let (program, mut args) = match &config.credential {
            Credential::Password(_) => ("sshpass", vec!["-e".to_string(), "ssh".to_string()]),
            Credential::PrivateKey(_) => ("ssh", Vec::new()),
        };
        args.extend(options.iter().cloned());
        let log = log_path.to_string_lossy();
        args.extend(strings(&[
            "-M",
            "-f",
            "-N",
            "-o",
            "ControlPersist=yes",
            "-E",
            &log,
            &config.host,
        ]));

        info!("Connecting to {}", destination);
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Credential::Password(password) = &config.credential {
            command.env("SSHPASS", password.expose_secret());
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::from(e).context(format!("spawn {} to connect to {}", program, destination))
        })?;
        let deadline = config.connect_timeout() + HANDSHAKE_GRACE;
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EngineError::Cancelled.context(format!("connect to {}", destination)));
            }
            _ = tokio::time::sleep(deadline) => {
                return Err(EngineError::Timeout {
                    operation: format!("connect to {}", destination),
                    after: deadline,
                });
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            let log = std::fs::read_to_string(&log_path).unwrap_or_default();
            return Err(command_error(
                program,
                format!("ssh connect {}", destination),
                status.code(),
                log,
            ));
        }

        info!("Connected to {}", destination);
        Ok(Self {
            destination,
            host: config.host.clone(),
            options,
            control_dir: Mutex::new(Some(control_dir)),
            runner: LocalRunner,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        let open = self
            .control_dir
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        if open {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "session to {} is closed",
                self.destination
            )))
        }
    }

    fn exec_args(&self, command: &str) -> Vec<String> {
        let mut args = self.options.clone();
        args.extend(strings(&["-o", "ControlMaster=no", "-T", &self.host, command]));
        args
    }

    /// Replaces the local `ssh ...` invocation in a failure with the remote command it ran.
    fn remote_error(&self, error: EngineError, command: &str) -> EngineError {
        match error {
            EngineError::Command {
                failure,
                status,
                output,
                ..
            } => EngineError::Command {
                command: command.to_string(),
                failure,
                status,
                output,
            },
            other => other,
        }
        .context(format!("on {}", self.destination))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, cancel: &CancellationToken, command: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        debug!("[{}] {}", self.destination, command);
        self.runner
            .run(cancel, "ssh", &self.exec_args(command))
            .await
            .map_err(|e| self.remote_error(e, command))
    }

    async fn exec_streaming(
        &self,
        cancel: &CancellationToken,
        command: &str,
        input: Option<InputStream>,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<()> {
        self.ensure_open()?;
        debug!("[{}] {} (streaming)", self.destination, command);
        self.runner
            .run_streaming(cancel, "ssh", &self.exec_args(command), input, on_line)
            .await
            .map_err(|e| self.remote_error(e, command))
    }

    async fn upload(&self, cancel: &CancellationToken, local: &Path, remote: &str) -> Result<()> {
        self.ensure_open()?;
        info!(
            "Uploading {} to {}:{}",
            local.display(),
            self.destination,
            remote
        );
        let mut args = vec!["-q".to_string()];
        args.extend(self.options.iter().cloned());
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            local.to_string_lossy().into_owned(),
            format!("{}:{}", scp_host(&self.host), remote),
        ]);
        self.runner
            .run(cancel, "scp", &args)
            .await
            .map(|_| ())
            .map_err(|e| {
                e.context(format!(
                    "upload {} to {}:{}",
                    local.display(),
                    self.destination,
                    remote
                ))
            })
    }

    async fn close(&self) -> Result<()> {
        let control_dir = match self.control_dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(control_dir) = control_dir else {
            return Ok(());
        };

        let mut args = self.options.clone();
        args.extend(strings(&["-O", "exit", &self.host]));
        let cancel = CancellationToken::new();
        match tokio::time::timeout(CLOSE_TIMEOUT, self.runner.run(&cancel, "ssh", &args)).await {
            Ok(Ok(_)) => info!("Closed session to {}", self.destination),
            Ok(Err(e)) => warn!("Stopping the ssh master for {} failed: {}", self.destination, e),
            Err(_) => warn!("Stopping the ssh master for {} timed out", self.destination),
        }
        drop(control_dir);
        Ok(())
    }

    fn destination(&self) -> String {
        self.destination.clone()
    }
}

/// Best effort for sessions that were never closed; `close()` is the supported way to stop
/// the master. The `ssh -O exit` child is reaped in the background.
impl Drop for SshSession {
    fn drop(&mut self) {
        let open = match self.control_dir.get_mut() {
            Ok(dir) => dir.is_some(),
            Err(_) => false,
        };
        if !open {
            return;
        }
        let mut args = self.options.clone();
        args.extend(strings(&["-O", "exit", &self.host]));
        let spawned = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Command::new("ssh")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map(|mut child| {
                    handle.spawn(async move {
                        let _ = child.wait().await;
                    });
                }),
            Err(_) => std::process::Command::new("ssh")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map(|mut child| {
                    std::thread::spawn(move || {
                        let _ = child.wait();
                    });
                }),
        };
        if let Err(e) = spawned {
            debug!("Could not stop the ssh master for {}: {}", self.destination, e);
        }
    }
}

/// Options shared by the master, multiplexed commands and scp.
fn ssh_options(config: &TransportConfig, control_path: &Path) -> Vec<String> {
    let mut options: Vec<(&str, String)> = vec![
        ("User", config.username.clone()),
        ("Port", config.port.to_string()),
        ("ControlPath", control_path.to_string_lossy().into_owned()),
        ("ConnectTimeout", config.connect_timeout_secs.to_string()),
        ("ServerAliveInterval", "15".to_string()),
        ("ServerAliveCountMax", "3".to_string()),
    ];

    if config.insecure_skip_host_key_check {
        options.push(("StrictHostKeyChecking", "no".to_string()));
        options.push(("UserKnownHostsFile", "/dev/null".to_string()));
    } else {
        options.push(("StrictHostKeyChecking", "yes".to_string()));
        let known_hosts: PathBuf = config.known_hosts_path.clone().unwrap_or_default();
        options.push((
            "UserKnownHostsFile",
            known_hosts.to_string_lossy().into_owned(),
        ));
    }

    match &config.credential {
        Credential::PrivateKey(key) => {
            options.push(("IdentityFile", key.to_string_lossy().into_owned()));
            options.push(("IdentitiesOnly", "yes".to_string()));
            options.push(("BatchMode", "yes".to_string()));
        }
        Credential::Password(_) => {
            options.push((
                "PreferredAuthentications",
                "password,keyboard-interactive".to_string(),
            ));
            options.push(("PubkeyAuthentication", "no".to_string()));
            options.push(("NumberOfPasswordPrompts", "1".to_string()));
        }
    }

    options
        .into_iter()
        .flat_map(|(key, value)| ["-o".to_string(), format!("{}={}", key, value)])
        .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// scp needs IPv6 literals in brackets.
fn scp_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
