//! In-process stand-ins for a docker engine and an SSH target, for unit tests.

use crate::config::{Credential, TransportConfig};
use crate::error::{EngineError, Result};
use crate::image_reference::ImageRef;
use crate::runner::{CommandRunner, InputStream, command_error, join_command};
use crate::secret_string::SecretString;
use crate::transport::{Connector, RemoteSession};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const ARCHIVE_MAGIC: &str = "FAKEIMAGE";

#[derive(Default)]
struct EngineState {
    images: BTreeMap<String, u64>,
    /// Files written on the remote side; the local side uses the real filesystem.
    files: BTreeMap<String, Vec<u8>>,
    failing_pulls: BTreeSet<String>,
    failing_builds: BTreeSet<String>,
    save_padding: Option<u64>,
    compose_plugin_missing: bool,
    standalone_compose_missing: bool,
    compose_error: Option<String>,
    stall_uploads: bool,
    calls: Vec<String>,
}

/// A scripted docker engine. Images live in memory; `save` writes a small marker archive
/// that `load` understands.
pub struct FakeEngine {
    name: String,
    remote: bool,
    state: Mutex<EngineState>,
    upload_started: Notify,
}

fn key(reference: &str) -> String {
    ImageRef::parse(reference)
        .map(|image| image.to_string())
        .unwrap_or_else(|_| reference.to_string())
}

impl FakeEngine {
    pub fn local() -> Arc<Self> {
        Arc::new(Self {
            name: "local".to_string(),
            remote: false,
            state: Mutex::default(),
            upload_started: Notify::new(),
        })
    }

    pub fn remote(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            remote: true,
            state: Mutex::default(),
            upload_started: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_image(&self, reference: &str, size: u64) {
        self.state().images.insert(key(reference), size);
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state().images.contains_key(&key(reference))
    }

    pub fn fail_pull(&self, reference: &str) {
        self.state().failing_pulls.insert(key(reference));
    }

    pub fn fail_build(&self, reference: &str) {
        self.state().failing_builds.insert(key(reference));
    }

    /// Makes every saved archive at least `bytes` long, regardless of the image size.
    pub fn inflate_saves(&self, bytes: u64) {
        self.state().save_padding = Some(bytes);
    }

    pub fn without_compose_plugin(&self) {
        self.state().compose_plugin_missing = true;
    }

    pub fn without_standalone_compose(&self) {
        self.state().standalone_compose_missing = true;
    }

    /// Makes `compose up` fail with `output`, whichever compose implementation runs it.
    pub fn fail_compose(&self, output: &str) {
        self.state().compose_error = Some(output.to_string());
    }

    /// Uploads write their file, then hang until cancelled.
    pub fn stall_uploads(&self) {
        self.state().stall_uploads = true;
    }

    /// Resolves once a stalled upload is in flight.
    pub async fn upload_started(&self) {
        self.upload_started.notified().await;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Paths of files currently stored on the remote side.
    pub fn files(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    pub fn store_file(&self, path: &str, content: Vec<u8>) {
        self.state().files.insert(path.to_string(), content);
    }

    fn fail(&self, program: &str, args: &[String], output: &str) -> EngineError {
        command_error(program, join_command(program, args), Some(1), output.to_string())
    }

    fn read_archive(&self, path: &str) -> Option<Vec<u8>> {
        if self.remote {
            self.state().files.get(path).cloned()
        } else {
            std::fs::read(path).ok()
        }
    }

    fn handle(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        self.state().calls.push(join_command(program, args));
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        match (program, argv.as_slice()) {
            ("docker", ["info", ..]) => Ok(b"27.3.1\n".to_vec()),
            ("docker", ["images", "--format", ..]) => {
                let state = self.state();
                let lines: String = state
                    .images
                    .iter()
                    .filter_map(|(reference, size)| {
                        let image = ImageRef::parse(reference).ok()?;
                        Some(format!(
                            "{}\n",
                            serde_json::json!({
                                "Repository": image.repository(),
                                "Tag": image.tag(),
                                "ID": format!("sha256:{:x}", size),
                                "Size": format!("{}B", size),
                            })
                        ))
                    })
                    .collect();
                Ok(lines.into_bytes())
            }
            ("docker", ["image", "inspect", "--format", template, reference]) => {
                let size = self.state().images.get(&key(reference)).copied();
                match size {
                    Some(size) if template.contains("Size") => {
                        Ok(format!("{}\n", size).into_bytes())
                    }
                    Some(size) => Ok(format!("sha256:{:x}\n", size).into_bytes()),
                    None => Err(self.fail(
                        program,
                        args,
                        &format!("Error response from daemon: No such image: {}", reference),
                    )),
                }
            }
            ("docker", ["pull", reference]) => {
                let reference = key(reference);
                let mut state = self.state();
                if state.failing_pulls.contains(&reference) {
                    drop(state);
                    return Err(self.fail(
                        program,
                        args,
                        "Error response from daemon: manifest unknown",
                    ));
                }
                state.images.entry(reference.clone()).or_insert(100);
                Ok(format!("Status: Downloaded newer image for {}\n", reference).into_bytes())
            }
            ("docker", ["save", "-o", path, reference]) => {
                let reference = key(reference);
                let (size, padding) = {
                    let state = self.state();
                    (state.images.get(&reference).copied(), state.save_padding)
                };
                let Some(size) = size else {
                    let message = "Error response from daemon: No such image";
                    return Err(self.fail(program, args, message));
                };
                let mut content = format!("{} {}\n", ARCHIVE_MAGIC, reference).into_bytes();
                let target = padding.unwrap_or(size).max(content.len() as u64);
                content.resize(target as usize, 0);
                if self.remote {
                    self.store_file(path, content);
                } else {
                    std::fs::write(path, content)?;
                }
                Ok(Vec::new())
            }
            ("docker", ["load", "-i", path]) => {
                let Some(content) = self.read_archive(path) else {
                    return Err(self.fail(
                        program,
                        args,
                        &format!("open {}: no such file or directory", path),
                    ));
                };
                let header = content.split(|b| *b == b'\n').next().unwrap_or_default();
                let header = String::from_utf8_lossy(header);
                let Some(reference) = header.strip_prefix(&format!("{} ", ARCHIVE_MAGIC)) else {
                    return Err(self.fail(program, args, "archive/tar: invalid tar header"));
                };
                let reference = reference.to_string();
                self.state()
                    .images
                    .insert(reference.clone(), content.len() as u64);
                Ok(format!("Loaded image: {}\n", reference).into_bytes())
            }
            ("docker", ["compose", ..]) => {
                let (missing, failure) = {
                    let state = self.state();
                    (state.compose_plugin_missing, state.compose_error.clone())
                };
                match (missing, failure) {
                    (true, _) => Err(self.fail(
                        program,
                        args,
                        "docker: 'compose' is not a docker command.",
                    )),
                    (false, Some(output)) => Err(self.fail(program, args, &output)),
                    (false, None) => Ok(b"Container app-api-1  Started\n".to_vec()),
                }
            }
            ("docker-compose", [..]) => {
                let (missing, failure) = {
                    let state = self.state();
                    (state.standalone_compose_missing, state.compose_error.clone())
                };
                match (missing, failure) {
                    (true, _) => Err(command_error(
                        program,
                        join_command(program, args),
                        Some(127),
                        "sh: 1: docker-compose: not found".to_string(),
                    )),
                    (false, Some(output)) => Err(self.fail(program, args, &output)),
                    (false, None) => Ok(b"Creating app_api_1 ... done\n".to_vec()),
                }
            }
            ("rm", ["-f", "--", path]) => {
                self.state().files.remove(*path);
                Ok(Vec::new())
            }
            ("mkdir", ["-p", ..]) => Ok(Vec::new()),
            _ => Err(self.fail(program, args, "unsupported by the fake engine")),
        }
    }

    fn build(&self, args: &[String], context: &[u8]) -> Result<Vec<String>> {
        self.state().calls.push(join_command("docker", args));
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let (dockerfile, tag) = match argv.as_slice() {
            ["build", "-f", dockerfile, "-t", tag, .., "-"] => (*dockerfile, key(tag)),
            _ => return Err(self.fail("docker", args, "unexpected build invocation")),
        };

        let mut found = false;
        let mut archive = tar::Archive::new(context);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            found |= path == dockerfile;
        }
        if !found {
            return Err(self.fail(
                "docker",
                args,
                "unable to prepare context: Dockerfile not found in build context",
            ));
        }

        let mut state = self.state();
        if state.failing_builds.contains(&tag) {
            return Ok(vec![
                r#"{"stream":"Step 1/2 : FROM alpine:3.20"}"#.to_string(),
                r#"{"errorDetail":{"message":"RUN make: exit code 2"},"error":"RUN make: exit code 2"}"#
                    .to_string(),
            ]);
        }
        state.images.insert(tag.clone(), context.len() as u64);
        Ok(vec![
            r#"{"stream":"Step 1/2 : FROM alpine:3.20"}"#.to_string(),
            format!(r#"{{"stream":"Successfully tagged {}"}}"#, tag),
        ])
    }
}

#[async_trait]
impl CommandRunner for FakeEngine {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        tokio::task::yield_now().await;
        self.handle(program, args)
    }

    async fn run_streaming(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        input: Option<InputStream>,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut stdin = Vec::new();
        if let Some(mut input) = input {
            input.read_to_end(&mut stdin).await?;
        }
        let lines = if program == "docker" && args.first().is_some_and(|a| a == "build") {
            self.build(args, &stdin)?
        } else {
            String::from_utf8_lossy(&self.handle(program, args)?)
                .lines()
                .map(str::to_string)
                .collect()
        };
        for line in &lines {
            on_line(line);
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.name.clone()
    }
}

/// Splits a POSIX shell command line produced by [`join_command`].
pub fn split_shell(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[derive(Default)]
pub struct SessionCounters {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

/// A session that executes command strings against a [`FakeEngine`].
pub struct FakeSession {
    engine: Arc<FakeEngine>,
    counters: Arc<SessionCounters>,
    closed: AtomicBool,
}

impl FakeSession {
    fn command(&self, command: &str) -> Result<(String, Vec<String>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::validation("session already closed"));
        }
        let mut words = split_shell(command).into_iter();
        let program = words
            .next()
            .ok_or_else(|| EngineError::validation("empty remote command"))?;
        Ok((program, words.collect()))
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, cancel: &CancellationToken, command: &str) -> Result<Vec<u8>> {
        let (program, args) = self.command(command)?;
        self.engine.run(cancel, &program, &args).await
    }

    async fn exec_streaming(
        &self,
        cancel: &CancellationToken,
        command: &str,
        input: Option<InputStream>,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<()> {
        let (program, args) = self.command(command)?;
        self.engine
            .run_streaming(cancel, &program, &args, input, on_line)
            .await
    }

    async fn upload(&self, cancel: &CancellationToken, local: &Path, remote: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let content = tokio::fs::read(local).await?;
        let stall = {
            let mut state = self.engine.state();
            state
                .calls
                .push(format!("upload {} {}", local.display(), remote));
            state.stall_uploads
        };
        self.engine.store_file(remote, content);
        if stall {
            self.engine.upload_started.notify_one();
            cancel.cancelled().await;
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn destination(&self) -> String {
        self.engine.name.clone()
    }
}

/// Hands out [`FakeSession`]s bound to one remote [`FakeEngine`].
pub struct FakeConnector {
    pub engine: Arc<FakeEngine>,
    pub counters: Arc<SessionCounters>,
    pub refuse: AtomicBool,
}

impl FakeConnector {
    pub fn new(engine: Arc<FakeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            counters: Arc::default(),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: &TransportConfig,
    ) -> Result<Arc<dyn RemoteSession>> {
        config.validate()?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(command_error(
                "ssh",
                format!("ssh {}", config.destination()),
                Some(255),
                "ssh: connect to host fake port 22: Connection refused".to_string(),
            ));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            engine: self.engine.clone(),
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A transport config that passes validation without any files on disk.
pub fn transport_config() -> TransportConfig {
    TransportConfig {
        host: "203.0.113.10".to_string(),
        port: 22,
        username: "deploy".to_string(),
        credential: Credential::Password(SecretString::new("hunter22")),
        known_hosts_path: None,
        connect_timeout_secs: 5,
        insecure_skip_host_key_check: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_shell_inverts_join_command() {
        let args = vec![
            "images".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            "it's".to_string(),
        ];
        let line = join_command("docker", &args);
        let words = split_shell(&line);
        assert_eq!(words[0], "docker");
        assert_eq!(&words[1..], args.as_slice());
    }
}
