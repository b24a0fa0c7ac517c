//! Image operations against one docker engine, local or remote, through a [`CommandRunner`].

use crate::archive::{FileTree, spawn_stream};
use crate::error::{EngineError, ErrorKind, Result, ResultExt};
use crate::image_reference::{ImageFilter, ImageRef, parse_human_size};
use crate::retry::RetryPolicy;
use crate::runner::{CommandRunner, InputStream};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static BUILD_ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#\d+ )?ERROR:?\s").expect("valid build error pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// Everything `docker build` needs; the context is streamed to the engine as a tar archive.
pub struct BuildRequest<'a> {
    pub context: Arc<dyn FileTree>,
    /// Path of the Dockerfile relative to the context root.
    pub dockerfile: &'a str,
    pub tag: &'a ImageRef,
    pub args: &'a BTreeMap<String, String>,
}

/// One line of `docker images --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageLine {
    repository: String,
    tag: String,
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    size: String,
}

#[derive(Clone)]
pub struct ImageStore {
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    side: Side,
    max_archive_bytes: u64,
}

impl ImageStore {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        retry: RetryPolicy,
        side: Side,
        max_archive_bytes: u64,
    ) -> Self {
        Self {
            runner,
            retry,
            side,
            max_archive_bytes,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn location(&self) -> String {
        self.runner.location()
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn docker(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        self.retry
            .execute(cancel, operation, |_| self.runner.run(cancel, "docker", args))
            .await
    }

    /// Images visible to this engine, optionally narrowed by `filter`.
    pub async fn list(
        &self,
        cancel: &CancellationToken,
        filter: Option<&ImageFilter>,
    ) -> Result<Vec<ImageRef>> {
        let mut args = strings(&["images", "--format", "{{json .}}"]);
        if let Some(reference) = filter.and_then(ImageFilter::as_reference_filter) {
            args.extend(["--filter".to_string(), reference]);
        }
        let operation = format!("list images on {}", self.location());
        let output = self.docker(cancel, &operation, &args).await?;

        let images: Vec<ImageRef> = String::from_utf8_lossy(&output)
            .lines()
            .filter_map(parse_image_line)
            .filter(|image| filter.is_none_or(|f| f.matches(image)))
            .collect();
        debug!("{} image(s) on {}", images.len(), self.location());
        Ok(images)
    }

    /// Single-shot presence probe; not retried, since a miss is an answer rather than a failure.
    pub async fn exists(&self, cancel: &CancellationToken, image: &ImageRef) -> Result<bool> {
        let args = strings(&["image", "inspect", "--format", "{{.Id}}", &image.to_string()]);
        match self.runner.run(cancel, "docker", &args).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.context(format!("inspect {} on {}", image, self.location()))),
        }
    }

    pub async fn pull(&self, cancel: &CancellationToken, image: &ImageRef) -> Result<()> {
        info!("Pulling {} on {}", image, self.location());
        let operation = format!("pull {} on {}", image, self.location());
        self.docker(cancel, &operation, &strings(&["pull", &image.to_string()]))
            .await?;
        Ok(())
    }

    async fn image_size(&self, cancel: &CancellationToken, image: &ImageRef) -> Result<u64> {
        let args = strings(&["image", "inspect", "--format", "{{.Size}}", &image.to_string()]);
        let operation = format!("inspect size of {} on {}", image, self.location());
        let output = self.docker(cancel, &operation, &args).await?;
        let text = String::from_utf8_lossy(&output);
        text.lines()
            .find_map(|line| line.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "unexpected size output for {}: {}",
                    image,
                    text.trim()
                ))
            })
    }

    /// Exports `image` with `docker save`. Refuses images larger than the configured maximum,
    /// and never leaves a partial or oversized archive at `destination`.
    pub async fn save_to_archive(
        &self,
        cancel: &CancellationToken,
        image: &ImageRef,
        destination: &Path,
    ) -> Result<()> {
        let size = self.image_size(cancel, image).await?;
        if size > self.max_archive_bytes {
            return Err(EngineError::SizeExceeded {
                image: image.to_string(),
                actual: size,
                limit: self.max_archive_bytes,
            });
        }

        info!(
            "Saving {} ({} bytes) to {} on {}",
            image,
            size,
            destination.display(),
            self.location()
        );
        let destination_arg = destination.to_string_lossy().into_owned();
        let args = strings(&["save", "-o", &destination_arg, &image.to_string()]);
        let operation = format!("save {} on {}", image, self.location());
        let (args, destination_ref) = (&args, &destination_arg);
        self.retry
            .execute(cancel, &operation, |_| async move {
                let result = self.runner.run(cancel, "docker", args).await;
                if result.is_err() {
                    self.discard(cancel, destination_ref).await;
                }
                result
            })
            .await?;

        if self.side == Side::Local {
            let written = tokio::fs::metadata(destination).await?.len();
            if written > self.max_archive_bytes {
                self.discard(cancel, &destination_arg).await;
                return Err(EngineError::SizeExceeded {
                    image: image.to_string(),
                    actual: written,
                    limit: self.max_archive_bytes,
                });
            }
        }
        Ok(())
    }

    /// Imports an archive with `docker load` and returns the images it contained.
    pub async fn load_from_archive(
        &self,
        cancel: &CancellationToken,
        archive: &str,
    ) -> Result<Vec<ImageRef>> {
        info!("Loading {} on {}", archive, self.location());
        let operation = format!("load {} on {}", archive, self.location());
        let output = self
            .docker(cancel, &operation, &strings(&["load", "-i", archive]))
            .await?;
        Ok(String::from_utf8_lossy(&output)
            .lines()
            .filter_map(|line| line.trim().strip_prefix("Loaded image: "))
            .filter_map(|reference| ImageRef::parse(reference).ok())
            .collect())
    }

    /// Deletes an archive file on this side. Failures are logged, never returned.
    pub async fn discard(&self, cancel: &CancellationToken, path: &str) {
        let result = match self.side {
            Side::Local => match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            Side::Remote => self
                .runner
                .run(cancel, "rm", &strings(&["-f", "--", path]))
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!("Could not remove {} on {}: {}", path, self.location(), e);
        }
    }

    /// Builds `request.tag` from a streamed context. Build log lines are forwarded as they
    /// arrive; a line carrying an error fails the build even when docker exits 0.
    pub async fn build(&self, cancel: &CancellationToken, request: BuildRequest<'_>) -> Result<()> {
        validate_dockerfile_path(request.dockerfile)?;
        if !request.context.contains(request.dockerfile) {
            return Err(EngineError::validation(format!(
                "Dockerfile {} not found in build context {}",
                request.dockerfile,
                request.context.describe()
            )));
        }

        let tag = request.tag.to_string();
        let mut args = strings(&["build", "-f", request.dockerfile, "-t", &tag]);
        for (key, value) in request.args {
            args.extend(["--build-arg".to_string(), format!("{}={}", key, value)]);
        }
        args.push("-".to_string());

        info!(
            "Building {} on {} from {}",
            tag,
            self.location(),
            request.context.describe()
        );
        let operation = format!("build {} on {}", tag, self.location());
        self.retry
            .execute(cancel, &operation, |_| {
                self.build_once(cancel, request.context.clone(), &args, &tag)
            })
            .await
    }

    async fn build_once(
        &self,
        cancel: &CancellationToken,
        context: Arc<dyn FileTree>,
        args: &[String],
        tag: &str,
    ) -> Result<()> {
        let (reader, producer) = spawn_stream(context).into_parts();
        let location = self.location();
        let mut build_error: Option<String> = None;
        let mut on_line = |line: &str| {
            debug!("[build {} on {}] {}", tag, location, line);
            if build_error.is_none() {
                build_error = error_in_build_line(line);
            }
        };

        let input: InputStream = Box::new(reader);
        let ran = self
            .runner
            .run_streaming(cancel, "docker", args, Some(input), &mut on_line)
            .await;
        let produced = producer.finish().await;

        match produced {
            // The engine stopped reading early; its own error says why.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe && ran.is_err() => {}
            Err(e) => {
                return Err(
                    EngineError::from(e).context(format!("stream build context for {}", tag))
                );
            }
            Ok(bytes) => debug!("Streamed {} byte build context for {}", bytes, tag),
        }
        ran?;
        if let Some(message) = build_error {
            return Err(EngineError::BuildFailed {
                tag: tag.to_string(),
                message,
            });
        }
        info!("Built {} on {}", tag, self.location());
        Ok(())
    }

    /// Runs an arbitrary docker subcommand with retries, e.g. `compose ... up -d`.
    pub async fn docker_command(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        args: &[String],
    ) -> Result<String> {
        let output = self
            .docker(cancel, operation, args)
            .await
            .context(format!("{} on {}", operation, self.location()))?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn parse_image_line(line: &str) -> Option<ImageRef> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let parsed: ImageLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Skipping unparsable image line {}: {}", line, e);
            return None;
        }
    };
    if parsed.repository == "<none>" || parsed.tag == "<none>" {
        return None;
    }
    let size = parse_human_size(&parsed.size).unwrap_or(0);
    ImageRef::new(parsed.repository, parsed.tag)
        .ok()
        .map(|image| image.with_details(parsed.id, size))
}

/// Dockerfile paths must stay inside the build context.
fn validate_dockerfile_path(dockerfile: &str) -> Result<()> {
    let path = Path::new(dockerfile);
    let inside = !dockerfile.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if inside {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "Dockerfile path {:?} must be relative to and inside the build context",
            dockerfile
        )))
    }
}

/// Recognises error-bearing build output: JSON messages with an `error`/`errorDetail` field
/// (engine API and raw-JSON progress) and BuildKit's plain `ERROR:` lines.
fn error_in_build_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Some(error.to_string());
        }
        if let Some(message) = value.pointer("/errorDetail/message").and_then(|m| m.as_str()) {
            return Some(message.to_string());
        }
        return value
            .get("vertexes")
            .and_then(|v| v.as_array())
            .and_then(|vertexes| {
                vertexes
                    .iter()
                    .find_map(|v| v.get("error").and_then(|e| e.as_str()))
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
            });
    }
    if BUILD_ERROR_LINE.is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    None
}
