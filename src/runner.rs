//! Process execution, locally or over an established remote session.
//!
//! [`CommandRunner`] is the seam that lets image handling run unchanged against the local
//! docker engine or the target host's: [`LocalRunner`] spawns processes directly, while
//! [`RemoteRunner`] turns the same invocation into a shell command string and executes it
//! inside an already-authenticated [`RemoteSession`].

use crate::error::{CommandFailure, EngineError, Result};
use crate::transport::RemoteSession;
use async_trait::async_trait;
use futures::StreamExt;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes fed to a process's stdin, e.g. a build context archive.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Number of trailing output lines kept for the error of a failed streaming command.
const OUTPUT_TAIL_LINES: usize = 40;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and returns its combined stdout and stderr.
    ///
    /// Returns [`EngineError::Cancelled`] without spawning anything if `cancel` already fired.
    /// A non-zero exit yields [`EngineError::Command`] carrying the captured output.
    async fn run(&self, cancel: &CancellationToken, program: &str, args: &[String])
    -> Result<Vec<u8>>;

    /// Runs `program`, optionally feeding `input` to its stdin, and hands every output line to
    /// `on_line` as it arrives instead of buffering the whole output.
    async fn run_streaming(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        input: Option<InputStream>,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<()>;

    /// Where commands execute, for logs and error context.
    fn location(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let command_line = join_command(program, args);
        debug!("Running {}", command_line);

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            output = command.output() => output.map_err(|e| spawn_error(&command_line, e))?,
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(command_error(
                program,
                command_line,
                output.status.code(),
                String::from_utf8_lossy(&combined).into_owned(),
            ))
        }
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
        let command_line = join_command(program, args);
        debug!("Running {} (streaming)", command_line);

        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&command_line, e))?;

        let feeder = match (input, child.stdin.take()) {
            (Some(mut input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut input, &mut stdin).await;
                drop(stdin);
                copied
            })),
            _ => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;
        let mut lines = futures::stream::select(
            FramedRead::new(stdout, line_codec()),
            FramedRead::new(stderr, line_codec()),
        );

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Err(EngineError::Cancelled);
                }
                next = lines.next() => match next {
                    Some(Ok(chunk)) => {
                        let line = String::from_utf8_lossy(&chunk);
                        let line = line.trim_end_matches('\r');
                        on_line(line);
                        if tail.len() == OUTPUT_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                    Some(Err(e)) => return Err(std::io::Error::other(e.to_string()).into()),
                    None => break,
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            let output = tail.into_iter().collect::<Vec<_>>().join("\n");
            return Err(command_error(program, command_line, status.code(), output));
        }

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(bytes)) => debug!("Fed {} bytes to {}", bytes, program),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("{} exited before consuming all of its input", program)
                }
                Ok(Err(e)) => {
                    let context = format!("stdin of `{}`", command_line);
                    return Err(EngineError::from(e).context(context));
                }
                Err(e) => return Err(std::io::Error::other(e.to_string()).into()),
            }
        }

        Ok(())
    }

    fn location(&self) -> String {
        "local".to_string()
    }
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec())
}

/// Executes commands inside a [`RemoteSession`]; never re-authenticates per call.
#[derive(Clone)]
pub struct RemoteRunner {
    session: Arc<dyn RemoteSession>,
}

impl RemoteRunner {
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl CommandRunner for RemoteRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        self.session.exec(cancel, &join_command(program, args)).await
    }

    async fn run_streaming(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        input: Option<InputStream>,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<()> {
        self.session
            .exec_streaming(cancel, &join_command(program, args), input, on_line)
            .await
    }

    fn location(&self) -> String {
        self.session.destination()
    }
}

/// Quotes `arg` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// Renders a program and its arguments as one shell command string.
pub fn join_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_error(command_line: &str, error: std::io::Error) -> EngineError {
    let failure = match error.kind() {
        std::io::ErrorKind::NotFound => CommandFailure::CommandMissing,
        std::io::ErrorKind::PermissionDenied => CommandFailure::PermissionDenied,
        _ => CommandFailure::Failed,
    };
    EngineError::Command {
        command: command_line.to_string(),
        failure,
        status: None,
        output: format!("failed to spawn: {}", error),
    }
}

pub(crate) fn command_error(
    program: &str,
    command: String,
    status: Option<i32>,
    output: String,
) -> EngineError {
    let failure = classify_failure(program, status, &output);
    if failure != CommandFailure::Failed {
        warn!("`{}` failed: {}", command, failure);
    }
    EngineError::Command {
        command,
        failure,
        status,
        output,
    }
}

/// Assigns a structured failure code from the exit status and the well-known diagnostics of
/// the programs the engine drives (`ssh`, `scp`, `sshpass`, `docker`). This is the only place
/// process output is inspected; everything above works with [`CommandFailure`].
pub fn classify_failure(program: &str, status: Option<i32>, output: &str) -> CommandFailure {
    let text = output.to_ascii_lowercase();
    let transport = matches!(program, "ssh" | "scp" | "sshpass");

    if transport {
        if text.contains("host key verification failed")
            || text.contains("remote host identification has changed")
            || (program == "sshpass" && status == Some(6))
        {
            return CommandFailure::HostKeyMismatch;
        }
        if text.contains("permission denied (")
            || text.contains("too many authentication failures")
            || (program == "sshpass" && status == Some(5))
        {
            return CommandFailure::Authentication;
        }
        if status == Some(255) {
            return CommandFailure::ConnectionLost;
        }
    }

    match status {
        Some(126) => return CommandFailure::PermissionDenied,
        Some(127) => return CommandFailure::CommandMissing,
        _ => {}
    }

    if text.contains("is not a docker command") || text.contains("unknown command") {
        CommandFailure::CommandMissing
    } else if text.contains("permission denied") {
        CommandFailure::PermissionDenied
    } else if text.contains("manifest unknown")
        || text.contains("repository does not exist")
        || text.contains("no such image")
        || text.contains("no such file or directory")
    {
        CommandFailure::NotFound
    } else if text.contains("connection reset")
        || text.contains("connection refused")
        || text.contains("i/o timeout")
        || text.contains("tls handshake timeout")
    {
        CommandFailure::ConnectionLost
    } else {
        CommandFailure::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("docker"), "docker");
        assert_eq!(shell_quote("reference=nginx:1.27"), "reference=nginx:1.27");
        assert_eq!(shell_quote("{{json .}}"), "'{{json .}}'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_join_command() {
        let line = join_command("docker", &args(&["images", "--format", "{{json .}}"]));
        assert_eq!(line, "docker images --format '{{json .}}'");
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("ssh", Some(255), "deploy@host: Permission denied (publickey)."),
            CommandFailure::Authentication
        );
        assert_eq!(
            classify_failure("ssh", Some(255), "Host key verification failed."),
            CommandFailure::HostKeyMismatch
        );
        assert_eq!(
            classify_failure("ssh", Some(255), "ssh: connect to host x port 22: No route to host"),
            CommandFailure::ConnectionLost
        );
        assert_eq!(
            classify_failure(
                "docker",
                Some(1),
                "permission denied while trying to connect to the Docker daemon socket"
            ),
            CommandFailure::PermissionDenied
        );
        assert_eq!(
            classify_failure("docker", Some(1), "Error response from daemon: manifest unknown"),
            CommandFailure::NotFound
        );
        assert_eq!(
            classify_failure("docker", Some(1), "net/http: TLS handshake timeout"),
            CommandFailure::ConnectionLost
        );
        assert_eq!(
            classify_failure("docker", Some(1), "docker: 'compose' is not a docker command."),
            CommandFailure::CommandMissing
        );
        assert_eq!(
            classify_failure(
                "docker",
                Some(1),
                "pull access denied for ghost/app, repository does not exist"
            ),
            CommandFailure::NotFound
        );
        assert_eq!(classify_failure("sh", Some(127), ""), CommandFailure::CommandMissing);
        assert_eq!(classify_failure("docker", Some(2), "weird"), CommandFailure::Failed);
    }

    #[tokio::test]
    async fn test_local_run_captures_output() {
        let cancel = CancellationToken::new();
        let output = LocalRunner
            .run(&cancel, "sh", &args(&["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn test_local_run_failure_wraps_output() {
        let cancel = CancellationToken::new();
        let error = LocalRunner
            .run(&cancel, "sh", &args(&["-c", "echo broken >&2; exit 3"]))
            .await
            .unwrap_err();
        match &error {
            EngineError::Command { status, output, .. } => {
                assert_eq!(*status, Some(3));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(error.kind(), ErrorKind::ProcessFailed);
    }

    #[tokio::test]
    async fn test_local_run_cancelled_before_spawn() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = LocalRunner
            .run(&cancel, "definitely-not-a-real-program", &[])
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_local_run_missing_program() {
        let cancel = CancellationToken::new();
        let error = LocalRunner
            .run(&cancel, "definitely-not-a-real-program", &[])
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::CommandMissing);
    }

    #[tokio::test]
    async fn test_local_run_streaming_lines_and_stdin() {
        let cancel = CancellationToken::new();
        let mut lines = Vec::new();
        let input: InputStream = Box::new(std::io::Cursor::new(b"alpha\nbeta\n".to_vec()));
        LocalRunner
            .run_streaming(&cancel, "cat", &[], Some(input), &mut |line: &str| {
                lines.push(line.to_string())
            })
            .await
            .unwrap();
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_local_run_streaming_cancel_returns_promptly() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let error = LocalRunner
            .run_streaming(&cancel, "sleep", &args(&["30"]), None, &mut |_: &str| {})
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
