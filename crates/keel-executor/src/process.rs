//! Child process plumbing shared by the external actions.

use keel_core::value::REDACTED;
use keel_core::{Error, Result};
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDERR_TAIL_LINES: usize = 20;

/// The last few lines of a process's stderr, for error messages.
pub(crate) fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// [`stderr_tail`] with every occurrence of `secrets` masked.
///
/// A secret is also masked in its JSON-escaped form, which is how it reaches
/// a command that echoes its stdin.
pub(crate) fn redacted_stderr_tail(output: &Output, secrets: &[String]) -> String {
    redact(stderr_tail(output), secrets)
}

pub(crate) fn redact(mut text: String, secrets: &[String]) -> String {
    let mut needles: Vec<String> = Vec::new();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        needles.push(secret.clone());
        if let Ok(quoted) = serde_json::to_string(secret) {
            let escaped = &quoted[1..quoted.len() - 1];
            if escaped != secret.as_str() {
                needles.push(escaped.to_string());
            }
        }
    }
    // Longest first, so a secret containing another is masked whole.
    needles.sort_by_key(|n| std::cmp::Reverse(n.len()));
    for needle in &needles {
        if text.contains(needle.as_str()) {
            text = text.replace(needle.as_str(), REDACTED);
        }
    }
    text
}

/// One external command invocation.
pub(crate) struct Invocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: Option<&'a Path>,
    /// Written to stdin, then stdin is closed. Never logged.
    pub stdin: Option<Vec<u8>>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Run to completion, or until `cancel` fires. The child is killed if the
    /// returned future is dropped.
    pub async fn output(self, cancel: &CancellationToken) -> Result<Output> {
        debug!(program = %self.program, args = ?self.args, "Spawning command");

        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.cwd {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::io(self.program, e))?;

        if let (Some(bytes), Some(mut pipe)) = (self.stdin, child.stdin.take()) {
            // Written concurrently so a child filling its stdout pipe cannot
            // deadlock us. A child that never reads stdin is not an error.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| Error::io(self.program, e)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_redact_masks_plain_and_escaped_forms() {
        let secrets = vec!["p@ss\"word".to_string(), String::new()];
        let text = r#"login failed for p@ss"word; stdin was {"password":"p@ss\"word"}"#.to_string();
        let redacted = redact(text, &secrets);
        assert!(!redacted.contains("p@ss"));
        assert_eq!(redacted.matches(REDACTED).count(), 2);
    }

    #[tokio::test]
    async fn test_stdin_is_passed_through() {
        let out = Invocation::new("cat")
            .stdin(b"hello".to_vec())
            .output(&CancellationToken::new())
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Invocation::new("sleep")
            .arg("30")
            .output(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_stderr_tail_keeps_last_lines() {
        let script = "for i in $(seq 1 30); do echo line$i >&2; done; exit 3";
        let out = Invocation::new("sh")
            .args(["-c", script])
            .output(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
        let tail = stderr_tail(&out);
        assert!(tail.starts_with("line11"));
        assert!(tail.ends_with("line30"));
    }
}
