//! iproute2 command execution
//!
//! Every kernel interaction goes through an [`IpRunner`], which lets tests
//! script `ip` output and lets `--dry-run` log mutations instead of applying
//! them.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use route_forge_common::Error;

#[cfg(test)]
use mockall::automock;

/// Lines buffered between the monitor process and its consumer
const STREAM_BUFFER: usize = 1024;

/// Trait for executing `ip` (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IpRunner: Send + Sync {
    /// Run `ip <args>` to completion and return its stdout
    async fn run(&self, args: &[String]) -> Result<String, Error>;

    /// Start a long-running `ip <args>` and stream its stdout line by line
    ///
    /// The process is killed when `cancel` fires or the receiver is dropped.
    async fn stream(
        &self,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, Error>;
}

/// Real runner that executes the iproute2 binary
#[derive(Clone, Debug)]
pub struct IpCommand {
    binary: PathBuf,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpCommand {
    /// Create a runner for the given `ip` binary
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn render(&self, args: &[String]) -> String {
        render(&self.binary.display().to_string(), args)
    }
}

#[async_trait]
impl IpRunner for IpCommand {
    async fn run(&self, args: &[String]) -> Result<String, Error> {
        let rendered = self.render(args);
        debug!(command = %rendered, "Executing ip");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::command(&rendered, format!("failed to execute: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command(rendered, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn stream(
        &self,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, Error> {
        let rendered = self.render(args);
        debug!(command = %rendered, "Starting ip stream");

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::command(&rendered, format!("failed to spawn: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::command(&rendered, "stdout was not captured"))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!(command = %rendered, "ip stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!(command = %rendered, error = %e, "ip stream read failed");
                            break;
                        }
                    }
                }
            }
            if let Err(e) = child.kill().await {
                debug!(command = %rendered, error = %e, "ip stream already exited");
            }
        });

        Ok(rx)
    }
}

/// Runner that logs mutating commands instead of executing them
///
/// Read-only invocations (`show`, `list`, `get`, `monitor`) pass through so
/// drift detection keeps working against the real table.
#[derive(Clone, Debug)]
pub struct DryRun<R> {
    inner: R,
}

impl<R: IpRunner> DryRun<R> {
    /// Wrap a runner
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: IpRunner> IpRunner for DryRun<R> {
    async fn run(&self, args: &[String]) -> Result<String, Error> {
        if is_mutation(args) {
            info!(command = %render("ip", args), "Dry run, skipping");
            return Ok(String::new());
        }
        self.inner.run(args).await
    }

    async fn stream(
        &self,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, Error> {
        self.inner.stream(args, cancel).await
    }
}

/// Whether the invocation changes kernel state
pub fn is_mutation(args: &[String]) -> bool {
    args.iter()
        .skip_while(|a| a.starts_with('-'))
        .nth(1)
        .map(|verb| matches!(verb.as_str(), "add" | "replace" | "del" | "delete" | "change" | "flush"))
        .unwrap_or(false)
}

/// Whether a command failure means the object was already absent
pub fn is_not_found(err: &Error) -> bool {
    match err {
        Error::Command { message, .. } => {
            message.contains("No such process")
                || message.contains("No such file or directory")
                || message.contains("Cannot find")
        }
        _ => false,
    }
}

/// Whether a command failure means the object already exists
pub fn is_already_exists(err: &Error) -> bool {
    matches!(err, Error::Command { message, .. } if message.contains("File exists"))
}

/// Build an argument vector from string slices
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

fn render(binary: &str, args: &[String]) -> String {
    let mut out = binary.to_string();
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_are_detected_after_flags() {
        assert!(is_mutation(&args(["route", "replace", "10.0.0.1/32"])));
        assert!(is_mutation(&args(["-4", "rule", "add", "to", "10.0.0.0/24"])));
        assert!(is_mutation(&args(["route", "del", "10.0.0.1/32"])));
        assert!(!is_mutation(&args(["route", "show", "table", "1490"])));
        assert!(!is_mutation(&args(["-4", "monitor", "route"])));
        assert!(!is_mutation(&args(["route", "get", "10.0.0.1"])));
    }

    #[test]
    fn not_found_classification() {
        assert!(is_not_found(&Error::command(
            "ip route del",
            "RTNETLINK answers: No such process"
        )));
        assert!(!is_not_found(&Error::command(
            "ip route del",
            "RTNETLINK answers: Operation not permitted"
        )));
        assert!(!is_not_found(&Error::internal_with_context("kernel", "No such process")));
    }

    #[test]
    fn exists_classification() {
        assert!(is_already_exists(&Error::command(
            "ip rule add",
            "RTNETLINK answers: File exists"
        )));
    }

    #[tokio::test]
    async fn dry_run_skips_mutations_and_forwards_reads() {
        let mut inner = MockIpRunner::new();
        inner
            .expect_run()
            .withf(|a: &[String]| a[1] == "show")
            .times(1)
            .returning(|_| Ok("10.0.0.1 dev eth0\n".to_string()));

        let runner = DryRun::new(inner);
        let out = runner
            .run(&args(["route", "replace", "10.0.0.1/32", "dev", "eth0"]))
            .await
            .unwrap();
        assert!(out.is_empty());

        let out = runner.run(&args(["route", "show", "table", "1490"])).await.unwrap();
        assert_eq!(out, "10.0.0.1 dev eth0\n");
    }

    #[test]
    fn render_joins_arguments() {
        assert_eq!(
            render("ip", &args(["route", "show"])),
            "ip route show".to_string()
        );
    }
}
