//! Runs external executables with an argument list, an explicit environment,
//! a hard timeout and a ceiling on captured output.

use crate::errors::ProcessError;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    /// `name` is used in errors and logs; `program` is what gets executed.
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

enum CaptureError {
    Io(std::io::Error),
    Overflow,
}

async fn read_capped<R>(reader: &mut R, limit: usize, buf: &mut Vec<u8>) -> Result<(), CaptureError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(CaptureError::Io)?;
        if n == 0 {
            return Ok(());
        }
        if buf.len() + n > limit {
            return Err(CaptureError::Overflow);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Spawns `spec`, waits for it under `limits`, and maps every failure mode to
/// a distinct [`ProcessError`]. The child is killed on timeout or overflow.
pub async fn run_bounded(spec: &CommandSpec, limits: ProcessLimits) -> Result<ProcessOutput, ProcessError> {
    debug!(program = %spec.name, args = ?spec.args, "spawning process");

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotFound {
                    program: spec.name.clone(),
                    reason: format!("{} ({source})", spec.program.display()),
                }
            } else {
                ProcessError::Spawn {
                    program: spec.name.clone(),
                    source,
                }
            }
        })?;

    let io_error = |source| ProcessError::Io {
        program: spec.name.clone(),
        source,
    };
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_error(std::io::Error::other("stdout was not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_error(std::io::Error::other("stderr was not captured")))?;

    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let limit = limits.max_output_bytes;

    let outcome: Result<Result<ExitStatus, CaptureError>, _> = {
        let collect = async {
            tokio::try_join!(
                read_capped(&mut stdout, limit, &mut out_buf),
                read_capped(&mut stderr, limit, &mut err_buf),
            )?;
            child.wait().await.map_err(CaptureError::Io)
        };
        timeout(limits.timeout, collect).await
    };

    let stderr_text = String::from_utf8_lossy(&err_buf).trim().to_string();

    let status = match outcome {
        Ok(Ok(status)) => status,
        Ok(Err(CaptureError::Overflow)) => {
            kill(&mut child, &spec.name).await;
            return Err(ProcessError::OutputLimit {
                program: spec.name.clone(),
                limit,
            });
        }
        Ok(Err(CaptureError::Io(source))) => {
            kill(&mut child, &spec.name).await;
            return Err(io_error(source));
        }
        Err(_elapsed) => {
            kill(&mut child, &spec.name).await;
            return Err(ProcessError::Timeout {
                program: spec.name.clone(),
                after: limits.timeout,
                stderr: stderr_text,
            });
        }
    };

    if !status.success() {
        return Err(ProcessError::NonZeroExit {
            program: spec.name.clone(),
            code: status.code(),
            stderr: stderr_text,
        });
    }

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&out_buf).into_owned(),
        stderr: stderr_text,
    })
}

async fn kill(child: &mut tokio::process::Child, name: &str) {
    if let Err(e) = child.kill().await {
        warn!(program = %name, error = %e, "failed to kill process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(ms: u64, bytes: usize) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_millis(ms),
            max_output_bytes: bytes,
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", "sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_output_of_successful_run() -> anyhow::Result<()> {
        let out = run_bounded(&sh("echo hello; echo note >&2"), limits(5_000, 1024)).await?;
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr, "note");
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() {
        let err = run_bounded(&sh("echo boom >&2; exit 3"), limits(5_000, 1024))
            .await
            .unwrap_err();
        match err {
            ProcessError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let spec = CommandSpec::new("pg_dump", "/nonexistent/bin/pg_dump");
        let err = run_bounded(&spec, limits(5_000, 1024)).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }

    #[tokio::test]
    async fn hung_process_times_out() {
        let err = run_bounded(&sh("echo partial >&2; sleep 5"), limits(200, 1024))
            .await
            .unwrap_err();
        match err {
            ProcessError::Timeout { stderr, .. } => assert_eq!(stderr, "partial"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verbose_output_hits_the_ceiling() {
        let err = run_bounded(&sh("head -c 50000 /dev/zero"), limits(5_000, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::OutputLimit { limit: 1_000, .. }));
    }

    #[tokio::test]
    async fn environment_is_passed_without_touching_arguments() -> anyhow::Result<()> {
        let spec = sh("printf %s \"$PGPASSWORD\"")
            .envs([("PGPASSWORD".to_string(), "x'; rm -rf /".to_string())]);
        assert!(!spec
            .arguments()
            .iter()
            .any(|a| a.to_string_lossy().contains("rm -rf")));
        let out = run_bounded(&spec, limits(5_000, 1024)).await?;
        assert_eq!(out.stdout, "x'; rm -rf /");
        Ok(())
    }
}
