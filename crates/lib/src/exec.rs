//! Script execution: run a script through the local command interpreter (`<shell> -c <script>`)
//! and capture stdout and stderr as one combined stream.
//!
//! The script is passed as a single opaque argument. Nothing is parsed, escaped, or sandboxed here.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to launch interpreter: {0}")]
    Launch(std::io::Error),
    #[error("failed waiting for interpreter: {0}")]
    Wait(std::io::Error),
    #[error("script exited with status {code}")]
    NonZeroExit { code: i32 },
    #[error("script terminated by signal")]
    Signalled,
}

/// Combined output of one run plus the failure, if any. Output is kept even when the run failed.
#[derive(Debug)]
pub struct ExecutionResult {
    pub output: Vec<u8>,
    pub error: Option<ExecError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Runs a script. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(&self, script: &str) -> ExecutionResult;
}

/// Executes scripts with `<shell> -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl ScriptExecutor for ShellExecutor {
    async fn execute(&self, script: &str) -> ExecutionResult {
        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return ExecutionResult {
                    output: Vec::new(),
                    error: Some(ExecError::Launch(e)),
                }
            }
        };

        let combined = Mutex::new(Vec::new());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, _, status) = tokio::join!(
            pump(stdout, &combined),
            pump(stderr, &combined),
            child.wait()
        );
        let output = combined.into_inner().unwrap_or_else(|e| e.into_inner());

        let error = match status {
            Ok(s) if s.success() => None,
            Ok(s) => Some(match s.code() {
                Some(code) => ExecError::NonZeroExit { code },
                None => ExecError::Signalled,
            }),
            Err(e) => Some(ExecError::Wait(e)),
        };
        ExecutionResult { output, error }
    }
}

/// Copy one pipe into the shared buffer chunk by chunk, so both pipes interleave in arrival order.
async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, into: &Mutex<Vec<u8>>) {
    let Some(mut reader) = reader else { return };
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => match into.lock() {
                Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => e.into_inner().extend_from_slice(&chunk[..n]),
            },
            Err(e) => {
                log::debug!("exec: reading script output failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let r = ShellExecutor::default()
            .execute("echo out; echo err 1>&2")
            .await;
        assert!(r.is_success(), "{:?}", r.error);
        let out = r.output_lossy();
        assert!(out.contains("out\n"), "{}", out);
        assert!(out.contains("err\n"), "{}", out);
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_output() {
        let r = ShellExecutor::default().execute("echo partial; exit 3").await;
        assert!(matches!(r.error, Some(ExecError::NonZeroExit { code: 3 })));
        assert_eq!(r.output_lossy(), "partial\n");
    }

    #[tokio::test]
    async fn exit_one_has_empty_output() {
        let r = ShellExecutor::default().execute("exit 1").await;
        assert!(matches!(r.error, Some(ExecError::NonZeroExit { code: 1 })));
        assert!(r.output.is_empty());
    }

    #[tokio::test]
    async fn script_is_one_opaque_argument() {
        let r = ShellExecutor::default()
            .execute("x='a b'; printf '%s|' $x \"$x\"")
            .await;
        assert!(r.is_success());
        assert_eq!(r.output_lossy(), "a|b|a b|");
    }

    #[tokio::test]
    async fn missing_interpreter_is_launch_error() {
        let r = ShellExecutor::new("/nonexistent/relay-shell").execute("true").await;
        assert!(matches!(r.error, Some(ExecError::Launch(_))));
        assert!(r.output.is_empty());
    }
}
