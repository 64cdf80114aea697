use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{RemoteShell, ShellOutput};
use crate::error::{Result, StorageError};

/// Exit status ssh itself uses for connection and auth failures.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Runs commands through the system ssh client in batch mode, so a missing
/// key fails fast instead of prompting.
#[derive(Debug, Clone)]
pub struct SshShell {
    program: String,
    extra_args: Vec<String>,
}

impl SshShell {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: vec!["-o".into(), "BatchMode=yes".into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, host: &str, command: &str, stdin: Option<&[u8]>) -> Result<ShellOutput> {
        tracing::debug!("ssh {host}: {command}");
        let mut child = Command::new(&self.program)
            .args(&self.extra_args)
            .arg(host)
            .arg(command)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StorageError::BackendUnavailable(format!("spawn {}: {e}", self.program)))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .map_err(|e| StorageError::BackendUnavailable(format!("ssh {host}: {e}")))?;
            // closing stdin lets `cat > file` finish
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StorageError::BackendUnavailable(format!("ssh {host}: {e}")))?;
        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if status == SSH_CONNECT_FAILURE {
            return Err(StorageError::BackendUnavailable(format!(
                "ssh {host}: {}",
                stderr.trim()
            )));
        }
        Ok(ShellOutput {
            status,
            stdout: output.stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `sh -c` stands in for ssh: it receives "<host> <command>" as `$0 $1`.
    fn local_shell() -> SshShell {
        SshShell {
            program: "sh".into(),
            extra_args: vec!["-c".into(), "eval \"$1\"".into()],
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let out = local_shell().run("localhost", "printf hello", None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "hello");

        let out = local_shell().run("localhost", "exit 3", None).await.unwrap();
        assert_eq!(out.status, 3);
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = local_shell().run("localhost", "cat", Some(b"piped")).await.unwrap();
        assert_eq!(out.stdout, b"piped");
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let err = SshShell::new("/nonexistent/ssh")
            .run("host", "true", None)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
