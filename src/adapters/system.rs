use std::process::Stdio;

use async_trait::async_trait;
use nix::unistd::Uid;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::core::runner::{CommandResult, CommandRunner, CommandSpec};
use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Runs commands as real child processes.
pub struct SystemRunner {
    /// Used to request administrator rights when not already root.
    osascript: String,
}

impl SystemRunner {
    pub fn new(osascript: impl Into<String>) -> Self {
        Self {
            osascript: osascript.into(),
        }
    }

    fn spawn_error(command: &CommandSpec, source: std::io::Error) -> Error {
        Error::Execution {
            program: command.program.clone(),
            source,
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new("osascript")
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandResult> {
        debug!(command = %command, "Running command");

        let output = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Self::spawn_error(command, e))?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_streaming(
        &self,
        command: &CommandSpec,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandResult> {
        debug!(command = %command, "Running streaming command");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(command, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Execution {
                program: command.program.clone(),
                source: std::io::Error::other("stdout was not captured"),
            })?;

        // Drain stderr on its own task so a chatty tool cannot block on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });

        let mut reader = BufReader::new(stdout);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut pending = Vec::new();

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buffer[..n]);

            // Hold back an incomplete UTF-8 sequence until the next read completes it.
            let valid = match std::str::from_utf8(&pending) {
                Ok(_) => pending.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => pending.len(),
            };
            if valid == 0 {
                continue;
            }

            let chunk: Vec<u8> = pending.drain(..valid).collect();
            on_chunk(&String::from_utf8_lossy(&chunk));
        }

        if !pending.is_empty() {
            on_chunk(&String::from_utf8_lossy(&pending));
        }

        let status = child.wait().await?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(CommandResult {
            stdout: String::new(),
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn run_privileged(&self, command: &CommandSpec) -> Result<CommandResult> {
        if Uid::effective().is_root() {
            return self.run(command).await;
        }

        let script = format!(
            "do shell script \"{}\" with administrator privileges",
            escape_applescript(&command.to_shell_line())
        );

        debug!(command = %command, "Requesting administrator privileges");

        let elevated = CommandSpec::new(self.osascript.clone()).args(["-e", script.as_str()]);
        let result = self.run(&elevated).await?;

        if !result.succeeded() && is_authorization_cancelled(&result.stderr) {
            return Err(Error::PermissionDenied(
                "User cancelled authorization".to_string(),
            ));
        }

        Ok(result)
    }
}

fn escape_applescript(line: &str) -> String {
    line.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `osascript` reports a dismissed password prompt as error -128 ("User canceled.").
fn is_authorization_cancelled(stderr: &str) -> bool {
    stderr.contains("-128") || stderr.to_lowercase().contains("canceled")
}
