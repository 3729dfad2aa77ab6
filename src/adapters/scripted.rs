use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::runner::{CommandResult, CommandRunner, CommandSpec};
use crate::error::{Error, Result};

/// Canned answer for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Fragments handed to the streaming callback, in order.
    pub chunks: Vec<String>,
    /// Simulated run time before the reply is delivered.
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn streamed<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A recorded call against the scripted runner.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: CommandSpec,
    pub privileged: bool,
    pub streaming: bool,
}

type Handler = Box<dyn Fn(&CommandSpec) -> Reply + Send + Sync>;

/// In-memory [`CommandRunner`] that answers from per-program handlers.
///
/// Handlers may touch the filesystem to mimic a tool's side effects. Programs without a
/// handler behave like a binary missing from `PATH`.
#[derive(Default)]
pub struct ScriptedRunner {
    handlers: HashMap<String, Handler>,
    invocations: Mutex<Vec<Invocation>>,
    deny_privileges: bool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every invocation of `program` (matched by base name) with `handler`.
    pub fn on<F>(mut self, program: &str, handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Reply + Send + Sync + 'static,
    {
        self.handlers.insert(program.to_string(), Box::new(handler));
        self
    }

    /// Make every privileged invocation fail as if the user dismissed the prompt.
    pub fn deny_privileges(mut self) -> Self {
        self.deny_privileges = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Every recorded command for `program`, in call order.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.invocations()
            .into_iter()
            .filter(|i| i.command.program_name() == program)
            .map(|i| i.command)
            .collect()
    }

    /// Whether `program` was invoked with `subcommand` as its first argument.
    pub fn was_called(&self, program: &str, subcommand: &str) -> bool {
        self.calls_to(program)
            .iter()
            .any(|c| c.args.first().map(String::as_str) == Some(subcommand))
    }

    async fn answer(&self, command: &CommandSpec, privileged: bool, streaming: bool) -> Result<Reply> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Invocation {
                command: command.clone(),
                privileged,
                streaming,
            });

        let handler = self.handlers.get(command.program_name()).ok_or_else(|| {
            Error::Execution {
                program: command.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "No such file or directory",
                ),
            }
        })?;

        let reply = handler(command);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(reply)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandResult> {
        let reply = self.answer(command, false, false).await?;
        let mut stdout = reply.chunks.concat();
        stdout.push_str(&reply.stdout);

        Ok(CommandResult {
            stdout: stdout.trim().to_string(),
            stderr: reply.stderr.trim().to_string(),
            exit_code: reply.exit_code,
        })
    }

    async fn run_streaming(
        &self,
        command: &CommandSpec,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandResult> {
        let reply = self.answer(command, false, true).await?;
        for chunk in &reply.chunks {
            on_chunk(chunk);
        }
        if !reply.stdout.is_empty() {
            on_chunk(&reply.stdout);
        }

        Ok(CommandResult {
            stdout: String::new(),
            stderr: reply.stderr.trim().to_string(),
            exit_code: reply.exit_code,
        })
    }

    async fn run_privileged(&self, command: &CommandSpec) -> Result<CommandResult> {
        if self.deny_privileges {
            self.invocations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Invocation {
                    command: command.clone(),
                    privileged: true,
                    streaming: false,
                });
            return Err(Error::PermissionDenied(
                "User cancelled authorization".to_string(),
            ));
        }

        let reply = self.answer(command, true, false).await?;
        Ok(CommandResult {
            stdout: reply.stdout.trim().to_string(),
            stderr: reply.stderr.trim().to_string(),
            exit_code: reply.exit_code,
        })
    }
}
