use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// One external command: a program and its argument vector.
///
/// Arguments are passed to the process verbatim; nothing is interpreted by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    /// Base name of the program, so `/opt/homebrew/bin/rsync` and `rsync` compare equal.
    pub fn program_name(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }

    /// Render as a single POSIX shell command line, quoting every word.
    pub fn to_shell_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Outcome of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands on behalf of the services.
///
/// Every method fails only when the process cannot be run at all; a nonzero exit is
/// reported through [`CommandResult::exit_code`] and left to the caller. No retries are
/// performed here.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing stdout and stderr.
    async fn run(&self, command: &CommandSpec) -> Result<CommandResult>;

    /// Run to completion, handing each fragment of stdout to `on_chunk` as it arrives.
    ///
    /// The returned result carries stderr and the exit status; stdout is left empty since
    /// it was already delivered through the callback.
    async fn run_streaming(
        &self,
        command: &CommandSpec,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandResult>;

    /// Run with elevated privileges after out-of-band authorization.
    ///
    /// Fails with [`crate::Error::PermissionDenied`] if the user declines.
    async fn run_privileged(&self, command: &CommandSpec) -> Result<CommandResult>;
}
