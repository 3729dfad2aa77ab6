use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::ToolPaths;
use crate::core::runner::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};

/// Whether one external tool resolves on this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: &'static str,
    pub program: String,
    /// Resolved location, when installed
    pub location: Option<String>,
}

impl ToolStatus {
    pub fn is_installed(&self) -> bool {
        self.location.is_some()
    }
}

/// Looks up the external tools a run needs.
pub struct DependencyService {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl DependencyService {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    /// Resolve `program` with `which`. Any failure reads as not installed.
    pub async fn check(&self, name: &'static str, program: &str) -> ToolStatus {
        let location = match self.runner.run(&CommandSpec::new("which").arg(program)).await {
            Ok(result) if result.succeeded() && !result.stdout.is_empty() => Some(result.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!(program, error = %e, "which failed");
                None
            }
        };

        ToolStatus {
            name,
            program: program.to_string(),
            location,
        }
    }

    pub async fn check_all(&self) -> Vec<ToolStatus> {
        let tools = [
            ("diskutil", &self.tools.diskutil),
            ("hdiutil", &self.tools.hdiutil),
            ("rsync", &self.tools.rsync),
            ("wimlib", &self.tools.wimlib),
        ];

        let mut statuses = Vec::with_capacity(tools.len());
        for (name, program) in tools {
            statuses.push(self.check(name, program).await);
        }
        statuses
    }

    /// Fail with [`Error::ToolMissing`] naming the first tool that is not installed.
    pub async fn require_all(&self) -> Result<()> {
        match self
            .check_all()
            .await
            .into_iter()
            .find(|status| !status.is_installed())
        {
            Some(missing) => Err(Error::ToolMissing(missing.program)),
            None => Ok(()),
        }
    }
}
