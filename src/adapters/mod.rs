use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::runner::CommandRunner;

mod scripted;
mod system;

pub use scripted::{Invocation, Reply, ScriptedRunner};
pub use system::SystemRunner;

pub fn get_runner(config: &AppConfig) -> Arc<dyn CommandRunner> {
    Arc::new(SystemRunner::new(config.tools.osascript.clone()))
}
