use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::core::models::WimInfo;
use crate::core::runner::{CommandRunner, CommandResult, CommandSpec};
use crate::core::transfer::CHUNK_EXTENSION;
use crate::error::{Error, Result};
use crate::parsers::wimlib;

/// `(fraction done, status text)`
pub type SplitProgress<'a> = dyn FnMut(f64, &str) + Send + 'a;

/// Breaks an oversized WIM into FAT32-sized `.swm` parts with `wimlib-imagex`.
pub struct SplitService {
    runner: Arc<dyn CommandRunner>,
    wimlib: String,
}

impl SplitService {
    pub fn new(runner: Arc<dyn CommandRunner>, wimlib: impl Into<String>) -> Self {
        Self {
            runner,
            wimlib: wimlib.into(),
        }
    }

    /// Split `source` into `<destination>/<stem>.swm`, `<stem>2.swm`, ... each at most
    /// `max_part_mb` MiB. Returns the parts produced, sorted by name.
    ///
    /// The exit status alone is not trusted: at least one part must exist afterwards.
    pub async fn split(
        &self,
        source: &Path,
        destination: &Path,
        max_part_mb: u32,
        on_progress: &mut SplitProgress<'_>,
    ) -> Result<Vec<PathBuf>> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::SourceNotFound(source.to_path_buf()));
        }
        tokio::fs::create_dir_all(destination).await?;

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "install".to_string());
        let pattern = destination.join(format!("{}.{}", stem, CHUNK_EXTENSION));

        info!(
            source = %source.display(),
            destination = %pattern.display(),
            max_part_mb,
            "Splitting WIM"
        );
        on_progress(0.0, "Starting WIM split...");

        let command = CommandSpec::new(&self.wimlib)
            .arg("split")
            .arg(source.to_string_lossy())
            .arg(pattern.to_string_lossy())
            .arg(max_part_mb.to_string());

        let mut last_percent = None;
        let result = self
            .runner
            .run_streaming(&command, &mut |chunk: &str| {
                if let Some(fraction) = wimlib::parse_split_progress(chunk) {
                    let percent = (fraction * 100.0).round() as u32;
                    if last_percent != Some(percent) {
                        debug!(percent, "Split progress");
                        last_percent = Some(percent);
                    }
                    on_progress(fraction, &format!("Splitting: {}%", percent));
                }
            })
            .await
            .map_err(|e| self.tool_error(e))?;

        self.check(&result, Error::SplitFailed)?;

        let parts = list_parts(destination, &stem).await?;
        if parts.is_empty() {
            return Err(Error::SplitFailed("No split files were created".to_string()));
        }

        on_progress(
            1.0,
            &format!("Split complete: {} files created", parts.len()),
        );
        Ok(parts)
    }

    /// Image count and total size of a WIM.
    pub async fn info(&self, path: &Path) -> Result<WimInfo> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::SourceNotFound(path.to_path_buf()));
        }

        let command = CommandSpec::new(&self.wimlib)
            .arg("info")
            .arg(path.to_string_lossy());
        let result = self
            .runner
            .run(&command)
            .await
            .map_err(|e| self.tool_error(e))?;

        self.check(&result, Error::WimInfoFailed)?;
        Ok(wimlib::parse_wim_info(&result.stdout, path))
    }

    fn check(&self, result: &CommandResult, failed: fn(String) -> Error) -> Result<()> {
        if result.succeeded() {
            return Ok(());
        }
        if result.stderr.contains("command not found") {
            return Err(Error::ToolMissing(self.wimlib.clone()));
        }
        Err(failed(result.stderr.clone()))
    }

    fn tool_error(&self, e: Error) -> Error {
        if e.is_missing_program() {
            Error::ToolMissing(self.wimlib.clone())
        } else {
            e
        }
    }
}

async fn list_parts(dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let suffix = format!(".{}", CHUNK_EXTENSION);
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut parts = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(stem) && name.ends_with(&suffix) {
            parts.push(entry.path());
        }
    }

    parts.sort();
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Reply, ScriptedRunner};
    use std::fs;

    /// Mimics `wimlib-imagex split` by writing two parts next to the requested pattern.
    fn splitting_runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new().on("wimlib-imagex", |cmd| {
            let pattern = PathBuf::from(&cmd.args[2]);
            let dir = pattern.parent().unwrap();
            fs::write(&pattern, b"part1").unwrap();
            fs::write(dir.join("install2.swm"), b"part2").unwrap();
            Reply::streamed([
                "Splitting WIM: 0 MiB of 5120 MiB (0%) written, part 1 of 2\r",
                "Splitting WIM: 2560 MiB of 5120 MiB (50%) written, part 1 of 2\r",
                "Splitting WIM: 5120 MiB of 5120 MiB (100%) written, part 2 of 2\n",
            ])
        }))
    }

    #[tokio::test]
    async fn test_split_reports_progress_and_parts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("install.wim");
        fs::write(&source, b"wim").unwrap();
        let out = dir.path().join("split");

        let runner = splitting_runner();
        let svc = SplitService::new(runner.clone(), "wimlib-imagex");

        let mut events = Vec::new();
        let parts = svc
            .split(&source, &out, 3800, &mut |f, status: &str| {
                events.push((f, status.to_string()))
            })
            .await
            .unwrap();

        assert_eq!(parts, vec![out.join("install.swm"), out.join("install2.swm")]);
        assert_eq!(events.first().unwrap(), &(0.0, "Starting WIM split...".to_string()));
        assert!(events.contains(&(0.5, "Splitting: 50%".to_string())));
        assert_eq!(
            events.last().unwrap(),
            &(1.0, "Split complete: 2 files created".to_string())
        );

        let call = &runner.calls_to("wimlib-imagex")[0];
        assert_eq!(call.args[0], "split");
        assert_eq!(call.args[3], "3800");
        assert!(runner.invocations()[0].streaming);
    }

    #[tokio::test]
    async fn test_split_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let svc = SplitService::new(splitting_runner(), "wimlib-imagex");
        let err = svc
            .split(&dir.path().join("install.wim"), dir.path(), 3800, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_split_without_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("install.wim");
        fs::write(&source, b"wim").unwrap();

        let runner = Arc::new(ScriptedRunner::new().on("wimlib-imagex", |_| Reply::ok("")));
        let svc = SplitService::new(runner, "wimlib-imagex");
        let err = svc
            .split(&source, &dir.path().join("out"), 3800, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SplitFailed(ref m) if m == "No split files were created"));
    }

    #[tokio::test]
    async fn test_split_tool_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("install.wim");
        fs::write(&source, b"wim").unwrap();

        let svc = SplitService::new(Arc::new(ScriptedRunner::new()), "wimlib-imagex");
        let err = svc
            .split(&source, dir.path(), 3800, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolMissing(_)));

        let runner = Arc::new(ScriptedRunner::new().on("wimlib-imagex", |_| {
            Reply::failure(127, "sh: wimlib-imagex: command not found")
        }));
        let svc = SplitService::new(runner, "wimlib-imagex");
        let err = svc
            .split(&source, dir.path(), 3800, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolMissing(_)));
    }

    #[tokio::test]
    async fn test_split_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("install.wim");
        fs::write(&source, b"wim").unwrap();

        let runner = Arc::new(ScriptedRunner::new().on("wimlib-imagex", |_| {
            Reply::failure(1, "ERROR: \"install.wim\" is not a WIM file")
        }));
        let svc = SplitService::new(runner, "wimlib-imagex");
        let err = svc
            .split(&source, dir.path(), 3800, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SplitFailed(ref m) if m.contains("not a WIM file")));
    }

    #[tokio::test]
    async fn test_info() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("install.wim");
        fs::write(&source, b"wim").unwrap();

        let runner = Arc::new(ScriptedRunner::new().on("wimlib-imagex", |_| {
            Reply::ok("Image Count:    6\nTotal Bytes:    1234\n")
        }));
        let svc = SplitService::new(runner, "wimlib-imagex");
        let info = svc.info(&source).await.unwrap();
        assert_eq!(info.image_count, 6);
        assert_eq!(info.total_bytes, 1234);

        let runner = Arc::new(ScriptedRunner::new().on("wimlib-imagex", |_| Reply::failure(1, "corrupt")));
        let svc = SplitService::new(runner, "wimlib-imagex");
        assert!(matches!(svc.info(&source).await, Err(Error::WimInfoFailed(_))));
    }
}
