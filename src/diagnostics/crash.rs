//! Crash dumps: capture process state on panic or fatal error, keeping at
//! most `max_files` dumps on disk.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct CrashDumpWriter {
    dir: PathBuf,
    max_files: usize,
}

impl CrashDumpWriter {
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files: max_files.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one dump and rotate old ones out.
    pub fn write_dump(
        &self,
        kind: &str,
        detail: &str,
        workflow_id: Option<&str>,
        backtrace: &str,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let ts = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let path = self.dir.join(format!("crash-{}-{}.txt", ts, kind));
        let body = format!(
            "kind: {}\ntime: {}\npid: {}\nworkflow: {}\n\n{}\n\n--- backtrace ---\n{}\n",
            kind,
            Utc::now().to_rfc3339(),
            std::process::id(),
            workflow_id.unwrap_or("(none)"),
            detail,
            backtrace,
        );
        std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;

        self.rotate()?;
        Ok(path)
    }

    /// Remove the oldest dumps beyond the retention cap. Timestamped names
    /// sort chronologically.
    fn rotate(&self) -> Result<()> {
        let mut dumps: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .context("Failed to read crash dir")?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("crash-"))
                    .unwrap_or(false)
            })
            .collect();
        dumps.sort();

        while dumps.len() > self.max_files {
            let oldest = dumps.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                tracing::warn!(path = %oldest.display(), error = %e, "Crash dump rotation failed");
            }
        }
        Ok(())
    }

    /// Install a panic hook that writes a dump before the process dies. The
    /// previous hook still runs, so default panic output is preserved.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let detail = info.to_string();
            let backtrace = std::backtrace::Backtrace::force_capture().to_string();
            if let Err(e) = writer.write_dump("panic", &detail, None, &backtrace) {
                eprintln!("failed to write crash dump: {}", e);
            }
            previous(info);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dump_contains_state() {
        let dir = tempdir().unwrap();
        let writer = CrashDumpWriter::new(dir.path(), 5);

        let path = writer
            .write_dump("fatal", "the db vanished", Some("wf-1"), "frame 0\nframe 1")
            .unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("kind: fatal"));
        assert!(body.contains("workflow: wf-1"));
        assert!(body.contains("the db vanished"));
        assert!(body.contains("frame 1"));
    }

    #[test]
    fn rotation_keeps_newest_dumps() {
        let dir = tempdir().unwrap();
        let writer = CrashDumpWriter::new(dir.path(), 3);

        for i in 0..6 {
            writer
                .write_dump("panic", &format!("crash {}", i), None, "bt")
                .unwrap();
        }

        let dumps: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(dumps.len(), 3);

        // The newest crash survived rotation.
        let mut names: Vec<String> = dumps
            .iter()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        let newest = std::fs::read_to_string(dir.path().join(&names[2])).unwrap();
        assert!(newest.contains("crash 5"));
    }

    #[test]
    fn max_files_floor_is_one() {
        let dir = tempdir().unwrap();
        let writer = CrashDumpWriter::new(dir.path(), 0);
        writer.write_dump("panic", "a", None, "bt").unwrap();
        writer.write_dump("panic", "b", None, "bt").unwrap();

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }
}
