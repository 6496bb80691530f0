//! Registry of driver-created temp files, reclaimed at phase end unless the
//! user asked to keep them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct TempFileRegistry {
    keep: bool,
    files: Vec<PathBuf>,
    counter: u64,
}

impl TempFileRegistry {
    pub fn new(keep: bool) -> TempFileRegistry {
        TempFileRegistry {
            keep,
            files: Vec::new(),
            counter: 0,
        }
    }

    pub fn keep_temps(&self) -> bool {
        self.keep
    }

    /// Create a fresh empty temp file and register it.
    pub fn create(&mut self, prefix: &str) -> Result<PathBuf> {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        for _ in 0..10_000 {
            let n = self.counter;
            self.counter += 1;
            let path = base.join(format!("{prefix}_{pid}_{n}"));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    self.files.push(path.clone());
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create temp file: {}", path.display()))
                }
            }
        }
        anyhow::bail!("failed to create unique temp file under {}", base.display())
    }

    /// Track a path created elsewhere so it is reclaimed with the rest.
    pub fn register(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    pub fn cleanup(&mut self) {
        let files = std::mem::take(&mut self.files);
        if self.keep {
            return;
        }
        for path in files {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for TempFileRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}
