//! Hand-off of rendered programs to an external supervisor through files.
//!
//! Every routing key gets a directory; each program's configuration is
//! written to `<dir>/<key>/<program>.yml` atomically. Files of programs that
//! left the group are removed, and closing the stream removes the directory.

use super::{Stream, StreamFactory};
use crate::program::Program;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

pub struct FileStream {
    dir: PathBuf,
}

impl FileStream {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_program(&self, program: &Program) -> Result<()> {
        let contents = program
            .config
            .to_yaml_string()
            .with_context(|| format!("Failed to serialize program {}", program.name()))?;
        let target = self.dir.join(format!("{}.yml", program.name()));
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&target)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        debug!("Wrote {}", target.display());
        Ok(())
    }
}

#[async_trait]
impl Stream for FileStream {
    async fn execute(&self, programs: &[Program]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let mut wanted = HashSet::new();
        for program in programs {
            self.write_program(program)?;
            wanted.insert(format!("{}.yml", program.name()));
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".yml") && !wanted.contains(name) {
                std::fs::remove_file(&path)?;
                debug!("Removed {}", path.display());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)
                .with_context(|| format!("Failed to remove {}", self.dir.display()))?;
        }
        Ok(())
    }

    async fn perform_action(
        &self,
        program: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(anyhow!(
            "program {} is supervised through files and has no action endpoint",
            program
        ))
    }
}

/// Creates a [`FileStream`] per routing key under a common root
pub struct FileStreamFactory {
    root: PathBuf,
}

impl FileStreamFactory {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl StreamFactory for FileStreamFactory {
    fn create(&self, key: &str) -> Result<Arc<dyn Stream>> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(anyhow!("routing key '{}' is not a valid directory name", key));
        }
        Ok(Arc::new(FileStream::new(self.root.join(key))))
    }
}
