use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{RegistryError, Result};
use crate::state::kinds::Stage;

use super::hash;

/// The on-disk asset tree: `<root>/<env_id>/<stage folder>/<file>`.
///
/// Stored paths are always relative to the environment folder, so a cloned
/// instance keeps the same `rel_path` and only the environment changes.
#[derive(Debug, Clone)]
pub struct AssetTree {
    root: PathBuf,
}

impl AssetTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_dir(&self, env_id: &str) -> PathBuf {
        self.root.join(env_id)
    }

    pub fn absolute(&self, env_id: &str, rel_path: &str) -> PathBuf {
        self.env_dir(env_id).join(rel_path)
    }

    pub fn exists(&self, env_id: &str, rel_path: &str) -> bool {
        self.absolute(env_id, rel_path).is_file()
    }

    /// Creates `<root>/<env_id>` with an empty folder per stage.
    /// Fails if the environment folder already exists.
    pub fn create_env_tree(&self, env_id: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let dir = self.env_dir(env_id);
        create_fresh_dir(&dir)?;
        for stage in Stage::ALL {
            fs::create_dir_all(dir.join(stage.folder()))?;
        }
        Ok(dir)
    }

    /// Writes a new file. Never overwrites an existing one.
    pub fn write_new(&self, env_id: &str, rel_path: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.absolute(env_id, rel_path);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(path)
    }

    pub fn remove_file(&self, env_id: &str, rel_path: &str) -> Result<()> {
        match fs::remove_file(self.absolute(env_id, rel_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the selected stage folders from one environment to a new one;
    /// unselected stages get an empty folder. Fails if the source tree is
    /// missing or the target already exists.
    pub fn clone_tree(
        &self,
        source_env: &str,
        target_env: &str,
        stages: &BTreeSet<Stage>,
    ) -> Result<PathBuf> {
        let source = self.env_dir(source_env);
        if !source.is_dir() {
            return Err(RegistryError::not_found(format!(
                "asset folder for environment '{}' ({})",
                source_env,
                source.display()
            )));
        }
        let target = self.env_dir(target_env);
        create_fresh_dir(&target)?;

        let copied = (|| -> Result<()> {
            for stage in Stage::ALL {
                let from = source.join(stage.folder());
                let to = target.join(stage.folder());
                if stages.contains(stage) && from.is_dir() {
                    copy_dir_all(&from, &to)?;
                } else {
                    fs::create_dir_all(&to)?;
                }
            }
            Ok(())
        })();

        if let Err(e) = copied {
            if let Err(cleanup) = fs::remove_dir_all(&target) {
                warn!(
                    path = %target.display(),
                    error = %cleanup,
                    "failed to remove partial tree copy"
                );
            }
            return Err(e);
        }
        Ok(target)
    }

    pub fn remove_env_tree(&self, env_id: &str) -> Result<()> {
        let dir = self.env_dir(env_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn hash_file(&self, env_id: &str, rel_path: &str) -> Result<String> {
        Ok(hash::hash_file(&self.absolute(env_id, rel_path))?)
    }

    /// Names of every environment folder directly under the root.
    pub fn env_folders(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = self.root.join("*");
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| RegistryError::Storage(format!("invalid asset root pattern: {}", e)))?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| RegistryError::Io(e.into()))?;
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn create_fresh_dir(dir: &Path) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(RegistryError::validation(
            format!("asset folder {} already exists", dir.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
