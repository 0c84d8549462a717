//! A sandboxed working directory for file-producing tools.
//!
//! Every path handed to a [`WorkDir`] is relative and confined to the root:
//! absolute paths and `..` traversal are rejected before touching the
//! filesystem.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// A rooted directory with guarded file operations.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Open (creating if needed) a working directory at `path`.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if path.exists() && !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", path.display()),
            ));
        }
        fs::create_dir_all(path)?;
        Ok(Self {
            root: path.canonicalize()?,
        })
    }

    /// The absolute root of the directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path inside the root. Rejects absolute paths and
    /// any `..` component.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> io::Result<PathBuf> {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is absolute, expected a relative path", relative.display()),
            ));
        }
        for component in relative.components() {
            if matches!(component, Component::ParentDir) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} escapes the working directory", relative.display()),
                ));
            }
        }
        Ok(self.root.join(relative))
    }

    /// Create a file with `content`, making parent directories as needed.
    /// Refuses to clobber an existing file unless `overwrite` is set.
    pub fn create_file(
        &self,
        relative: impl AsRef<Path>,
        content: &str,
        overwrite: bool,
    ) -> io::Result<()> {
        let path = self.resolve(relative)?;
        if path.exists() && !overwrite {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }

    /// Read a file's content.
    pub fn read_file(&self, relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(self.resolve(relative)?)
    }

    /// All file paths under the root, relative and sorted.
    pub fn list_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_files(&self.root, &self.root, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// Remove everything inside the root, keeping the root itself.
    pub fn clear(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}
